//! Error types for identifier generation and parsing.

use thiserror::Error;

/// Errors that can occur when building generators or parsing IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The node id does not fit in the 10-bit node field.
    #[error("node id {node} out of range (max {max})")]
    NodeOutOfRange { node: u16, max: u16 },

    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not a valid signed 64-bit integer.
    #[error("invalid ID format: {message}")]
    InvalidFormat { message: String },

    /// The reserved zero ID was supplied where a real ID is required.
    #[error("ID 0 is reserved")]
    Reserved,
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
