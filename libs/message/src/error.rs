//! Error types for message decoding.

use thiserror::Error;

/// Errors that can occur when decoding or encoding messages.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    /// The payload was empty.
    #[error("empty payload")]
    Empty,

    /// The action code is not part of the closed enumeration.
    #[error("unknown action code: {0}")]
    UnknownAction(i64),

    /// The payload is not a valid envelope.
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::InvalidPayload(err.to_string())
    }
}
