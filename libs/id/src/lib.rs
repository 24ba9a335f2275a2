//! # vmfleet-id
//!
//! Message identifiers for the vmfleet control bus.
//!
//! ## ID Format
//!
//! Every message on the bus carries a signed 64-bit Snowflake identifier:
//!
//! ```text
//!  63  62                                   22 21        12 11          0
//! +---+---------------------------------------+------------+-------------+
//! | 0 |  milliseconds since EPOCH_MS (41 bit) | node (10)  | seq (12)    |
//! +---+---------------------------------------+------------+-------------+
//! ```
//!
//! This format provides:
//! - Rough time ordering (timestamp is the most significant field)
//! - Uniqueness across hosts (node bits) and within a millisecond (sequence)
//! - A plain JSON integer on the wire
//!
//! The value `0` is reserved and is never produced by a generator.

mod error;
mod snowflake;
mod types;

pub use error::IdError;
pub use snowflake::{node_from_hostname, SnowflakeGenerator, EPOCH_MS, MAX_NODE};
pub use types::MessageId;
