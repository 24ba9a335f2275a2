//! The typed message identifier.

use crate::snowflake::{EPOCH_MS, NODE_BITS, SEQUENCE_BITS};
use crate::IdError;

/// Identifier of a control-bus message.
///
/// Wraps the raw `i64` carried on the wire. `MessageId::RESERVED` (zero) is
/// never a valid message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(i64);

impl MessageId {
    /// The reserved id. Messages carrying it are always treated as seen.
    pub const RESERVED: Self = Self(0);

    /// Creates a MessageId from a raw i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Returns true for the reserved zero id.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.0 == 0
    }

    /// Unix timestamp in milliseconds encoded in a Snowflake id.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        ((self.0 as u64) >> (NODE_BITS + SEQUENCE_BITS)) + EPOCH_MS
    }

    /// Node field of a Snowflake id.
    #[must_use]
    pub fn node(&self) -> u16 {
        ((self.0 as u64 >> SEQUENCE_BITS) & ((1 << NODE_BITS) - 1)) as u16
    }

    /// Sequence field of a Snowflake id.
    #[must_use]
    pub fn sequence(&self) -> u16 {
        (self.0 as u64 & ((1 << SEQUENCE_BITS) - 1)) as u16
    }

    /// Parses an id from its decimal string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let id = s.parse::<i64>().map_err(|e| IdError::InvalidFormat {
            message: e.to_string(),
        })?;
        if id == 0 {
            return Err(IdError::Reserved);
        }
        Ok(Self(id))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<MessageId> for i64 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl serde::Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}
