//! Snowflake-style id generation.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{IdError, MessageId};

/// Custom epoch: 2020-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MS: u64 = 1_577_836_800_000;

pub(crate) const NODE_BITS: u32 = 10;
pub(crate) const SEQUENCE_BITS: u32 = 12;

/// Largest node id that fits the node field.
pub const MAX_NODE: u16 = (1 << NODE_BITS) - 1;

const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << 41) - 1;

#[derive(Debug, Default)]
struct State {
    last_ms: u64,
    sequence: u16,
}

/// Process-wide generator of unique, time-ordered message ids.
///
/// Ids from one generator are strictly increasing. When the wall clock steps
/// backwards the generator keeps counting from the last timestamp it issued,
/// and when a millisecond's 4096 sequence numbers are used up it moves on to
/// the next millisecond without waiting for the clock.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node: u16,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Create a generator for the given node id.
    pub fn new(node: u16) -> Result<Self, IdError> {
        if node > MAX_NODE {
            return Err(IdError::NodeOutOfRange {
                node,
                max: MAX_NODE,
            });
        }
        Ok(Self {
            node,
            state: Mutex::new(State::default()),
        })
    }

    /// Node id embedded in every generated id.
    pub fn node(&self) -> u16 {
        self.node
    }

    /// Generate a fresh id.
    pub fn generate(&self) -> MessageId {
        self.generate_at(now_ms())
    }

    fn generate_at(&self, wall_ms: u64) -> MessageId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut ts = wall_ms.saturating_sub(EPOCH_MS).max(state.last_ms);
        let sequence = if ts == state.last_ms {
            state.sequence.wrapping_add(1) & SEQUENCE_MASK
        } else {
            0
        };
        if sequence == 0 && ts == state.last_ms {
            // sequence exhausted for this millisecond
            ts += 1;
        }

        state.last_ms = ts;
        state.sequence = sequence;

        let raw = ((ts & TIMESTAMP_MASK) << (NODE_BITS + SEQUENCE_BITS))
            | (u64::from(self.node) << SEQUENCE_BITS)
            | u64::from(sequence);
        MessageId::new(raw as i64)
    }
}

/// Derive a stable node id from a host name (FNV-1a folded into 10 bits).
pub fn node_from_hostname(hostname: &str) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in hostname.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash % (u32::from(MAX_NODE) + 1)) as u16
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
