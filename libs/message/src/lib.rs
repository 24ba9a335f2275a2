//! # vmfleet-message
//!
//! Message types exchanged between the fleet control plane and host agents.
//!
//! ## Envelope
//!
//! Every message shares one JSON envelope:
//!
//! ```text
//! { "id": <i64>, "action": <code>,
//!   "messagedata": { "name": <domain>, "event": <code> },
//!   "vmdata": { <VmSpec fields> } }
//! ```
//!
//! Only one of `messagedata` / `vmdata` is meaningful for a given action.
//!
//! ## Codes
//!
//! Actions and power events travel as integers. Downstream consumers decode
//! by value, so the assignments below are part of the wire contract:
//!
//! | Action        | Code |   | PowerEvent | Code | Outbound meaning |
//! |---------------|------|---|------------|------|------------------|
//! | ChangeState   | 0    |   | Unknown    | 0    |                  |
//! | AddDomain     | 1    |   | Startup    | 1    | running          |
//! | NewVmState    | 2    |   | Shutdown   | 2    |                  |
//! | DeleteDomain  | 3    |   | Reboot     | 3    |                  |
//! |               |      |   | Reset      | 4    |                  |
//! |               |      |   | Stop       | 5    | stopped          |

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::MessageError;
pub use types::*;

pub use vmfleet_id::MessageId;
