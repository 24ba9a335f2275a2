//! vmfleet host agent library.
//!
//! The host agent runs on each hypervisor host. It turns control messages
//! from the bus into domain lifecycle actions, and turns hypervisor
//! lifecycle events back into power-state messages.
//!
//! ## Architecture
//!
//! ```text
//! bus ──► Dispatcher ──► SeenIds
//!            ├─► Hypervisor   (ChangeState)
//!            ├─► Provisioner  (AddDomain, DeleteDomain)
//!            └─► DomainCache  (write-through JSON file)
//!
//! Hypervisor events ──► LifecycleBridge ──► Publisher ──► bus
//! ```
//!
//! ## Modules
//!
//! - `dispatcher`: inbound message pipeline
//! - `dedup`: duplicate message filter
//! - `state`: domain cache and its file
//! - `reconciler`: startup re-assertion of cached domains
//! - `lifecycle`: lifecycle event bridge
//! - `hypervisor`: libvirt control client
//! - `provision`: bridge and domain provisioning
//! - `bus`: NATS transport
//! - `agent`: startup ordering and task supervision

pub mod agent;
pub mod bus;
pub mod command;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod hypervisor;
pub mod lifecycle;
pub mod network;
pub mod provision;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use bus::{MemoryPublisher, MessageHandler, NatsBus, Publisher};
pub use dedup::SeenIds;
pub use dispatcher::{DispatchError, Dispatcher, Outcome};
pub use hypervisor::{Hypervisor, MockHypervisor, VirshHypervisor};
pub use lifecycle::LifecycleBridge;
pub use provision::{CommandProvisioner, MockProvisioner, Provisioner};
pub use reconciler::ReconcileReport;
pub use state::DomainCache;
