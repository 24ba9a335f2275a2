//! Hypervisor control interface.
//!
//! The [`Hypervisor`] trait abstracts the local hypervisor connection:
//! - Domain lookup by name
//! - Power-state operations (start, graceful shutdown, reboot, reset, destroy)
//! - The lifecycle event stream
//!
//! [`VirshHypervisor`] talks to libvirt through `virsh`; [`MockHypervisor`]
//! is provided for tests and development.

mod mock;
mod virsh;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::command::CommandError;

pub use mock::{HypervisorCall, MockHypervisor};
pub use virsh::{parse_event_line, VirshHypervisor};

/// Handle to a domain known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Domain name.
    pub name: String,
    /// Domain UUID, when the hypervisor reports one.
    pub uuid: Option<String>,
}

/// Kind of a hypervisor lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PmSuspended,
    Crashed,
    Other,
}

impl LifecycleKind {
    /// Parse the event name libvirt prints (`Started`, `Stopped`, ...).
    pub fn from_name(name: &str) -> Self {
        match name {
            "Defined" => Self::Defined,
            "Undefined" => Self::Undefined,
            "Started" => Self::Started,
            "Suspended" => Self::Suspended,
            "Resumed" => Self::Resumed,
            "Stopped" => Self::Stopped,
            "Shutdown" => Self::Shutdown,
            "PMSuspended" => Self::PmSuspended,
            "Crashed" => Self::Crashed,
            _ => Self::Other,
        }
    }
}

/// A lifecycle notification for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub domain: String,
    pub kind: LifecycleKind,
}

impl LifecycleEvent {
    pub fn new(domain: impl Into<String>, kind: LifecycleKind) -> Self {
        Self {
            domain: domain.into(),
            kind,
        }
    }
}

/// Errors from hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("domain not found: {0}")]
    NotFound(String),

    #[error("hypervisor unreachable: {0}")]
    Unreachable(String),

    #[error("{operation} on {domain} failed: {source}")]
    Operation {
        operation: &'static str,
        domain: String,
        #[source]
        source: CommandError,
    },

    #[error("event stream failed: {0}")]
    EventStream(String),

    /// Injected failure from a test double.
    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl HypervisorError {
    /// Returns true if this error means the domain does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }
}

/// Hypervisor control interface.
///
/// One instance is shared by the dispatcher and the lifecycle bridge, so
/// implementations must tolerate concurrent calls.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Resolve a domain by name.
    async fn lookup(&self, name: &str) -> Result<Domain, HypervisorError>;

    /// Boot a defined domain.
    async fn start(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Ask the guest to shut down gracefully.
    async fn shutdown(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Ask the guest to reboot.
    async fn reboot(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Hard reset, like pressing the reset button.
    async fn reset(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Force the domain off immediately.
    async fn destroy(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Subscribe to lifecycle events.
    ///
    /// The returned channel closes when the underlying stream ends or when
    /// `shutdown` flips to true.
    async fn lifecycle_events(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<LifecycleEvent>, HypervisorError>;
}
