//! Local state persistence for the host agent.
//!
//! The domain cache records which VMs this host is responsible for, as a
//! single JSON file mapping domain id to its descriptor. It lets a restarted
//! agent re-assert its domains without asking the control plane.

mod cache;

pub use cache::{CacheError, DomainCache};
