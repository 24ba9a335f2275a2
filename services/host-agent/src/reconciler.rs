//! Startup reconciliation of cached domains.
//!
//! After the domain cache is loaded, every cached descriptor is re-asserted
//! against the host:
//! - the bridge is ensured to exist and be up
//! - the domain is ensured to exist
//!
//! The two steps are independent (an already-up bridge makes a failed bridge
//! step harmless), and no single failure aborts the pass.

use tracing::{debug, info, warn};

use crate::provision::Provisioner;
use crate::state::DomainCache;

/// Outcome counts of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Cached domains considered.
    pub total: usize,
    /// Bridges successfully ensured.
    pub bridges_ensured: usize,
    /// Domains successfully ensured.
    pub domains_ensured: usize,
}

impl ReconcileReport {
    /// True if every step of every entry succeeded.
    pub fn is_complete(&self) -> bool {
        self.bridges_ensured == self.total && self.domains_ensured == self.total
    }
}

/// Re-assert desired state for every cached domain.
pub async fn reconcile(cache: &DomainCache, provisioner: &dyn Provisioner) -> ReconcileReport {
    let mut report = ReconcileReport {
        total: cache.len(),
        ..Default::default()
    };

    info!(total = report.total, "Starting reconciliation");

    for spec in cache.specs() {
        match provisioner.ensure_bridge(spec).await {
            Ok(()) => report.bridges_ensured += 1,
            Err(e) => warn!(
                domain = %spec.id,
                bridge = %spec.bridge_name(),
                error = %e,
                "Failed to ensure bridge"
            ),
        }

        match provisioner.ensure_domain(spec).await {
            Ok(()) => {
                report.domains_ensured += 1;
                debug!(domain = %spec.id, "Domain ensured");
            }
            Err(e) => warn!(domain = %spec.id, error = %e, "Failed to ensure domain"),
        }
    }

    info!(
        total = report.total,
        bridges_ensured = report.bridges_ensured,
        domains_ensured = report.domains_ensured,
        "Reconciliation finished"
    );
    report
}
