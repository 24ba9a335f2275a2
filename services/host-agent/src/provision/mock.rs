//! Recording provisioner for tests and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;
use vmfleet_message::VmSpec;

use super::{ProvisionError, Provisioner};

/// A provisioning call observed by [`MockProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    EnsureBridge(String),
    EnsureDomain(String),
    RemoveDomain(String),
    RemoveBridge(String),
}

/// Mock provisioner: records every call, optionally failing chosen steps.
#[derive(Default)]
pub struct MockProvisioner {
    calls: Mutex<Vec<ProvisionCall>>,
    fail_bridge: AtomicBool,
    fail_domain: AtomicBool,
    fail_remove: AtomicBool,
}

impl MockProvisioner {
    /// Create a mock provisioner where every step succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ensure_bridge` fail.
    pub fn failing_bridge(self) -> Self {
        self.fail_bridge.store(true, Ordering::SeqCst);
        self
    }

    /// Make `ensure_domain` fail.
    pub fn failing_domain(self) -> Self {
        self.fail_domain.store(true, Ordering::SeqCst);
        self
    }

    /// Make `remove_domain` and `remove_bridge` fail.
    pub fn failing_remove(self) -> Self {
        self.fail_remove.store(true, Ordering::SeqCst);
        self
    }

    /// Toggle `ensure_domain` failure after construction.
    pub fn set_fail_domain(&self, fail: bool) {
        self.fail_domain.store(fail, Ordering::SeqCst);
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn record(&self, call: ProvisionCall) {
        info!(call = ?call, "[MOCK] Provisioning call");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn outcome(flag: &AtomicBool, what: &str, spec: &VmSpec) -> Result<(), ProvisionError> {
        if flag.load(Ordering::SeqCst) {
            return Err(ProvisionError::Simulated(format!("{what} {}", spec.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn ensure_bridge(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::EnsureBridge(spec.bridge_name()));
        Self::outcome(&self.fail_bridge, "ensure_bridge", spec)
    }

    async fn ensure_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::EnsureDomain(spec.id.clone()));
        Self::outcome(&self.fail_domain, "ensure_domain", spec)
    }

    async fn remove_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::RemoveDomain(spec.id.clone()));
        Self::outcome(&self.fail_remove, "remove_domain", spec)
    }

    async fn remove_bridge(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::RemoveBridge(spec.bridge_name()));
        Self::outcome(&self.fail_remove, "remove_bridge", spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            id: "vm-1".to_string(),
            bridge_index: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockProvisioner::new();
        mock.ensure_bridge(&spec()).await.unwrap();
        mock.ensure_domain(&spec()).await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                ProvisionCall::EnsureBridge("vbr3".to_string()),
                ProvisionCall::EnsureDomain("vm-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_failing_domain() {
        let mock = MockProvisioner::new().failing_domain();
        assert!(mock.ensure_bridge(&spec()).await.is_ok());
        assert!(matches!(
            mock.ensure_domain(&spec()).await,
            Err(ProvisionError::Simulated(_))
        ));
        mock.set_fail_domain(false);
        assert!(mock.ensure_domain(&spec()).await.is_ok());
    }
}
