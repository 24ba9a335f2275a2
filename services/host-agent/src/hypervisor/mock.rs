//! In-memory hypervisor for tests and development.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{Domain, Hypervisor, HypervisorError, LifecycleEvent};

/// A call observed by [`MockHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    Lookup(String),
    Start(String),
    Shutdown(String),
    Reboot(String),
    Reset(String),
    Destroy(String),
}

impl HypervisorCall {
    /// True for calls that change a domain's power state.
    pub fn is_control(&self) -> bool {
        !matches!(self, HypervisorCall::Lookup(_))
    }
}

/// Mock hypervisor: a fixed set of known domains, recorded calls, and an
/// injectable lifecycle event stream.
///
/// Like libvirt, events emitted before anyone subscribes are lost.
pub struct MockHypervisor {
    domains: Mutex<HashSet<String>>,
    calls: Mutex<Vec<HypervisorCall>>,
    fail_operations: AtomicBool,
    subscribed: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<LifecycleEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<LifecycleEvent>>>,
}

impl MockHypervisor {
    /// Create a mock hypervisor with no domains.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            domains: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            fail_operations: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        }
    }

    /// Create a mock hypervisor that knows the given domains.
    pub fn with_domains<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for name in names {
            mock.add_domain(name);
        }
        mock
    }

    /// Make every power operation fail.
    pub fn failing(self) -> Self {
        self.fail_operations.store(true, Ordering::SeqCst);
        self
    }

    /// Register a domain.
    pub fn add_domain(&self, name: impl Into<String>) {
        self.domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into());
    }

    /// Inject a lifecycle event. Dropped when nobody has subscribed yet.
    pub async fn emit(&self, event: LifecycleEvent) {
        if !self.subscribed.load(Ordering::SeqCst) {
            debug!(domain = %event.domain, kind = ?event.kind, "[MOCK] No subscriber, event lost");
            return;
        }
        let tx = self
            .events_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// End the lifecycle event stream.
    pub fn close_events(&self) {
        self.events_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Power-state calls so far (lookups excluded).
    pub fn control_calls(&self) -> Vec<HypervisorCall> {
        self.calls().into_iter().filter(HypervisorCall::is_control).collect()
    }

    fn record(&self, call: HypervisorCall) {
        info!(call = ?call, "[MOCK] Hypervisor call");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn operation_result(&self, domain: &Domain) -> Result<(), HypervisorError> {
        if self.fail_operations.load(Ordering::SeqCst) {
            return Err(HypervisorError::Simulated(domain.name.clone()));
        }
        Ok(())
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn lookup(&self, name: &str) -> Result<Domain, HypervisorError> {
        self.record(HypervisorCall::Lookup(name.to_string()));
        let known = self
            .domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name);
        if !known {
            return Err(HypervisorError::NotFound(name.to_string()));
        }
        Ok(Domain {
            name: name.to_string(),
            uuid: None,
        })
    }

    async fn start(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record(HypervisorCall::Start(domain.name.clone()));
        self.operation_result(domain)
    }

    async fn shutdown(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record(HypervisorCall::Shutdown(domain.name.clone()));
        self.operation_result(domain)
    }

    async fn reboot(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record(HypervisorCall::Reboot(domain.name.clone()));
        self.operation_result(domain)
    }

    async fn reset(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record(HypervisorCall::Reset(domain.name.clone()));
        self.operation_result(domain)
    }

    async fn destroy(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.record(HypervisorCall::Destroy(domain.name.clone()));
        self.operation_result(domain)
    }

    async fn lifecycle_events(
        &self,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<LifecycleEvent>, HypervisorError> {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| HypervisorError::EventStream("already subscribed".to_string()))?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(rx)
    }
}
