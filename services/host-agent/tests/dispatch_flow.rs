//! Integration tests for the inbound dispatch flow.
//!
//! These tests drive the dispatcher with raw bus payloads and check the
//! effects on the hypervisor, the provisioner and the cache file:
//! 1. Duplicate suppression
//! 2. AddDomain and DeleteDomain persistence
//! 3. Reconciliation after a restart
//!
//! Uses MockHypervisor and MockProvisioner in place of libvirt and host tools.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use vmfleet_host_agent::hypervisor::HypervisorCall;
use vmfleet_host_agent::provision::ProvisionCall;
use vmfleet_host_agent::{
    DispatchError, Dispatcher, DomainCache, MessageHandler, MockHypervisor, MockProvisioner,
    Outcome, SeenIds,
};
use vmfleet_message::{ControlMessage, MessageId, PowerEvent, VmSpec};

fn test_spec(id: &str, bridge_index: u32) -> VmSpec {
    VmSpec {
        id: id.to_string(),
        os_image: "debian-12".to_string(),
        memory_gib: 4,
        vcpus: 2,
        disk_gib: 20,
        console_password: 4242,
        gateway_address: "fd00::1".to_string(),
        bridge_index,
    }
}

fn dispatcher(
    cache_path: &Path,
    hypervisor: Arc<MockHypervisor>,
    provisioner: Arc<MockProvisioner>,
) -> Dispatcher {
    Dispatcher::new(
        SeenIds::unbounded(),
        DomainCache::load_or_empty(cache_path),
        hypervisor,
        provisioner,
    )
}

fn cache_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("state").join("domains.json")
}

fn encode(message: &ControlMessage) -> Vec<u8> {
    message.encode().unwrap()
}

/// Counts events logged with `duplicate = true`.
#[derive(Clone, Default)]
struct DuplicateCounter(Arc<AtomicUsize>);

struct DuplicateField(bool);

impl Visit for DuplicateField {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "duplicate" {
            self.0 = value;
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

impl<S: tracing::Subscriber> Layer<S> for DuplicateCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut field = DuplicateField(false);
        event.record(&mut field);
        if field.0 {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_duplicate_delivery_has_one_effect() {
    let counter = DuplicateCounter::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(MockProvisioner::new());
    let dispatcher = dispatcher(
        &cache_path(&dir),
        Arc::new(MockHypervisor::new()),
        provisioner.clone(),
    );

    let payload = encode(&ControlMessage::add_domain(
        MessageId::new(1001),
        test_spec("vm-1", 7),
    ));

    assert!(dispatcher.dispatch(&payload).await.is_applied());
    let second = dispatcher.dispatch(&payload).await;
    assert!(matches!(second, Outcome::Discarded(DispatchError::Duplicate(id)) if id.value() == 1001));

    assert_eq!(provisioner.call_count(), 2);
    assert_eq!(dispatcher.cache_snapshot().await.len(), 1);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reserved_id_rejected_for_every_action() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MockHypervisor::with_domains(["vm-1"]));
    let provisioner = Arc::new(MockProvisioner::new());
    let dispatcher = dispatcher(&cache_path(&dir), hypervisor.clone(), provisioner.clone());

    let messages = [
        ControlMessage::change_state(MessageId::RESERVED, "vm-1", PowerEvent::Startup),
        ControlMessage::add_domain(MessageId::RESERVED, test_spec("vm-1", 7)),
        ControlMessage::delete_domain(MessageId::RESERVED, test_spec("vm-1", 7)),
    ];
    for message in &messages {
        let outcome = dispatcher.dispatch(&encode(message)).await;
        assert!(matches!(outcome, Outcome::Discarded(DispatchError::Duplicate(_))));
    }

    // A payload without an id decodes to the reserved id.
    let outcome = dispatcher
        .dispatch(br#"{"action": 0, "messagedata": {"name": "vm-1", "event": 1}}"#)
        .await;
    assert!(matches!(outcome, Outcome::Discarded(DispatchError::Duplicate(_))));

    assert!(hypervisor.calls().is_empty());
    assert_eq!(provisioner.call_count(), 0);
    assert!(!cache_path(&dir).exists());
}

#[tokio::test]
async fn test_add_domain_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(&dir);

    {
        let dispatcher = dispatcher(
            &path,
            Arc::new(MockHypervisor::new()),
            Arc::new(MockProvisioner::new()),
        );
        let payload = encode(&ControlMessage::add_domain(MessageId::new(1), test_spec("vm-1", 7)));
        assert!(dispatcher.dispatch(&payload).await.is_applied());
    }

    let provisioner = Arc::new(MockProvisioner::new());
    let restarted = dispatcher(&path, Arc::new(MockHypervisor::new()), provisioner.clone());
    let report = restarted.reconcile().await;

    assert_eq!(report.total, 1);
    assert_eq!(report.bridges_ensured, 1);
    assert_eq!(report.domains_ensured, 1);
    assert_eq!(
        provisioner.calls(),
        vec![
            ProvisionCall::EnsureBridge("vbr7".to_string()),
            ProvisionCall::EnsureDomain("vm-1".to_string()),
        ]
    );
    assert_eq!(
        restarted.cache_snapshot().await.get("vm-1"),
        Some(&test_spec("vm-1", 7))
    );
}

#[tokio::test]
async fn test_corrupt_cache_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(&dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"{ definitely not json").unwrap();

    let provisioner = Arc::new(MockProvisioner::new());
    let dispatcher = dispatcher(&path, Arc::new(MockHypervisor::new()), provisioner.clone());

    let report = dispatcher.reconcile().await;
    assert_eq!(report.total, 0);
    assert_eq!(provisioner.call_count(), 0);
}

#[tokio::test]
async fn test_delete_absent_domain_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(&dir);
    let provisioner = Arc::new(MockProvisioner::new());
    let dispatcher = dispatcher(&path, Arc::new(MockHypervisor::new()), provisioner.clone());

    let payload = encode(&ControlMessage::delete_domain(MessageId::new(5), test_spec("vm-9", 9)));
    assert!(dispatcher.dispatch(&payload).await.is_applied());

    assert_eq!(
        provisioner.calls(),
        vec![
            ProvisionCall::RemoveDomain("vm-9".to_string()),
            ProvisionCall::RemoveBridge("vbr9".to_string()),
        ]
    );
    assert!(dispatcher.cache_snapshot().await.is_empty());
    assert!(DomainCache::load(&path).unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_unknown_domain_makes_no_control_call() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MockHypervisor::with_domains(["vm-1"]));
    let dispatcher = dispatcher(
        &cache_path(&dir),
        hypervisor.clone(),
        Arc::new(MockProvisioner::new()),
    );

    let payload = encode(&ControlMessage::change_state(
        MessageId::new(77),
        "vm-404",
        PowerEvent::Stop,
    ));
    let outcome = dispatcher.dispatch(&payload).await;

    assert!(matches!(outcome, Outcome::Discarded(DispatchError::DomainNotFound(_))));
    assert_eq!(
        hypervisor.calls(),
        vec![HypervisorCall::Lookup("vm-404".to_string())]
    );
    assert!(hypervisor.control_calls().is_empty());
}

#[tokio::test]
async fn test_handler_consumes_every_payload() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MockHypervisor::with_domains(["vm-1"]));
    let dispatcher = dispatcher(
        &cache_path(&dir),
        hypervisor.clone(),
        Arc::new(MockProvisioner::new()),
    );
    let handler: &dyn MessageHandler = &dispatcher;

    handler.handle(b"").await;
    handler.handle(b"garbage").await;
    handler
        .handle(&encode(&ControlMessage::change_state(
            MessageId::new(8),
            "vm-1",
            PowerEvent::Startup,
        )))
        .await;

    assert_eq!(
        hypervisor.control_calls(),
        vec![HypervisorCall::Start("vm-1".to_string())]
    );
}

#[tokio::test]
async fn test_concurrent_adds_keep_file_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(&dir);
    let dispatcher = Arc::new(dispatcher(
        &path,
        Arc::new(MockHypervisor::new()),
        Arc::new(MockProvisioner::new()),
    ));

    let handles: Vec<_> = (1..=8)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let spec = test_spec(&format!("vm-{i}"), i);
                let payload = encode(&ControlMessage::add_domain(MessageId::new(i as i64), spec));
                dispatcher.dispatch(&payload).await.is_applied()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let on_disk = DomainCache::load(&path).unwrap();
    assert_eq!(on_disk.len(), 8);
    for i in 1..=8 {
        assert_eq!(on_disk.get(&format!("vm-{i}")), Some(&test_spec(&format!("vm-{i}"), i)));
    }
    assert!(!path.with_file_name("domains.json.tmp").exists());
}
