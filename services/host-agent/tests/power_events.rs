//! Integration tests for power-state reporting.
//!
//! Lifecycle events injected into MockHypervisor should come out of the
//! bridge as NewVmState messages on the power topic, encoded the way
//! downstream consumers decode them. The mock drops events emitted before
//! the bridge subscribes, as libvirt does.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use vmfleet_host_agent::hypervisor::{LifecycleEvent, LifecycleKind};
use vmfleet_host_agent::provision::ProvisionError;
use vmfleet_host_agent::{
    agent, DomainCache, Dispatcher, LifecycleBridge, MemoryPublisher, MockHypervisor, Provisioner,
    SeenIds,
};
use vmfleet_id::SnowflakeGenerator;
use vmfleet_message::{Action, ControlMessage, PowerEvent, VmSpec};

const POWER_TOPIC: &str = "vmfleet-power";

fn test_bridge(
    hypervisor: Arc<MockHypervisor>,
    publisher: Arc<MemoryPublisher>,
    ids: Arc<SnowflakeGenerator>,
) -> LifecycleBridge {
    LifecycleBridge::new(hypervisor, publisher, ids, POWER_TOPIC)
}

#[tokio::test]
async fn test_started_event_publishes_running() {
    let hypervisor = Arc::new(MockHypervisor::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let ids = Arc::new(SnowflakeGenerator::new(3).unwrap());
    let before = ids.generate();

    let bridge = test_bridge(hypervisor.clone(), publisher.clone(), ids.clone());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = bridge.spawn(shutdown_rx).await.unwrap();

    hypervisor
        .emit(LifecycleEvent::new("vm-2", LifecycleKind::Started))
        .await;
    hypervisor.close_events();
    assert_eq!(handle.await.unwrap(), 1);

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    let (topic, message) = &published[0];
    assert_eq!(topic, POWER_TOPIC);
    assert_eq!(message.action, Action::NewVmState);
    assert_eq!(message.state_change.name, "vm-2");
    assert_eq!(message.state_change.event, PowerEvent::RUNNING);
    assert!(message.id > before);
    assert_eq!(message.id.node(), 3);

    // Wire shape seen by consumers.
    let wire: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
    assert_eq!(wire["action"], 2);
    assert_eq!(wire["messagedata"]["name"], "vm-2");
    assert_eq!(wire["messagedata"]["event"], 1);
    assert_eq!(ControlMessage::decode(&message.encode().unwrap()).unwrap(), *message);
}

#[tokio::test]
async fn test_only_start_and_stop_are_reported() {
    let hypervisor = Arc::new(MockHypervisor::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let bridge = test_bridge(
        hypervisor.clone(),
        publisher.clone(),
        Arc::new(SnowflakeGenerator::new(0).unwrap()),
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = bridge.spawn(shutdown_rx).await.unwrap();

    for kind in [
        LifecycleKind::Defined,
        LifecycleKind::Started,
        LifecycleKind::Suspended,
        LifecycleKind::Resumed,
        LifecycleKind::Shutdown,
        LifecycleKind::Stopped,
        LifecycleKind::Crashed,
        LifecycleKind::Undefined,
    ] {
        hypervisor.emit(LifecycleEvent::new("vm-5", kind)).await;
    }
    hypervisor.close_events();
    assert_eq!(handle.await.unwrap(), 2);

    let events: Vec<i64> = publisher
        .published()
        .iter()
        .map(|(_, m)| m.state_change.event.code())
        .collect();
    assert_eq!(events, vec![1, 5]);
}

#[tokio::test]
async fn test_ids_are_unique_across_events() {
    let hypervisor = Arc::new(MockHypervisor::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let bridge = test_bridge(
        hypervisor.clone(),
        publisher.clone(),
        Arc::new(SnowflakeGenerator::new(9).unwrap()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = bridge.spawn(shutdown_rx).await.unwrap();

    for i in 0..50 {
        let kind = if i % 2 == 0 {
            LifecycleKind::Started
        } else {
            LifecycleKind::Stopped
        };
        hypervisor.emit(LifecycleEvent::new(format!("vm-{i}"), kind)).await;
    }
    hypervisor.close_events();

    assert_eq!(handle.await.unwrap(), 50);
    drop(shutdown_tx);

    let ids: Vec<_> = publisher.published().iter().map(|(_, m)| m.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

/// Provisioner whose domains boot as soon as they are defined.
struct BootingProvisioner {
    hypervisor: Arc<MockHypervisor>,
}

#[async_trait]
impl Provisioner for BootingProvisioner {
    async fn ensure_bridge(&self, _spec: &VmSpec) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn ensure_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        self.hypervisor.add_domain(spec.id.clone());
        self.hypervisor
            .emit(LifecycleEvent::new(spec.id.clone(), LifecycleKind::Started))
            .await;
        Ok(())
    }

    async fn remove_domain(&self, _spec: &VmSpec) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn remove_bridge(&self, _spec: &VmSpec) -> Result<(), ProvisionError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_domains_booted_by_reconcile_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("domains.json");
    let mut cache = DomainCache::empty(&path);
    cache.insert(VmSpec {
        id: "vm-1".to_string(),
        bridge_index: 3,
        ..VmSpec::default()
    });
    cache.save().unwrap();

    let hypervisor = Arc::new(MockHypervisor::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let dispatcher = Dispatcher::new(
        SeenIds::unbounded(),
        DomainCache::load_or_empty(&path),
        hypervisor.clone(),
        Arc::new(BootingProvisioner {
            hypervisor: hypervisor.clone(),
        }),
    );
    let bridge = test_bridge(
        hypervisor.clone(),
        publisher.clone(),
        Arc::new(SnowflakeGenerator::new(1).unwrap()),
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, report) = agent::start(bridge, &dispatcher, shutdown_rx).await.unwrap();
    assert!(report.is_complete());

    hypervisor.close_events();
    assert_eq!(handle.await.unwrap(), 1);

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.state_change.name, "vm-1");
    assert_eq!(published[0].1.state_change.event, PowerEvent::RUNNING);
}
