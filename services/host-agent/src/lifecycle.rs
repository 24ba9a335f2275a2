//! Hypervisor lifecycle events to outbound power-state messages.
//!
//! `Started` is reported as running and `Stopped` as stopped. All other event
//! kinds are dropped. Each outbound message gets a fresh Snowflake id so the
//! receiving side can deduplicate.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vmfleet_id::SnowflakeGenerator;
use vmfleet_message::{ControlMessage, PowerEvent};

use crate::bus::Publisher;
use crate::hypervisor::{Hypervisor, HypervisorError, LifecycleEvent, LifecycleKind};

/// Outbound power event for a lifecycle event kind, if it is reported.
pub fn power_event_for(kind: LifecycleKind) -> Option<PowerEvent> {
    match kind {
        LifecycleKind::Started => Some(PowerEvent::RUNNING),
        LifecycleKind::Stopped => Some(PowerEvent::STOPPED),
        _ => None,
    }
}

/// Forwards lifecycle events to the power topic.
pub struct LifecycleBridge {
    hypervisor: Arc<dyn Hypervisor>,
    publisher: Arc<dyn Publisher>,
    ids: Arc<SnowflakeGenerator>,
    topic: String,
}

impl LifecycleBridge {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        publisher: Arc<dyn Publisher>,
        ids: Arc<SnowflakeGenerator>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            hypervisor,
            publisher,
            ids,
            topic: topic.into(),
        }
    }

    /// Consume the event stream until it ends or shutdown is signalled.
    ///
    /// Returns the number of messages published. Failing to subscribe is the
    /// only error; publish failures are logged and skipped.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<u64, HypervisorError> {
        let events = self.hypervisor.lifecycle_events(shutdown.clone()).await?;
        Ok(self.forward_all(events, shutdown).await)
    }

    /// Subscribe now, then forward events on a background task.
    ///
    /// Events raised after this returns are reported.
    pub async fn spawn(self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<u64>, HypervisorError> {
        let events = self.hypervisor.lifecycle_events(shutdown.clone()).await?;
        Ok(tokio::spawn(async move { self.forward_all(events, shutdown).await }))
    }

    async fn forward_all(
        &self,
        mut events: mpsc::Receiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        info!(topic = %self.topic, "Lifecycle bridge started");

        let mut published = 0u64;
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if self.forward(&event).await {
                                published += 1;
                            }
                        }
                        None => {
                            info!("Lifecycle event stream ended");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lifecycle bridge received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!(published, "Lifecycle bridge stopped");
        published
    }

    async fn forward(&self, event: &LifecycleEvent) -> bool {
        let Some(power) = power_event_for(event.kind) else {
            debug!(domain = %event.domain, kind = ?event.kind, "Ignoring lifecycle event");
            return false;
        };

        let message = ControlMessage::new_vm_state(self.ids.generate(), event.domain.as_str(), power);
        match self.publisher.publish(&self.topic, &message).await {
            Ok(()) => {
                info!(
                    domain = %event.domain,
                    event = %power,
                    id = %message.id,
                    "Published power state"
                );
                true
            }
            Err(e) => {
                warn!(domain = %event.domain, error = %e, "Failed to publish power state");
                false
            }
        }
    }
}
