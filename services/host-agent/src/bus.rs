//! Message bus adapter.
//!
//! The agent consumes control messages from its per-host subject with queue
//! group `main`, and publishes power-state notifications. Transport is NATS.
//!
//! The bus gives at-least-once delivery and no ordering guarantee. Handlers
//! never ask for redelivery: every message counts as consumed once its
//! handler returns.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};
use vmfleet_message::{ControlMessage, MessageError};

/// Queue group shared by all consumers of a host's subject.
pub const QUEUE_GROUP: &str = "main";

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connect(String),

    #[error("bus publish error on {topic}: {message}")]
    Publish { topic: String, message: String },

    #[error("bus subscribe error on {topic}: {message}")]
    Subscribe { topic: String, message: String },

    #[error(transparent)]
    Encode(#[from] MessageError),
}

/// Consumer of raw inbound payloads.
///
/// `handle` has no error channel: whatever happens, the message is consumed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]);
}

/// Producer of outbound control messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &ControlMessage) -> Result<(), BusError>;
}

/// Configuration for the bus connection.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Server URL(s), comma separated.
    pub url: String,
    /// Client name reported to the server.
    pub name: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

/// NATS-backed bus client.
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Connect to the bus. Fails if the server cannot be reached.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout);

        let client = async_nats::connect_with_options(config.url.clone(), options)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        info!(url = %config.url, name = %config.name, "Connected to message bus");
        Ok(Self { client })
    }

    /// Consume `subject` until shutdown, feeding payloads to `handler`.
    ///
    /// At most `concurrency` handlers run at once. On shutdown no new
    /// messages are taken, and handlers already running finish.
    pub async fn serve<H>(
        &self,
        handler: Arc<H>,
        subject: &str,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), QUEUE_GROUP.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                topic: subject.to_string(),
                message: e.to_string(),
            })?;

        info!(
            subject,
            queue_group = QUEUE_GROUP,
            concurrency,
            "Consuming control messages"
        );

        subscriber
            .take_until(wait_for_shutdown(shutdown))
            .for_each_concurrent(concurrency.max(1), |message| {
                let handler = Arc::clone(&handler);
                async move {
                    handler.handle(&message.payload).await;
                }
            })
            .await;

        info!(subject, "Stopped consuming control messages");
        Ok(())
    }

    /// Flush buffered outbound messages.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(|e| BusError::Publish {
            topic: "*".to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Publisher for NatsBus {
    async fn publish(&self, topic: &str, message: &ControlMessage) -> Result<(), BusError> {
        let payload = message.encode()?;

        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic, id = %message.id, action = %message.action, "Published message");
        Ok(())
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Publisher that keeps messages in memory, for tests and dry runs.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, ControlMessage)>>,
    fail: bool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose every publish fails.
    pub fn failing() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Everything published so far, as `(topic, message)`.
    pub fn published(&self) -> Vec<(String, ControlMessage)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, message: &ControlMessage) -> Result<(), BusError> {
        if self.fail {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                message: "memory publisher configured to fail".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), message.clone()));
        Ok(())
    }
}
