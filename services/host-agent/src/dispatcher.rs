//! Inbound control message dispatch.
//!
//! Each payload goes through the same pipeline:
//! 1. empty payloads are dropped
//! 2. the envelope is decoded
//! 3. the message id must pass the duplicate filter
//! 4. the action is applied
//!
//! Every payload ends up consumed: [`Dispatcher::dispatch`] reports an
//! [`Outcome`] for observability, and nothing is handed back for redelivery.
//!
//! AddDomain and DeleteDomain hold the cache lock for the whole of
//! provisioning, mutation and save, so concurrent handlers never interleave
//! a cache update with a file write.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn, Span};
use vmfleet_message::{Action, ControlMessage, MessageError, MessageId, PowerEvent, StateChange, VmSpec};

use crate::bus::MessageHandler;
use crate::dedup::SeenIds;
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::provision::{ProvisionError, Provisioner};
use crate::reconciler::{self, ReconcileReport};
use crate::state::{CacheError, DomainCache};

/// Why a message was not (fully) applied. None of these are retried.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("empty payload")]
    Empty,

    #[error("malformed message: {0}")]
    Malformed(#[source] MessageError),

    #[error("duplicate message {0}")]
    Duplicate(MessageId),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("unknown power event for domain {0}")]
    UnknownEvent(String),

    #[error("{0} without a domain id")]
    MissingDomainId(Action),

    #[error("{0} is outbound only")]
    OutboundOnly(Action),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    #[error(transparent)]
    Persistence(#[from] CacheError),
}

impl DispatchError {
    /// Log the error at the level its kind deserves.
    pub fn log(&self) {
        match self {
            DispatchError::Empty | DispatchError::OutboundOnly(_) => {
                debug!(reason = %self, "Message ignored")
            }
            DispatchError::Duplicate(id) => {
                info!(duplicate = true, id = %id, "Duplicate message discarded")
            }
            DispatchError::Malformed(_)
            | DispatchError::DomainNotFound(_)
            | DispatchError::UnknownEvent(_)
            | DispatchError::MissingDomainId(_) => warn!(reason = %self, "Message discarded"),
            DispatchError::Hypervisor(_)
            | DispatchError::Provisioning(_)
            | DispatchError::Persistence(_) => error!(error = %self, "Message failed"),
        }
    }
}

/// Result of dispatching one payload.
#[derive(Debug)]
pub enum Outcome {
    /// The action ran to completion.
    Applied(Action),
    /// The message was consumed without (fully) taking effect.
    Discarded(DispatchError),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    /// The discard reason, if any.
    pub fn error(&self) -> Option<&DispatchError> {
        match self {
            Outcome::Applied(_) => None,
            Outcome::Discarded(e) => Some(e),
        }
    }
}

/// Applies inbound control messages to the host.
pub struct Dispatcher {
    seen: SeenIds,
    cache: Mutex<DomainCache>,
    hypervisor: Arc<dyn Hypervisor>,
    provisioner: Arc<dyn Provisioner>,
}

impl Dispatcher {
    /// Create a dispatcher over a loaded cache.
    pub fn new(
        seen: SeenIds,
        cache: DomainCache,
        hypervisor: Arc<dyn Hypervisor>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            seen,
            cache: Mutex::new(cache),
            hypervisor,
            provisioner,
        }
    }

    /// Re-assert every cached domain. Holds the cache lock for the pass.
    pub async fn reconcile(&self) -> ReconcileReport {
        let cache = self.cache.lock().await;
        reconciler::reconcile(&cache, self.provisioner.as_ref()).await
    }

    /// Copy of the current cache contents.
    pub async fn cache_snapshot(&self) -> DomainCache {
        self.cache.lock().await.clone()
    }

    /// Decode, filter and apply one payload.
    #[instrument(skip_all, fields(message_id))]
    pub async fn dispatch(&self, payload: &[u8]) -> Outcome {
        match self.apply(payload).await {
            Ok(action) => {
                info!(action = %action, "Message applied");
                Outcome::Applied(action)
            }
            Err(e) => {
                e.log();
                Outcome::Discarded(e)
            }
        }
    }

    async fn apply(&self, payload: &[u8]) -> Result<Action, DispatchError> {
        if payload.is_empty() {
            return Err(DispatchError::Empty);
        }

        let message = ControlMessage::decode(payload).map_err(DispatchError::Malformed)?;
        Span::current().record("message_id", message.id.value());

        if !self.seen.admit(message.id) {
            return Err(DispatchError::Duplicate(message.id));
        }

        debug!(action = %message.action, "Dispatching message");

        if matches!(message.action, Action::AddDomain | Action::DeleteDomain)
            && message.vm_spec.id.is_empty()
        {
            return Err(DispatchError::MissingDomainId(message.action));
        }

        match message.action {
            Action::ChangeState => self.change_state(&message.state_change).await?,
            Action::AddDomain => self.add_domain(message.vm_spec).await?,
            Action::DeleteDomain => self.delete_domain(message.vm_spec).await?,
            Action::NewVmState => return Err(DispatchError::OutboundOnly(message.action)),
        }

        Ok(message.action)
    }

    async fn change_state(&self, change: &StateChange) -> Result<(), DispatchError> {
        if change.name.is_empty() {
            return Err(DispatchError::DomainNotFound(String::new()));
        }

        let domain = self.hypervisor.lookup(&change.name).await.map_err(|e| {
            if e.is_not_found() {
                DispatchError::DomainNotFound(change.name.clone())
            } else {
                DispatchError::Hypervisor(e)
            }
        })?;

        info!(domain = %domain.name, event = %change.event, "Changing domain state");

        match change.event {
            PowerEvent::Startup => self.hypervisor.start(&domain).await?,
            PowerEvent::Shutdown => self.hypervisor.shutdown(&domain).await?,
            PowerEvent::Reboot => self.hypervisor.reboot(&domain).await?,
            PowerEvent::Reset => self.hypervisor.reset(&domain).await?,
            PowerEvent::Stop => self.hypervisor.destroy(&domain).await?,
            PowerEvent::Unknown => return Err(DispatchError::UnknownEvent(domain.name)),
        }
        Ok(())
    }

    async fn add_domain(&self, spec: VmSpec) -> Result<(), DispatchError> {
        let mut cache = self.cache.lock().await;

        info!(domain = %spec.id, bridge = %spec.bridge_name(), "Provisioning domain");
        self.provisioner.ensure_bridge(&spec).await?;
        self.provisioner.ensure_domain(&spec).await?;

        let id = spec.id.clone();
        if cache.insert(spec).is_some() {
            debug!(domain = %id, "Replaced cached descriptor");
        }
        cache.save()?;

        info!(domain = %id, cached = cache.len(), "Domain added");
        Ok(())
    }

    async fn delete_domain(&self, spec: VmSpec) -> Result<(), DispatchError> {
        let mut cache = self.cache.lock().await;

        info!(domain = %spec.id, bridge = %spec.bridge_name(), "Removing domain");
        if let Err(e) = self.provisioner.remove_domain(&spec).await {
            warn!(domain = %spec.id, error = %e, "Domain teardown failed");
        }
        if let Err(e) = self.provisioner.remove_bridge(&spec).await {
            warn!(domain = %spec.id, bridge = %spec.bridge_name(), error = %e, "Bridge teardown failed");
        }

        if cache.remove(&spec.id).is_none() {
            debug!(domain = %spec.id, "Domain was not cached");
        }
        cache.save()?;

        info!(domain = %spec.id, cached = cache.len(), "Domain removed");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, payload: &[u8]) {
        self.dispatch(payload).await;
    }
}
