//! Bridge device creation and removal.
//!
//! Host-side setup for bridge `vbr<N>`:
//! - `ip link add vbr<N> type bridge`
//! - `ip addr add dev vbr<N> <gateway>/64`
//! - `ip link set dev vbr<N> up`
//!
//! All operations are idempotent: an existing bridge is only brought up, and
//! removing an absent bridge succeeds.

use thiserror::Error;
use tracing::{debug, info, warn};
use vmfleet_message::VmSpec;

use crate::command::{self, CommandError};

/// Bridge configuration derived from a VM descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Bridge index (`vbr<index>`).
    pub index: u32,
    /// Gateway address assigned to the host side.
    pub gateway: String,
    /// Prefix length of the gateway address.
    pub prefix_len: u8,
}

impl BridgeConfig {
    /// Create a new bridge configuration.
    pub fn new(index: u32, gateway: &str) -> Self {
        Self {
            index,
            gateway: gateway.to_string(),
            prefix_len: 64,
        }
    }

    /// Bridge configuration for a VM descriptor.
    pub fn from_spec(spec: &VmSpec) -> Self {
        Self::new(spec.bridge_index, &spec.gateway_address)
    }

    /// Get the bridge device name.
    pub fn name(&self) -> String {
        format!("vbr{}", self.index)
    }

    /// Gateway address in CIDR form.
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.prefix_len)
    }
}

/// Errors from bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to create bridge {bridge}: {source}")]
    CreateFailed {
        bridge: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to configure bridge {bridge}: {source}")]
    ConfigFailed {
        bridge: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to delete bridge {bridge}: {source}")]
    DeleteFailed {
        bridge: String,
        #[source]
        source: CommandError,
    },
}

/// Check whether a bridge device exists.
pub async fn bridge_exists(name: &str) -> bool {
    command::run_best_effort("ip", &["link", "show", "dev", name]).await
}

/// Ensure the bridge exists, carries the gateway address, and is up.
pub async fn ensure_bridge(config: &BridgeConfig) -> Result<(), BridgeError> {
    let name = config.name();

    if bridge_exists(&name).await {
        debug!(bridge = %name, "Bridge already present, ensuring it is up");
        return run_ip(&["link", "set", "dev", name.as_str(), "up"])
            .await
            .map_err(|source| BridgeError::ConfigFailed {
                bridge: name.clone(),
                source,
            });
    }

    info!(
        bridge = %name,
        gateway = %config.gateway_cidr(),
        "Creating bridge"
    );

    // A half-created device from an earlier attempt would make `add` fail.
    command::run_best_effort("ip", &["link", "del", name.as_str()]).await;

    run_ip(&["link", "add", name.as_str(), "type", "bridge"])
        .await
        .map_err(|source| BridgeError::CreateFailed {
            bridge: name.clone(),
            source,
        })?;

    if !config.gateway.is_empty() {
        let cidr = config.gateway_cidr();
        run_ip(&["addr", "add", "dev", name.as_str(), cidr.as_str()])
            .await
            .map_err(|source| BridgeError::ConfigFailed {
                bridge: name.clone(),
                source,
            })?;
    } else {
        warn!(bridge = %name, "No gateway address, bridge left unaddressed");
    }

    run_ip(&["link", "set", "dev", name.as_str(), "up"])
        .await
        .map_err(|source| BridgeError::ConfigFailed {
            bridge: name.clone(),
            source,
        })?;

    debug!(bridge = %name, "Bridge created and up");
    Ok(())
}

/// Remove a bridge device. Absent bridges are not an error.
pub async fn remove_bridge(config: &BridgeConfig) -> Result<(), BridgeError> {
    let name = config.name();

    if !bridge_exists(&name).await {
        debug!(bridge = %name, "Bridge already absent");
        return Ok(());
    }

    info!(bridge = %name, "Deleting bridge");
    run_ip(&["link", "del", name.as_str()])
        .await
        .map_err(|source| BridgeError::DeleteFailed {
            bridge: name.clone(),
            source,
        })?;

    debug!(bridge = %name, "Bridge deleted");
    Ok(())
}

async fn run_ip(args: &[&str]) -> Result<(), CommandError> {
    command::run("ip", args).await.map(|_| ())
}
