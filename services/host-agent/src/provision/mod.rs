//! VM provisioning backend.
//!
//! The [`Provisioner`] trait is the seam between the dispatcher and the host
//! tooling that actually builds domains:
//! - `ensure_bridge` / `remove_bridge`: host bridge for the domain's NIC
//! - `ensure_domain` / `remove_domain`: disk, cloud-init image, definition
//!
//! Every operation is idempotent, so re-applying the same request after a
//! partial failure completes the remainder.
//!
//! [`CommandProvisioner`] drives the real tools; [`MockProvisioner`] records
//! calls for tests.

mod domain;
mod mock;
mod templates;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use vmfleet_message::VmSpec;

use crate::command::CommandError;
use crate::network::{self, BridgeConfig, BridgeError};

pub use domain::{cloud_localds_args, qemu_img_create_args, virt_install_args, DomainPaths};
pub use mock::{MockProvisioner, ProvisionCall};
pub use templates::{render_cloud_config, render_network_config};

/// Errors from provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("domain {domain}: {source}")]
    Command {
        domain: String,
        #[source]
        source: CommandError,
    },

    #[error("domain {domain}: failed to write {path}: {source}")]
    Io {
        domain: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid VM descriptor: {0}")]
    InvalidSpec(String),

    /// Injected failure from a test double.
    #[error("simulated failure: {0}")]
    Simulated(String),
}

/// Idempotent provisioning operations.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Ensure the domain's bridge exists and is up.
    async fn ensure_bridge(&self, spec: &VmSpec) -> Result<(), ProvisionError>;

    /// Ensure the domain is defined (building its disks if needed).
    async fn ensure_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError>;

    /// Ensure the domain is destroyed, undefined, and its disks removed.
    async fn remove_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError>;

    /// Ensure the domain's bridge is absent.
    async fn remove_bridge(&self, spec: &VmSpec) -> Result<(), ProvisionError>;
}

/// Paths and tooling options for [`CommandProvisioner`].
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// libvirt connection URI passed to `virsh -c`.
    pub connect_uri: String,
    /// Directory holding per-domain disks and cloud-init images.
    pub vm_dir: PathBuf,
    /// Directory holding base images (`<os_image>.qcow2`).
    pub image_dir: PathBuf,
    /// Directory for rendered cloud-init sources.
    pub scratch_dir: PathBuf,
    /// Guest architecture for `virt-install --arch`.
    pub guest_arch: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            connect_uri: "qemu:///system".to_string(),
            vm_dir: PathBuf::from("/opt/vmfleet/vms"),
            image_dir: PathBuf::from("/opt/vmfleet/images"),
            scratch_dir: PathBuf::from("/tmp"),
            guest_arch: "aarch64".to_string(),
        }
    }
}

/// Provisioner that shells out to `ip`, `virsh`, `qemu-img`, `cloud-localds`
/// and `virt-install`.
pub struct CommandProvisioner {
    config: ProvisionConfig,
}

impl CommandProvisioner {
    /// Create a new command provisioner.
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Provisioning configuration in use.
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn ensure_bridge(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        network::ensure_bridge(&BridgeConfig::from_spec(spec)).await?;
        Ok(())
    }

    async fn ensure_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        domain::ensure_domain(&self.config, spec).await
    }

    async fn remove_domain(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        domain::remove_domain(&self.config, spec).await
    }

    async fn remove_bridge(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        network::remove_bridge(&BridgeConfig::from_spec(spec)).await?;
        Ok(())
    }
}
