//! Configuration for the host agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vmfleet_id::{node_from_hostname, MAX_NODE};

use crate::hypervisor::VirshHypervisor;
use crate::provision::ProvisionConfig;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Message bus URL.
    pub bus_url: String,

    /// Prefix for bus topic names.
    pub topic_prefix: String,

    /// Domain cache file.
    pub cache_path: PathBuf,

    /// libvirt daemon socket.
    pub hypervisor_socket: PathBuf,

    /// Host name, used for the inbound topic.
    pub hostname: String,

    /// Snowflake node id for outbound message ids.
    ///
    /// Taken from `VMFLEET_NODE_ID`, else hashed from the host name into
    /// 1024 slots. Hashed ids collide between some host names, and two hosts
    /// sharing a node id can mint the same message id in the same
    /// millisecond. Set `VMFLEET_NODE_ID` to a unique value per host in any
    /// fleet beyond a handful of hosts.
    pub node_id: u16,

    /// Maximum number of inbound messages handled at once.
    pub dispatch_concurrency: usize,

    /// How long message ids are remembered (`None` = for the process life).
    pub dedup_window: Option<Duration>,

    /// Directory for per-domain disks.
    pub vm_dir: PathBuf,

    /// Directory of base images.
    pub image_dir: PathBuf,

    /// Directory for rendered cloud-init sources.
    pub scratch_dir: PathBuf,

    /// Guest architecture passed to virt-install.
    pub guest_arch: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    ///
    /// Without `VMFLEET_NODE_ID` the node id falls back to a host name hash,
    /// which is not unique across a large fleet.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let hostname = match lookup("VMFLEET_HOSTNAME") {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => system_hostname()?,
        };

        let node_id = match parse_var::<u16>(&lookup, "VMFLEET_NODE_ID")? {
            Some(node) if node > MAX_NODE => {
                bail!("VMFLEET_NODE_ID must be at most {MAX_NODE}, got {node}")
            }
            Some(node) => node,
            None => node_from_hostname(&hostname),
        };

        let dispatch_concurrency =
            parse_var::<usize>(&lookup, "VMFLEET_DISPATCH_CONCURRENCY")?.unwrap_or(1);
        if dispatch_concurrency == 0 {
            bail!("VMFLEET_DISPATCH_CONCURRENCY must be at least 1");
        }

        let dedup_window = match parse_var::<u64>(&lookup, "VMFLEET_DEDUP_WINDOW_SECS")? {
            Some(0) => bail!("VMFLEET_DEDUP_WINDOW_SECS must be positive"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(Self {
            bus_url: var("VMFLEET_BUS_URL", "nats://127.0.0.1:4222"),
            topic_prefix: var("VMFLEET_TOPIC_PREFIX", "vmfleet"),
            cache_path: var("VMFLEET_CACHE_PATH", "/var/lib/vmfleet/domains.json").into(),
            hypervisor_socket: var("VMFLEET_HYPERVISOR_SOCKET", "/var/run/libvirt/libvirt-sock")
                .into(),
            hostname,
            node_id,
            dispatch_concurrency,
            dedup_window,
            vm_dir: var("VMFLEET_VM_DIR", "/opt/vmfleet/vms").into(),
            image_dir: var("VMFLEET_IMAGE_DIR", "/opt/vmfleet/images").into(),
            scratch_dir: var("VMFLEET_SCRATCH_DIR", "/tmp").into(),
            guest_arch: var("VMFLEET_GUEST_ARCH", "aarch64"),
            log_level: var("VMFLEET_LOG_LEVEL", "info"),
        })
    }

    /// Topic this host consumes control messages from.
    pub fn inbound_topic(&self) -> String {
        format!("{}-{}", self.topic_prefix, self.hostname)
    }

    /// Topic power-state notifications are published to.
    pub fn power_topic(&self) -> String {
        format!("{}-power", self.topic_prefix)
    }

    /// libvirt connection URI for the configured socket.
    pub fn hypervisor_uri(&self) -> String {
        VirshHypervisor::connect_uri(&self.hypervisor_socket)
    }

    /// Provisioning settings derived from this configuration.
    pub fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            connect_uri: self.hypervisor_uri(),
            vm_dir: self.vm_dir.clone(),
            image_dir: self.image_dir.clone(),
            scratch_dir: self.scratch_dir.clone(),
            guest_arch: self.guest_arch.clone(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(None),
    }
}

/// Name of this host as reported by the kernel.
pub fn system_hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to read host name");
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).trim().to_string();
    if name.is_empty() {
        bail!("host name is empty");
    }
    Ok(name)
}
