//! libvirt control through `virsh`.
//!
//! Every call runs `virsh -c qemu+unix:///system?socket=<path> ...`, so the
//! client holds no connection state and is safe to share between the
//! dispatcher and the lifecycle bridge.
//!
//! Lifecycle events come from a long-running
//! `virsh event --all --loop --event lifecycle` child whose stdout lines look
//! like:
//!
//! ```text
//! event 'lifecycle' for domain 'vm-1': Started Booted
//! ```

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Domain, Hypervisor, HypervisorError, LifecycleEvent, LifecycleKind};
use crate::command::{self, CommandError};

const EVENT_PREFIX: &str = "event 'lifecycle' for domain '";

/// Buffered lifecycle events before the reader waits on the bridge.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Hypervisor client backed by the `virsh` CLI.
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    uri: String,
}

impl VirshHypervisor {
    /// libvirt connection URI for a local daemon socket.
    pub fn connect_uri(socket: &Path) -> String {
        format!("qemu+unix:///system?socket={}", socket.display())
    }

    /// Connect to the libvirt daemon listening on `socket`.
    ///
    /// Fails if the daemon cannot be reached.
    pub async fn connect(socket: &Path) -> Result<Self, HypervisorError> {
        let client = Self {
            uri: Self::connect_uri(socket),
        };

        let version = command::run("virsh", &client.args(&["version", "--daemon"]))
            .await
            .map_err(|e| HypervisorError::Unreachable(e.to_string()))?;

        info!(
            uri = %client.uri,
            version = %version.lines().last().unwrap_or_default().trim(),
            "Connected to libvirt"
        );
        Ok(client)
    }

    /// Connection URI used for every call.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn args(&self, args: &[&str]) -> Vec<String> {
        let mut full = vec!["-c".to_string(), self.uri.clone()];
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    async fn domain_op(&self, operation: &'static str, domain: &Domain) -> Result<(), HypervisorError> {
        debug!(domain = %domain.name, operation, "Applying domain operation");
        command::run("virsh", &self.args(&[operation, domain.name.as_str()]))
            .await
            .map(|_| ())
            .map_err(|source| classify(operation, &domain.name, source))
    }
}

fn classify(operation: &'static str, domain: &str, source: CommandError) -> HypervisorError {
    let not_found = matches!(
        &source,
        CommandError::Failed { output, .. }
            if output.contains("failed to get domain") || output.contains("Domain not found")
    );

    if not_found {
        HypervisorError::NotFound(domain.to_string())
    } else if matches!(source, CommandError::Spawn { .. }) {
        HypervisorError::Unreachable(source.to_string())
    } else {
        HypervisorError::Operation {
            operation,
            domain: domain.to_string(),
            source,
        }
    }
}

/// Parse one line of `virsh event` output.
///
/// Returns `None` for lines that are not lifecycle events.
pub fn parse_event_line(line: &str) -> Option<LifecycleEvent> {
    let start = line.find(EVENT_PREFIX)?;
    let rest = &line[start + EVENT_PREFIX.len()..];
    let (name, detail) = rest.rsplit_once("': ")?;
    let kind = detail.split_whitespace().next()?;
    Some(LifecycleEvent::new(name, LifecycleKind::from_name(kind)))
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn lookup(&self, name: &str) -> Result<Domain, HypervisorError> {
        if name.is_empty() {
            return Err(HypervisorError::NotFound(String::new()));
        }
        let uuid = command::run("virsh", &self.args(&["domuuid", name]))
            .await
            .map_err(|source| classify("lookup", name, source))?;
        let uuid = uuid.trim();

        Ok(Domain {
            name: name.to_string(),
            uuid: (!uuid.is_empty()).then(|| uuid.to_string()),
        })
    }

    async fn start(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("start", domain).await
    }

    async fn shutdown(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("shutdown", domain).await
    }

    async fn reboot(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("reboot", domain).await
    }

    async fn reset(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("reset", domain).await
    }

    async fn destroy(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("destroy", domain).await
    }

    async fn lifecycle_events(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<LifecycleEvent>, HypervisorError> {
        let mut child = Command::new("virsh")
            .args(self.args(&["event", "--all", "--loop", "--event", "lifecycle"]))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HypervisorError::EventStream(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HypervisorError::EventStream("event stream has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Some(event) = parse_event_line(&line) else {
                                continue;
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!("virsh event stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read virsh event stream");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = child.kill().await {
                debug!(error = %e, "virsh event process already exited");
            }
            info!("Lifecycle event stream closed");
        });

        Ok(rx)
    }
}
