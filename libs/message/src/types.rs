//! Action codes, power events and the VM descriptor.

use serde::{Deserialize, Serialize};

// =============================================================================
// Action
// =============================================================================

/// What a control message asks the receiver to do.
///
/// This is a closed enumeration: an unknown code makes the whole message
/// undecodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Change the power state of an existing domain.
    ChangeState,
    /// Provision a domain (and its bridge) and start tracking it.
    AddDomain,
    /// Outbound notification of a domain's new power state.
    NewVmState,
    /// Tear a domain down and stop tracking it.
    DeleteDomain,
}

impl Action {
    /// Wire code for this action.
    pub const fn code(&self) -> i64 {
        match self {
            Action::ChangeState => 0,
            Action::AddDomain => 1,
            Action::NewVmState => 2,
            Action::DeleteDomain => 3,
        }
    }

    /// Look up an action by wire code.
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Action::ChangeState),
            1 => Some(Action::AddDomain),
            2 => Some(Action::NewVmState),
            3 => Some(Action::DeleteDomain),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::ChangeState => "change_state",
            Action::AddDomain => "add_domain",
            Action::NewVmState => "new_vm_state",
            Action::DeleteDomain => "delete_domain",
        };
        write!(f, "{}", s)
    }
}

impl Serialize for Action {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = i64::deserialize(deserializer)?;
        Action::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown action code: {code}")))
    }
}

// =============================================================================
// Power events
// =============================================================================

/// Power-state event carried in `messagedata.event`.
///
/// Inbound, it names the control operation to apply. Outbound, `Startup`
/// reports "running" and `Stop` reports "stopped".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerEvent {
    /// Unrecognized or absent event code.
    #[default]
    Unknown,
    Startup,
    Shutdown,
    Reboot,
    Reset,
    Stop,
}

impl PowerEvent {
    /// Outbound code meaning the domain is running.
    pub const RUNNING: Self = PowerEvent::Startup;

    /// Outbound code meaning the domain is stopped.
    pub const STOPPED: Self = PowerEvent::Stop;

    /// Wire code for this event.
    pub const fn code(&self) -> i64 {
        match self {
            PowerEvent::Unknown => 0,
            PowerEvent::Startup => 1,
            PowerEvent::Shutdown => 2,
            PowerEvent::Reboot => 3,
            PowerEvent::Reset => 4,
            PowerEvent::Stop => 5,
        }
    }

    /// Decode a wire code. Anything unrecognized becomes `Unknown`.
    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => PowerEvent::Startup,
            2 => PowerEvent::Shutdown,
            3 => PowerEvent::Reboot,
            4 => PowerEvent::Reset,
            5 => PowerEvent::Stop,
            _ => PowerEvent::Unknown,
        }
    }
}

impl std::fmt::Display for PowerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerEvent::Unknown => "unknown",
            PowerEvent::Startup => "startup",
            PowerEvent::Shutdown => "shutdown",
            PowerEvent::Reboot => "reboot",
            PowerEvent::Reset => "reset",
            PowerEvent::Stop => "stop",
        };
        write!(f, "{}", s)
    }
}

impl Serialize for PowerEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for PowerEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = i64::deserialize(deserializer)?;
        Ok(PowerEvent::from_code(code))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `messagedata`: which domain, and what happened / should happen to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateChange {
    /// Domain name.
    pub name: String,
    /// Power event code.
    pub event: PowerEvent,
}

impl StateChange {
    pub fn new(name: impl Into<String>, event: PowerEvent) -> Self {
        Self {
            name: name.into(),
            event,
        }
    }
}

/// `vmdata`: the durable descriptor of a provisioned VM.
///
/// This is what the domain cache stores and what the provisioning backend
/// consumes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    /// Domain name, unique across the fleet.
    pub id: String,
    /// Base image name (`<image_dir>/<os_image>.qcow2`).
    pub os_image: String,
    pub memory_gib: u32,
    pub vcpus: u32,
    pub disk_gib: u32,
    /// Numeric console password, stored in the domain description.
    pub console_password: i64,
    /// IPv6 gateway assigned to the host side of the bridge.
    pub gateway_address: String,
    /// Index `N` of the `vbrN` bridge the domain attaches to.
    pub bridge_index: u32,
}

impl VmSpec {
    /// Name of the host bridge this domain's NIC attaches to.
    pub fn bridge_name(&self) -> String {
        format!("vbr{}", self.bridge_index)
    }
}
