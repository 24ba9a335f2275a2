//! The control message envelope.

use serde::{Deserialize, Serialize};
use vmfleet_id::MessageId;

use crate::{Action, MessageError, PowerEvent, StateChange, VmSpec};

/// A message on the control bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawControlMessage")]
pub struct ControlMessage {
    /// Caller-assigned unique id. Zero is reserved.
    pub id: MessageId,

    /// What to do.
    pub action: Action,

    /// Power-state payload (`ChangeState`, `NewVmState`).
    #[serde(rename = "messagedata")]
    pub state_change: StateChange,

    /// VM descriptor payload (`AddDomain`, `DeleteDomain`).
    #[serde(rename = "vmdata")]
    pub vm_spec: VmSpec,
}

/// Wire shape before the action code is validated.
#[derive(Debug, Deserialize)]
struct RawControlMessage {
    #[serde(default)]
    id: MessageId,
    action: i64,
    #[serde(default)]
    messagedata: StateChange,
    #[serde(default)]
    vmdata: VmSpec,
}

impl TryFrom<RawControlMessage> for ControlMessage {
    type Error = MessageError;

    fn try_from(raw: RawControlMessage) -> Result<Self, Self::Error> {
        let action = Action::from_code(raw.action).ok_or(MessageError::UnknownAction(raw.action))?;
        Ok(Self {
            id: raw.id,
            action,
            state_change: raw.messagedata,
            vm_spec: raw.vmdata,
        })
    }
}

impl ControlMessage {
    /// Request a power-state change for a domain.
    pub fn change_state(id: MessageId, name: impl Into<String>, event: PowerEvent) -> Self {
        Self {
            id,
            action: Action::ChangeState,
            state_change: StateChange::new(name, event),
            vm_spec: VmSpec::default(),
        }
    }

    /// Request provisioning of a domain.
    pub fn add_domain(id: MessageId, spec: VmSpec) -> Self {
        Self {
            id,
            action: Action::AddDomain,
            state_change: StateChange::default(),
            vm_spec: spec,
        }
    }

    /// Request teardown of a domain.
    pub fn delete_domain(id: MessageId, spec: VmSpec) -> Self {
        Self {
            id,
            action: Action::DeleteDomain,
            state_change: StateChange::default(),
            vm_spec: spec,
        }
    }

    /// Outbound notification that a domain changed power state.
    pub fn new_vm_state(id: MessageId, name: impl Into<String>, event: PowerEvent) -> Self {
        Self {
            id,
            action: Action::NewVmState,
            state_change: StateChange::new(name, event),
            vm_spec: VmSpec::default(),
        }
    }

    /// Decode a message from a raw bus payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.is_empty() {
            return Err(MessageError::Empty);
        }
        let raw: RawControlMessage = serde_json::from_slice(payload)?;
        raw.try_into()
    }

    /// Encode the message as a JSON payload.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_change_state() {
        let payload = br#"{"id":17,"action":0,"messagedata":{"name":"vm-1","event":5}}"#;
        let msg = ControlMessage::decode(payload).unwrap();
        assert_eq!(msg.id, MessageId::new(17));
        assert_eq!(msg.action, Action::ChangeState);
        assert_eq!(msg.state_change.name, "vm-1");
        assert_eq!(msg.state_change.event, PowerEvent::Stop);
        assert_eq!(msg.vm_spec, VmSpec::default());
    }

    #[test]
    fn test_decode_add_domain() {
        let payload = br#"{
            "id": 9001,
            "action": 1,
            "vmdata": {
                "id": "vm-1",
                "os_image": "debian-12",
                "memory_gib": 4,
                "vcpus": 2,
                "disk_gib": 20,
                "console_password": 123456,
                "gateway_address": "fd00::1",
                "bridge_index": 7
            }
        }"#;
        let msg = ControlMessage::decode(payload).unwrap();
        assert_eq!(msg.action, Action::AddDomain);
        assert_eq!(msg.vm_spec.id, "vm-1");
        assert_eq!(msg.vm_spec.bridge_name(), "vbr7");
        assert_eq!(msg.vm_spec.console_password, 123456);
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(
            ControlMessage::decode(b""),
            Err(MessageError::Empty)
        ));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            ControlMessage::decode(b"{not json"),
            Err(MessageError::InvalidPayload(_))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"id":1}"#),
            Err(MessageError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_unknown_action() {
        assert!(matches!(
            ControlMessage::decode(br#"{"id":1,"action":12}"#),
            Err(MessageError::UnknownAction(12))
        ));
    }

    #[test]
    fn test_missing_id_decodes_as_reserved() {
        let msg = ControlMessage::decode(br#"{"action":3}"#).unwrap();
        assert!(msg.id.is_reserved());
    }

    #[test]
    fn test_new_vm_state_wire_shape() {
        let msg = ControlMessage::new_vm_state(MessageId::new(5), "vm-2", PowerEvent::RUNNING);
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["id"], 5);
        assert_eq!(value["action"], 2);
        assert_eq!(value["messagedata"]["name"], "vm-2");
        assert_eq!(value["messagedata"]["event"], 1);
        assert!(value["vmdata"].is_object());
    }

    proptest! {
        #[test]
        fn prop_encode_decode(id in 1i64..i64::MAX, event in 0i64..6, name in "[a-z0-9-]{1,16}") {
            let msg = ControlMessage::change_state(MessageId::new(id), name, PowerEvent::from_code(event));
            let decoded = ControlMessage::decode(&msg.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
