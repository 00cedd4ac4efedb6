//! Message Protocol
//!
//! Defines the envelopes exchanged between the agent and the controller.
//! Every frame is one JSON envelope; confidential payloads travel as the
//! lowercase hex of an RSA ciphertext whose plaintext is itself JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{Keypair, PeerKey};
use crate::error::{CryptoError, ProtocolError};
use crate::runtime::adapter::ContainerInfo;

/// Event names used on the wire
pub mod events {
    pub const HANDSHAKE: &str = "handshake";
    pub const AGENT_INFO: &str = "agentInfo";
    pub const AGENT_ID: &str = "agentId";
    pub const CONTAINER_LIST: &str = "containerList";
    pub const MONITOR: &str = "monitor";
    pub const LOG: &str = "log";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// One wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    pub event: String,

    #[serde(default)]
    pub data: Value,

    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    /// An `ok` envelope carrying `data`
    pub fn ok(event: &str, data: Value) -> Self {
        Self {
            status: Some(STATUS_OK.to_string()),
            event: event.to_string(),
            data,
            message_id: None,
        }
    }

    /// An `error` envelope with no payload
    pub fn error(event: &str) -> Self {
        Self {
            status: Some(STATUS_ERROR.to_string()),
            event: event.to_string(),
            data: Value::Null,
            message_id: None,
        }
    }

    /// Echo a correlation id from the request this envelope answers
    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    /// Our handshake reply, carrying the agent public key in the clear
    pub fn handshake(public_key_pem: &str) -> Self {
        Self::ok(events::HANDSHAKE, serde_json::json!({ "publicKey": public_key_pem }))
    }

    /// Keep-alive ping
    pub fn ping() -> Self {
        Self::ok(events::PING, serde_json::json!({}))
    }

    /// An `ok` envelope whose data is a sealed payload
    pub fn sealed(event: &str, payload: SealedPayload) -> Self {
        Self::ok(event, Value::String(payload.into_hex()))
    }

    /// Parse a text frame
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::MalformedFrame)
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Hex-encoded ciphertext as carried in `data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedPayload(String);

impl SealedPayload {
    /// JSON-encode `value` and encrypt it for the peer
    pub fn seal<T: Serialize>(value: &T, peer: &PeerKey) -> Result<Self, CryptoError> {
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = peer.encrypt(&plaintext)?;
        Ok(Self(hex::encode(ciphertext)))
    }

    /// Decrypt with our private key and decode the JSON plaintext
    pub fn open<T: DeserializeOwned>(&self, keypair: &Keypair) -> Result<T, CryptoError> {
        let ciphertext = hex::decode(&self.0)?;
        let plaintext = keypair.decrypt(&ciphertext)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub fn into_hex(self) -> String {
        self.0
    }
}

/// Events the controller sends to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Controller public key, sent in the clear
    Handshake(HandshakePayload),

    /// Request for the agent's token and hostname
    AgentInfo,

    /// Assigned agent id, sealed
    AgentId(SealedPayload),

    /// Request for the live container list
    ContainerList { message_id: Option<String> },

    /// Monitor directive set, sealed
    Monitor(SealedPayload),

    /// Answer to our keep-alive ping
    Pong,

    /// Any event name the agent has no handler for
    Unknown(String),
}

impl InboundEvent {
    /// Discriminate on the event name and decode the matching payload
    pub fn decode(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            events::HANDSHAKE => {
                let payload: HandshakePayload = payload(events::HANDSHAKE, envelope.data)?;
                if payload.public_key.trim().is_empty() {
                    return Err(ProtocolError::MalformedPayload {
                        event: events::HANDSHAKE,
                        reason: "empty publicKey".to_string(),
                    });
                }
                Ok(InboundEvent::Handshake(payload))
            }
            events::AGENT_INFO => Ok(InboundEvent::AgentInfo),
            events::AGENT_ID => Ok(InboundEvent::AgentId(payload(events::AGENT_ID, envelope.data)?)),
            events::CONTAINER_LIST => Ok(InboundEvent::ContainerList {
                message_id: envelope.message_id,
            }),
            events::MONITOR => Ok(InboundEvent::Monitor(payload(events::MONITOR, envelope.data)?)),
            events::PONG => Ok(InboundEvent::Pong),
            _ => Ok(InboundEvent::Unknown(envelope.event)),
        }
    }

    /// Parse a text frame straight into an event
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Self::decode(Envelope::from_json(json)?)
    }
}

fn payload<T: DeserializeOwned>(event: &'static str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::MalformedPayload {
        event,
        reason: e.to_string(),
    })
}

// Payloads

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Plaintext of the `agentInfo` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfoPayload {
    pub token: String,
    pub hostname: String,
}

/// Plaintext of the `agentId` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdPayload {
    #[serde(rename = "agentId")]
    pub agent_id: i64,
}

/// One entry of the `containerList` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
}

impl From<&ContainerInfo> for ContainerSummary {
    fn from(info: &ContainerInfo) -> Self {
        Self {
            id: info.id.clone(),
            names: info.names.clone(),
            image: info.image.clone(),
        }
    }
}

/// One monitor directive: a monitor id and a container name pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDirective {
    #[serde(alias = "monitorId")]
    pub id: i64,

    #[serde(alias = "namePattern")]
    pub pattern: String,
}

/// Plaintext of an outbound `log` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    #[serde(rename = "monitorId")]
    pub monitor_id: i64,

    #[serde(rename = "containerName")]
    pub container_name: String,

    pub lines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent_keypair, controller_keypair};

    #[test]
    fn test_envelope_omits_absent_fields() {
        let json = Envelope::ping().to_json().unwrap();
        assert_eq!(json, r#"{"status":"ok","event":"ping","data":{}}"#);

        let json = Envelope::error(events::CONTAINER_LIST)
            .with_message_id(Some("abc".into()))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""messageId":"abc""#));
        assert!(json.contains(r#""data":null"#));
    }

    #[test]
    fn test_decode_handshake() {
        let event = InboundEvent::from_json(
            r#"{"status":"ok","event":"handshake","data":{"publicKey":"PEM"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::Handshake(HandshakePayload {
                public_key: "PEM".into()
            })
        );
    }

    #[test]
    fn test_decode_handshake_without_key_is_rejected() {
        for frame in [
            r#"{"event":"handshake","data":{}}"#,
            r#"{"event":"handshake"}"#,
            r#"{"event":"handshake","data":{"publicKey":"  "}}"#,
        ] {
            assert!(matches!(
                InboundEvent::from_json(frame),
                Err(ProtocolError::MalformedPayload { event: "handshake", .. })
            ));
        }
    }

    #[test]
    fn test_decode_sealed_events_require_string_data() {
        let event = InboundEvent::from_json(r#"{"event":"monitor","data":"00ff"}"#).unwrap();
        assert_eq!(event, InboundEvent::Monitor(SealedPayload::from_hex("00ff")));

        assert!(InboundEvent::from_json(r#"{"event":"agentId","data":{"agentId":3}}"#).is_err());
    }

    #[test]
    fn test_decode_container_list_keeps_message_id() {
        let event =
            InboundEvent::from_json(r#"{"event":"containerList","messageId":"m-1"}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::ContainerList {
                message_id: Some("m-1".into())
            }
        );
    }

    #[test]
    fn test_decode_unknown_and_garbage() {
        assert_eq!(
            InboundEvent::from_json(r#"{"event":"reboot","data":null}"#).unwrap(),
            InboundEvent::Unknown("reboot".into())
        );
        assert!(matches!(
            InboundEvent::from_json("not json"),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            InboundEvent::from_json(r#"{"data":1}"#),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_seal_open_directives() {
        let directives = vec![MonitorDirective {
            id: 7,
            pattern: "^web".into(),
        }];
        let sealed = SealedPayload::seal(&directives, &agent_keypair().public_key()).unwrap();
        assert!(sealed.as_hex().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let opened: Vec<MonitorDirective> = sealed.open(agent_keypair()).unwrap();
        assert_eq!(opened, directives);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = SealedPayload::seal(&AgentIdPayload { agent_id: 1 }, &agent_keypair().public_key())
            .unwrap();
        assert!(sealed.open::<AgentIdPayload>(controller_keypair()).is_err());
        assert!(matches!(
            SealedPayload::from_hex("zz").open::<AgentIdPayload>(agent_keypair()),
            Err(CryptoError::Encoding(_))
        ));
    }

    #[test]
    fn test_directive_aliases() {
        let directives: Vec<MonitorDirective> =
            serde_json::from_str(r#"[{"monitorId":1,"namePattern":"db"},{"id":2,"pattern":"web"}]"#)
                .unwrap();
        assert_eq!(directives[0].id, 1);
        assert_eq!(directives[0].pattern, "db");
        assert_eq!(directives[1].pattern, "web");
    }

    #[test]
    fn test_log_payload_field_names() {
        let payload = LogPayload {
            monitor_id: 3,
            container_name: "web".into(),
            lines: vec!["a".into()],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"monitorId":3,"containerName":"web","lines":["a"]}"#);
    }
}
