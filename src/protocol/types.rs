//! Wire data types for the Star Protocol envelope and payload layers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Minimum length of a participant id.
pub const ID_MIN_LEN: usize = 3;

/// Maximum length of a participant id.
pub const ID_MAX_LEN: usize = 50;

/// Wildcard recipient id denoting broadcast within a kind.
pub const WILDCARD_ID: &str = "*";

/// Reserved id of the Hub itself.
pub const HUB_ID: &str = "hub";

/// Protocol major version carried in `Envelope::version`.
pub const PROTOCOL_VERSION: &str = "1";

/// Kind of a connected participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Hub,
    Agent,
    Environment,
    Human,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKind::Hub => write!(f, "hub"),
            ClientKind::Agent => write!(f, "agent"),
            ClientKind::Environment => write!(f, "environment"),
            ClientKind::Human => write!(f, "human"),
        }
    }
}

/// A participant identity: the `(kind, id)` pair naming one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ClientKind,
}

impl Identity {
    pub fn new(kind: ClientKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// The reserved identity of the Hub.
    pub fn hub() -> Self {
        Self::new(ClientKind::Hub, HUB_ID)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(ClientKind::Agent, id)
    }

    pub fn environment(id: impl Into<String>) -> Self {
        Self::new(ClientKind::Environment, id)
    }

    pub fn human(id: impl Into<String>) -> Self {
        Self::new(ClientKind::Human, id)
    }

    /// Broadcast target covering every open session of `kind`.
    pub fn broadcast(kind: ClientKind) -> Self {
        Self::new(kind, WILDCARD_ID)
    }

    /// True when this identity addresses a broadcast rather than a single
    /// session. Only legal in `Envelope::recipient`.
    pub fn is_wildcard(&self) -> bool {
        self.id == WILDCARD_ID
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Checks the id charset and length rules: 3-50 chars of `[A-Za-z0-9_-]`.
pub fn valid_id(id: &str) -> bool {
    (ID_MIN_LEN..=ID_MAX_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Outer envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Heartbeat,
    Message,
    Error,
}

/// The outer protocol unit: one envelope per transport text frame.
///
/// `payload` stays an untyped JSON value at this layer; the Hub is
/// content-agnostic about business payloads and only the client facades
/// interpret them through [`Payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub sender: Identity,
    pub recipient: Identity,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Unknown top-level fields, preserved but ignored.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, sender: Identity, recipient: Identity, payload: Value) -> Self {
        Self {
            kind,
            sender,
            recipient,
            payload,
            timestamp: None,
            id: Some(Uuid::new_v4().to_string()),
            version: Some(PROTOCOL_VERSION.to_string()),
            extra: Map::new(),
        }
    }

    /// Builds a `message` envelope carrying a business payload.
    pub fn message(sender: Identity, recipient: Identity, payload: &Payload) -> Self {
        let value = serde_json::to_value(payload).expect("payload serializes");
        Self::new(EnvelopeType::Message, sender, recipient, value)
    }

    /// Builds a Hub-originated heartbeat addressed to `recipient`.
    pub fn heartbeat(recipient: Identity) -> Self {
        let payload = serde_json::to_value(HeartbeatPayload::now()).expect("payload serializes");
        Self::new(EnvelopeType::Heartbeat, Identity::hub(), recipient, payload)
    }

    /// Builds a client-originated heartbeat, used as liveness evidence.
    pub fn heartbeat_from(sender: Identity) -> Self {
        let payload = serde_json::json!({
            "timestamp": now_timestamp(),
            "ping": "ping",
        });
        Self::new(EnvelopeType::Heartbeat, sender, Identity::hub(), payload)
    }

    /// Builds a Hub-originated error envelope addressed to `recipient`.
    pub fn error(recipient: Identity, payload: &ErrorPayload) -> Self {
        let value = serde_json::to_value(payload).expect("payload serializes");
        Self::new(EnvelopeType::Error, Identity::hub(), recipient, value)
    }
}

/// Current UTC instant in ISO-8601.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Inner business payload carried by `message` envelopes.
///
/// Action/event/stream names and their free-form fields are an open
/// vocabulary; only the structure is part of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Action(ActionPayload),
    Outcome(OutcomePayload),
    Event(EventPayload),
    Stream(StreamPayload),
}

impl Payload {
    /// Parses a payload value, failing on unknown or malformed variants.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// A request for the receiving party to do something.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ActionPayload {
    pub fn new(action: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            parameters,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The result of a previously issued action; `id` echoes the action id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomePayload {
    pub id: String,
    pub outcome: Value,
    pub outcome_type: String,
}

impl OutcomePayload {
    pub fn new(action_id: impl Into<String>, outcome: Value) -> Self {
        Self {
            id: action_id.into(),
            outcome,
            outcome_type: "dict".to_string(),
        }
    }

    /// The `status` field every outcome object carries.
    pub fn status(&self) -> Option<&str> {
        self.outcome.get("status").and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.status() == Some("success")
    }
}

/// A named occurrence pushed to interested parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: String,
    pub event: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EventPayload {
    pub fn new(event: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event: event.into(),
            data,
        }
    }
}

/// One element of a continuous per-sender stream.
///
/// `sequence` is monotonic non-decreasing per `(sender, stream_type)`; gaps
/// are the sender's admission of drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub stream_type: String,
    pub sequence: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StreamPayload {
    pub fn new(stream_type: impl Into<String>, sequence: u64, data: Map<String, Value>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            stream_type: stream_type.into(),
            sequence,
            data,
        }
    }
}

/// Payload of Hub-originated heartbeat envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: String,
    pub server_status: String,
    pub ping: String,
}

impl HeartbeatPayload {
    pub fn now() -> Self {
        Self {
            timestamp: now_timestamp(),
            server_status: "running".to_string(),
            ping: "pong".to_string(),
        }
    }
}

/// Payload of `error` envelopes; `error_code` is drawn from [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: super::error::ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ErrorPayload {
    pub fn new(error_code: super::error::ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_charset_and_length() {
        assert!(valid_id("abc"));
        assert!(valid_id("agent_1-x"));
        assert!(valid_id(&"a".repeat(50)));
        assert!(!valid_id("ab"));
        assert!(!valid_id(&"a".repeat(51)));
        assert!(!valid_id("has space"));
        assert!(!valid_id("émoji"));
        assert!(!valid_id("*"));
    }

    #[test]
    fn identity_wire_format() {
        let id = Identity::agent("a1-bot");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json, serde_json::json!({"id": "a1-bot", "type": "agent"}));
    }

    #[test]
    fn payload_discriminator_round_trip() {
        let action = Payload::Action(ActionPayload::new("move", Map::new()));
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "action");
        assert_eq!(Payload::from_value(&value).unwrap(), action);
    }

    #[test]
    fn unknown_payload_type_rejected() {
        let value = serde_json::json!({"type": "telemetry", "id": "x"});
        assert!(Payload::from_value(&value).is_err());
    }

    #[test]
    fn outcome_status_accessor() {
        let outcome = OutcomePayload::new("x1", serde_json::json!({"status": "success"}));
        assert!(outcome.is_success());
        let failed = OutcomePayload::new("x2", serde_json::json!({"status": "error"}));
        assert_eq!(failed.status(), Some("error"));
    }
}
