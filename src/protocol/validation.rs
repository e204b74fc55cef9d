//! Structural validation of decoded envelopes.
//!
//! Validation covers the envelope shape, identity rules, and the payload
//! discriminator plus per-variant required fields. Payload-level vocabulary
//! (action, event and stream names) is open and never checked here.

use serde_json::Value;

use super::error::ProtocolError;
use super::types::{valid_id, Envelope, EnvelopeType, Identity, Payload};

/// Validates one envelope. Checks run in order and stop at the first
/// violation; the caller turns the error into an `error` envelope for the
/// offending sender.
pub fn validate(envelope: &Envelope) -> Result<(), ProtocolError> {
    validate_identity(&envelope.sender, "sender", false)?;
    validate_identity(&envelope.recipient, "recipient", true)?;

    if envelope.kind == EnvelopeType::Message {
        validate_message_payload(&envelope.payload)?;
    }

    Ok(())
}

fn validate_identity(
    identity: &Identity,
    field: &'static str,
    wildcard_ok: bool,
) -> Result<(), ProtocolError> {
    if identity.id.is_empty() {
        return Err(ProtocolError::InvalidIdentity {
            field,
            reason: "id is empty".to_string(),
        });
    }
    if identity.is_wildcard() {
        if wildcard_ok {
            return Ok(());
        }
        return Err(ProtocolError::InvalidIdentity {
            field,
            reason: "wildcard id is only legal in recipient".to_string(),
        });
    }
    if !valid_id(&identity.id) {
        return Err(ProtocolError::InvalidIdentity {
            field,
            reason: format!("id {:?} violates the 3-50 char [A-Za-z0-9_-] rule", identity.id),
        });
    }
    Ok(())
}

fn validate_message_payload(payload: &Value) -> Result<(), ProtocolError> {
    if !payload.is_object() {
        return Err(ProtocolError::InvalidPayload(
            "message payload must be an object".to_string(),
        ));
    }

    let parsed =
        Payload::from_value(payload).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

    // The outcome object must carry a status field; its remaining shape is
    // up to the business layer.
    if let Payload::Outcome(outcome) = &parsed {
        match outcome.status() {
            Some("success") | Some("error") => {}
            Some(other) => {
                return Err(ProtocolError::InvalidPayload(format!(
                    "outcome status must be success or error, got {other:?}"
                )))
            }
            None => {
                return Err(ProtocolError::InvalidPayload(
                    "outcome object is missing a status field".to_string(),
                ))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{ActionPayload, EventPayload, OutcomePayload, StreamPayload};
    use serde_json::{json, Map};

    fn message(payload: &Payload) -> Envelope {
        Envelope::message(
            Identity::agent("a1-test"),
            Identity::environment("demo"),
            payload,
        )
    }

    #[test]
    fn well_formed_variants_pass() {
        for payload in [
            Payload::Action(ActionPayload::new("move", Map::new())),
            Payload::Outcome(OutcomePayload::new("x1", json!({"status": "success"}))),
            Payload::Event(EventPayload::new("tick", Map::new())),
            Payload::Stream(StreamPayload::new("telemetry", 0, Map::new())),
        ] {
            validate(&message(&payload)).unwrap();
        }
    }

    #[test]
    fn wildcard_sender_rejected() {
        let mut envelope = message(&Payload::Event(EventPayload::new("tick", Map::new())));
        envelope.sender = Identity::broadcast(crate::protocol::types::ClientKind::Agent);
        assert!(matches!(
            validate(&envelope),
            Err(ProtocolError::InvalidIdentity { field: "sender", .. })
        ));
    }

    #[test]
    fn wildcard_recipient_allowed() {
        let mut envelope = message(&Payload::Event(EventPayload::new("tick", Map::new())));
        envelope.recipient = Identity::broadcast(crate::protocol::types::ClientKind::Agent);
        validate(&envelope).unwrap();
    }

    #[test]
    fn bad_recipient_id_rejected() {
        let mut envelope = message(&Payload::Event(EventPayload::new("tick", Map::new())));
        envelope.recipient.id = "x".to_string();
        assert!(validate(&envelope).is_err());
        envelope.recipient.id = String::new();
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn unknown_discriminator_rejected() {
        let mut envelope = message(&Payload::Event(EventPayload::new("tick", Map::new())));
        envelope.payload = json!({"type": "telemetry", "id": "t1"});
        assert!(matches!(
            validate(&envelope),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn missing_variant_fields_rejected() {
        let mut envelope = message(&Payload::Event(EventPayload::new("tick", Map::new())));
        envelope.payload = json!({"type": "action", "id": "a1"});
        assert!(validate(&envelope).is_err());
        envelope.payload = json!({"type": "stream", "stream_type": "t"});
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn outcome_without_status_rejected() {
        let mut envelope = message(&Payload::Event(EventPayload::new("tick", Map::new())));
        envelope.payload = json!({
            "type": "outcome", "id": "x1", "outcome": {}, "outcome_type": "dict"
        });
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn heartbeat_payload_not_inspected() {
        let envelope = Envelope::heartbeat(Identity::agent("a1-test"));
        validate(&envelope).unwrap();
    }

    #[test]
    fn action_and_event_names_are_open_vocabulary() {
        let payload = Payload::Action(ActionPayload::new("warp_to_the_moon", Map::new()));
        validate(&message(&payload)).unwrap();
    }
}
