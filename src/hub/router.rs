//! Envelope routing: unicast lookup, broadcast fan-out, and the error paths
//! back to the offending sender.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use crate::monitor::MetricsSink;
use crate::protocol::{
    ClientKind, Envelope, EnvelopeType, ErrorCode, ErrorPayload, Identity,
};

use super::auth::{Authenticator, Decision};
use super::session::{Session, SessionRegistry};

/// Routes validated envelopes from a source session to zero or more
/// recipients. Delivery is a queue push, never a network operation, so the
/// router holds registry shards only briefly and never across I/O.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    auth: Arc<dyn Authenticator>,
    metrics: Arc<dyn MetricsSink>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        auth: Arc<dyn Authenticator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            auth,
            metrics,
        }
    }

    /// Dispatches one inbound envelope from `source`.
    pub fn route(&self, envelope: Envelope, source: &Arc<Session>) {
        match envelope.kind {
            EnvelopeType::Heartbeat => {
                // Liveness evidence only; the reader already touched the
                // session. Never forwarded.
                self.metrics.counter_inc("hub.heartbeats_in", &[]);
            }
            EnvelopeType::Error => {
                self.metrics.counter_inc("hub.client_errors", &[]);
                warn!(
                    "client error from {}: {}",
                    source.identity,
                    envelope
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("<no message>")
                );
            }
            EnvelopeType::Message => self.route_message(envelope, source),
        }
    }

    fn route_message(&self, envelope: Envelope, source: &Arc<Session>) {
        // Sender must be the session's registered identity; the Hub never
        // rewrites it.
        if envelope.sender != source.identity {
            self.reject(
                source,
                &envelope,
                ErrorCode::ValidationError,
                "sender does not match the connection identity",
            );
            return;
        }

        if envelope.sender == envelope.recipient {
            self.reject(
                source,
                &envelope,
                ErrorCode::ValidationError,
                "envelope is addressed to its own sender",
            );
            return;
        }

        if self.auth.authorize(&envelope.sender, &envelope) == Decision::Deny {
            self.metrics.counter_inc("hub.permission_denied", &[]);
            self.reject(
                source,
                &envelope,
                ErrorCode::PermissionDenied,
                "sender is not permitted to send this envelope",
            );
            return;
        }

        if envelope.recipient.is_wildcard() {
            self.broadcast(envelope, source);
        } else {
            self.unicast(envelope, source);
        }
    }

    fn unicast(&self, envelope: Envelope, source: &Arc<Session>) {
        match self.registry.lookup(&envelope.recipient) {
            Some(target) => {
                debug!(
                    "routing {} -> {}",
                    envelope.sender, envelope.recipient
                );
                target.enqueue(envelope);
                self.metrics.counter_inc("hub.messages_routed", &[]);
            }
            None => {
                self.metrics.counter_inc("hub.no_recipient", &[]);
                self.reject(
                    source,
                    &envelope,
                    ErrorCode::RoutingNoRecipient,
                    format!("no session for {}", envelope.recipient),
                );
            }
        }
    }

    /// Fans out to every open session of the recipient kind, excluding the
    /// sender. Agent broadcasts from an environment are scoped to agents
    /// attached to that environment; all other broadcasts are global.
    fn broadcast(&self, envelope: Envelope, source: &Arc<Session>) {
        let targets: Vec<Arc<Session>> = if envelope.recipient.kind == ClientKind::Agent
            && source.identity.kind == ClientKind::Environment
        {
            self.registry
                .agents_in_env(&source.identity.id)
                .into_iter()
                .filter_map(|agent_id| self.registry.lookup(&Identity::agent(agent_id)))
                .collect()
        } else {
            self.registry.sessions_of_kind(envelope.recipient.kind)
        };

        let mut delivered = 0usize;
        for target in targets {
            if target.identity == source.identity || !target.is_open() {
                continue;
            }
            // Best-effort per recipient; one full queue never aborts the rest.
            target.enqueue(envelope.clone());
            delivered += 1;
        }

        debug!(
            "broadcast from {} to {} {} session(s)",
            source.identity, delivered, envelope.recipient.kind
        );
        self.metrics.counter_inc("hub.broadcasts", &[]);
    }

    fn reject(
        &self,
        source: &Arc<Session>,
        envelope: &Envelope,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        send_error(source, code, message, envelope.id.as_deref());
    }
}

/// Sends a structured error envelope back to a session, attaching the
/// offending envelope's trace id when it carried one.
pub(crate) fn send_error(
    session: &Arc<Session>,
    code: ErrorCode,
    message: impl Into<String>,
    original_message_id: Option<&str>,
) {
    let mut payload = ErrorPayload::new(code, message);
    if let Some(id) = original_message_id {
        payload = payload.with_detail("original_message_id", Value::String(id.to_string()));
    }
    session.enqueue(Envelope::error(session.identity.clone(), &payload));
}
