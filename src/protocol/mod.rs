//! The Star Protocol wire model: envelopes, payloads, codec and validation.

pub mod codec;
pub mod error;
pub mod types;
pub mod validation;

pub use error::{ErrorCode, ProtocolError};
pub use types::{
    ActionPayload, ClientKind, Envelope, EnvelopeType, ErrorPayload, EventPayload,
    HeartbeatPayload, Identity, OutcomePayload, Payload, StreamPayload,
};
