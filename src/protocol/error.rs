//! Protocol error taxonomy with stable wire codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::ErrorPayload;

/// Stable error codes carried in `error` envelopes and surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transport
    ConnectionFailed,
    ConnectionLost,
    ReconnectionFailed,
    // Validation
    ValidationError,
    InvalidClientType,
    // Authorization
    PermissionDenied,
    // Routing
    RoutingNoRecipient,
    // Liveness
    IdleTimeout,
    Replaced,
    // Client correlation
    Timeout,
    // Opaque upstream
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ReconnectionFailed => "RECONNECTION_FAILED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidClientType => "INVALID_CLIENT_TYPE",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RoutingNoRecipient => "ROUTING_NO_RECIPIENT",
            ErrorCode::IdleTimeout => "IDLE_TIMEOUT",
            ErrorCode::Replaced => "REPLACED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures produced while decoding or validating an envelope.
///
/// These never cross the wire directly; [`ProtocolError::to_payload`] turns
/// them into the structured `error` envelope body.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("invalid identity {field}: {reason}")]
    InvalidIdentity { field: &'static str, reason: String },

    #[error("invalid client type: {0}")]
    InvalidClientType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("envelope addressed to its own sender")]
    SelfAddressed,

    #[error("sender does not match the session identity")]
    SenderMismatch,

    #[error("stream sequence {got} regressed below {last} for {stream_type}")]
    SequenceRegression {
        stream_type: String,
        last: u64,
        got: u64,
    },
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidClientType(_) => ErrorCode::InvalidClientType,
            _ => ErrorCode::ValidationError,
        }
    }

    /// Structured wire payload for an `error` envelope describing this failure.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}
