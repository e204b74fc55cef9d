//! JSON frame codec: one envelope per transport text frame.

use super::error::ProtocolError;
use super::types::{now_timestamp, Envelope, PROTOCOL_VERSION};

/// Default upper bound on a single frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Serializes an envelope to a single JSON document.
///
/// Missing `timestamp` is filled with the current UTC instant and `version`
/// defaults to the current protocol major version.
pub fn encode(envelope: &Envelope) -> String {
    let mut envelope = envelope.clone();
    if envelope.timestamp.is_none() {
        envelope.timestamp = Some(now_timestamp());
    }
    if envelope.version.is_none() {
        envelope.version = Some(PROTOCOL_VERSION.to_string());
    }
    serde_json::to_string(&envelope).expect("envelope serializes")
}

/// Parses exactly one JSON envelope from a text frame.
///
/// The size bound is enforced before parsing; unknown top-level fields are
/// preserved but ignored.
pub fn decode(frame: &str, max_frame_bytes: usize) -> Result<Envelope, ProtocolError> {
    if frame.len() > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            limit: max_frame_bytes,
        });
    }
    serde_json::from_str(frame).map_err(|e| {
        let message = e.to_string();
        // Serde reports a bad identity kind as an unknown-variant error
        // listing the legal kinds.
        if message.contains("unknown variant") && message.contains("`environment`") {
            ProtocolError::InvalidClientType(message)
        } else {
            ProtocolError::Malformed(message)
        }
    })
}
