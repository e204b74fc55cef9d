//! Pluggable authentication and authorization.

use axum::http::HeaderMap;

use crate::protocol::{Envelope, Identity};

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Capability consulted at upgrade time and before each delivery.
///
/// The default implementation accepts and allows everything; operators
/// install a real authenticator (JWT, API keys, ...) at Hub construction.
pub trait Authenticator: Send + Sync {
    /// Gate for the connection upgrade. A `false` aborts the upgrade with
    /// HTTP 401; no error frame is sent.
    fn authenticate(&self, identity: &Identity, headers: &HeaderMap) -> bool;

    /// Per-envelope permission hook consulted by the router before delivery.
    fn authorize(&self, sender: &Identity, envelope: &Envelope) -> Decision;
}

/// Accepts every connection and allows every envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _identity: &Identity, _headers: &HeaderMap) -> bool {
        true
    }

    fn authorize(&self, _sender: &Identity, _envelope: &Envelope) -> Decision {
        Decision::Allow
    }
}
