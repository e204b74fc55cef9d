//! The Hub: connection acceptor, session registry, router and heartbeater.

pub mod auth;
mod heartbeat;
pub mod router;
pub mod server;
pub mod session;

pub use auth::{AllowAll, Authenticator, Decision};
pub use router::MessageRouter;
pub use server::{HubError, HubServer, HubStats};
pub use session::{CloseReason, Session, SessionRegistry, SessionState};
