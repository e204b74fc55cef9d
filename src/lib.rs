//! Star Protocol
//!
//! A real-time messaging fabric for multi-agent simulations: a central Hub
//! routes structured JSON envelopes between Agents, Environments and Humans
//! over long-lived WebSocket connections, and a client library gives every
//! role the same transport core (read loop, send queue, reconnection,
//! request/response correlation).

pub mod client;
pub mod config;
pub mod hub;
pub mod monitor;
pub mod protocol;
