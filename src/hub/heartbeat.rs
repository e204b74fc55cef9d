//! Periodic per-session liveness: Hub heartbeats out, idle eviction.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::protocol::Envelope;

use super::server::HubState;
use super::session::CloseReason;

/// Spawns the single heartbeat timer task. Every tick, each open session
/// receives one heartbeat envelope and silent sessions are evicted.
pub(crate) fn spawn(
    state: Arc<HubState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
        // The first tick fires immediately; sessions get their initial
        // heartbeat at accept time, so skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => beat(&state),
            }
        }
        debug!("heartbeater stopped");
    })
}

fn beat(state: &HubState) {
    let timeout = state.config.session_timeout();
    for session in state.registry.all_sessions() {
        if !session.is_open() {
            continue;
        }
        if session.idle_for() > timeout {
            info!(
                "evicting {} after {:?} of silence",
                session.identity,
                session.idle_for()
            );
            state
                .metrics
                .counter_inc("hub.idle_evictions", &[("kind", "idle_timeout")]);
            session.close(CloseReason::IdleTimeout);
            continue;
        }
        session.enqueue(Envelope::heartbeat(session.identity.clone()));
    }
    state
        .metrics
        .gauge_set("hub.active_sessions", state.registry.len() as f64, &[]);
}
