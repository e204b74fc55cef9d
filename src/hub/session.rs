//! Session state and the Hub's in-memory topology.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::{watch, Notify};

use crate::protocol::{ClientKind, Envelope, EnvelopeType, Identity};

/// Why a session was closed by the Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection claimed the same identity.
    Replaced,
    /// No traffic within the session timeout.
    IdleTimeout,
    /// The Hub is shutting down.
    Shutdown,
    /// The peer went away on its own.
    Disconnected,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Disconnected => "disconnected",
        }
    }
}

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Bounded FIFO of outbound envelopes.
///
/// `push` never blocks: when the queue is full, the oldest non-heartbeat
/// envelope is dropped and counted, preserving liveness over completeness.
pub struct SendQueue {
    inner: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    depth: usize,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            depth,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, envelope: Envelope) {
        {
            let mut queue = self.inner.lock().expect("send queue poisoned");
            if queue.len() >= self.depth {
                let victim = queue
                    .iter()
                    .position(|e| e.kind != EnvelopeType::Heartbeat)
                    .unwrap_or(0);
                queue.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(envelope);
        }
        self.notify.notify_one();
    }

    /// Waits for and removes the next envelope in FIFO order.
    pub async fn pop(&self) -> Envelope {
        loop {
            if let Some(envelope) = self.inner.lock().expect("send queue poisoned").pop_front() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("send queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Live state for one connected identity. The session's reader and writer
/// tasks are its exclusive owners; other tasks interact only by enqueuing
/// envelopes or signalling close.
pub struct Session {
    pub identity: Identity,
    /// Environment this agent session is attached to; None for other kinds.
    pub env_id: Option<String>,
    queue: SendQueue,
    state: Mutex<SessionState>,
    last_traffic_seen: AtomicI64,
    last_heartbeat_sent: AtomicI64,
    close_reason: OnceLock<CloseReason>,
    closed_tx: watch::Sender<bool>,
    stream_seqs: Mutex<HashMap<String, u64>>,
}

impl Session {
    pub fn new(identity: Identity, env_id: Option<String>, queue_depth: usize) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            env_id,
            queue: SendQueue::new(queue_depth),
            state: Mutex::new(SessionState::Handshaking),
            last_traffic_seen: AtomicI64::new(now_millis()),
            last_heartbeat_sent: AtomicI64::new(0),
            close_reason: OnceLock::new(),
            closed_tx,
            stream_seqs: Mutex::new(HashMap::new()),
        })
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Enqueues an envelope for the writer task.
    pub fn enqueue(&self, envelope: Envelope) {
        if envelope.kind == EnvelopeType::Heartbeat {
            self.last_heartbeat_sent
                .store(now_millis(), Ordering::Relaxed);
        }
        self.queue.push(envelope);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Records inbound traffic as liveness evidence.
    pub fn touch(&self) {
        self.last_traffic_seen
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_traffic_seen.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last).max(0) as u64)
    }

    pub fn last_heartbeat_sent_millis(&self) -> i64 {
        self.last_heartbeat_sent.load(Ordering::Relaxed)
    }

    /// Signals the session's tasks to stop. The first reason wins; later
    /// calls are no-ops.
    pub fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_ok() {
            self.set_state(SessionState::Closing);
            let _ = self.closed_tx.send(true);
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        self.close_reason.get().is_some()
    }

    /// Tracks the per-`stream_type` sequence; returns false on regression.
    /// Equal sequences and gaps are allowed.
    pub fn observe_stream_sequence(&self, stream_type: &str, sequence: u64) -> bool {
        let mut seqs = self.stream_seqs.lock().expect("stream seqs poisoned");
        match seqs.get(stream_type) {
            Some(&last) if sequence < last => false,
            _ => {
                seqs.insert(stream_type.to_string(), sequence);
                true
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The Hub's in-memory topology: sessions keyed by identity plus the
/// environment membership map.
///
/// Mutations never span an await point; the router reads a consistent
/// snapshot through the shard locks.
pub struct SessionRegistry {
    sessions: DashMap<Identity, Arc<Session>>,
    env_agents: DashMap<String, HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            env_agents: DashMap::new(),
        }
    }

    /// Inserts a session, evicting any existing session with the same
    /// identity (close reason `replaced`).
    pub fn register(&self, session: Arc<Session>) {
        if let Some(env_id) = session.env_id.clone() {
            self.env_agents
                .entry(env_id)
                .or_default()
                .insert(session.identity.id.clone());
        }
        if let Some(previous) = self.sessions.insert(session.identity.clone(), session.clone()) {
            warn!("replacing existing session for {}", previous.identity);
            // The evicted session may have been attached elsewhere.
            if previous.env_id != session.env_id {
                if let Some(env_id) = &previous.env_id {
                    if let Some(mut agents) = self.env_agents.get_mut(env_id) {
                        agents.remove(&previous.identity.id);
                    }
                    self.env_agents
                        .remove_if(env_id, |_, agents| agents.is_empty());
                }
            }
            previous.close(CloseReason::Replaced);
        }
    }

    /// Removes a session if it is still the current holder of its identity.
    /// A replaced session deregistering late must not evict its replacement.
    pub fn deregister(&self, session: &Arc<Session>) {
        let removed = self
            .sessions
            .remove_if(&session.identity, |_, current| {
                Arc::ptr_eq(current, session)
            })
            .is_some();

        if removed {
            if let Some(env_id) = &session.env_id {
                if let Some(mut agents) = self.env_agents.get_mut(env_id) {
                    agents.remove(&session.identity.id);
                }
                self.env_agents
                    .remove_if(env_id, |_, agents| agents.is_empty());
            }
            info!("deregistered session {}", session.identity);
        }
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|s| s.clone())
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn sessions_of_kind(&self, kind: ClientKind) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Agents currently attached to an environment.
    pub fn agents_in_env(&self, env_id: &str) -> HashSet<String> {
        self.env_agents
            .get(env_id)
            .map(|agents| agents.clone())
            .unwrap_or_default()
    }

    /// Ids of environments with live sessions.
    pub fn live_environments(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| e.key().kind == ClientKind::Environment)
            .map(|e| e.key().id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Closes every session, used at shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        for session in self.all_sessions() {
            session.close(reason);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
