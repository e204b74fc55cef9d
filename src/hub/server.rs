//! Connection acceptor and Hub lifecycle.
//!
//! The acceptor parses the typed URL path, authenticates, registers the
//! session, and runs one reader and one writer task per connection. All
//! registry mutation happens outside network I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::monitor::{MetricsSink, NoopSink};
use crate::protocol::{codec, validation, Envelope, EnvelopeType, Identity};
use crate::protocol::types::valid_id;

use super::auth::{AllowAll, Authenticator};
use super::heartbeat;
use super::router::{send_error, MessageRouter};
use super::session::{CloseReason, Session, SessionRegistry, SessionState};

/// How long the writer gets to flush its close frame before being aborted.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Failures starting or running the Hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared state behind every connection handler.
pub struct HubState {
    pub(crate) config: HubConfig,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) router: MessageRouter,
    pub(crate) auth: Arc<dyn Authenticator>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    total_connections: AtomicU64,
}

/// Point-in-time counters for operators and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub active_sessions: usize,
    pub total_connections: u64,
    pub envelopes_dropped: u64,
}

/// A running Hub bound to a local address.
///
/// Lifecycle is `start -> (serve) -> shutdown`; shutdown closes every
/// session before the listener stops.
pub struct HubServer {
    state: Arc<HubState>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    serve_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl HubServer {
    /// Starts a Hub with the default authenticator and a no-op sink.
    pub async fn start(config: HubConfig) -> Result<Self, HubError> {
        Self::start_with(config, Arc::new(AllowAll), Arc::new(NoopSink)).await
    }

    pub async fn start_with(
        config: HubConfig,
        auth: Arc<dyn Authenticator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, HubError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HubError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(SessionRegistry::new());
        let router = MessageRouter::new(registry.clone(), auth.clone(), metrics.clone());
        let state = Arc::new(HubState {
            config,
            registry,
            router,
            auth,
            metrics,
            total_connections: AtomicU64::new(0),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let heartbeat_task = heartbeat::spawn(state.clone(), shutdown_tx.subscribe());

        let mut shutdown_rx = shutdown_tx.subscribe();
        let app = app(state.clone());
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!("hub server error: {e}");
            }
        });

        info!("star hub listening on {local_addr}");
        Ok(Self {
            state,
            local_addr,
            shutdown_tx,
            serve_task: Some(serve_task),
            heartbeat_task: Some(heartbeat_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base `ws://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn stats(&self) -> HubStats {
        let envelopes_dropped = self
            .state
            .registry
            .all_sessions()
            .iter()
            .map(|s| s.queue().dropped())
            .sum();
        HubStats {
            active_sessions: self.state.registry.len(),
            total_connections: self.state.total_connections.load(Ordering::Relaxed),
            envelopes_dropped,
        }
    }

    /// Stops the Hub, closing every session.
    pub async fn shutdown(mut self) {
        info!("stopping hub on {}", self.local_addr);
        self.state.registry.close_all(CloseReason::Shutdown);
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.heartbeat_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
        info!("hub stopped");
    }
}

impl Drop for HubServer {
    // Dropping the hub without shutdown() still stops its tasks and
    // releases the listener.
    fn drop(&mut self) {
        self.state.registry.close_all(CloseReason::Shutdown);
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
    }
}

fn app(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/env/{env_id}/agent/{agent_id}", get(agent_upgrade))
        .route("/env/{env_id}", get(environment_upgrade))
        .route("/human/{human_id}", get(human_upgrade))
        .with_state(state)
}

async fn agent_upgrade(
    State(state): State<Arc<HubState>>,
    Path((env_id, agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !valid_id(&env_id) {
        return (StatusCode::BAD_REQUEST, "invalid environment id").into_response();
    }
    accept(state, Identity::agent(agent_id), Some(env_id), headers, ws)
}

async fn environment_upgrade(
    State(state): State<Arc<HubState>>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    accept(state, Identity::environment(env_id), None, headers, ws)
}

async fn human_upgrade(
    State(state): State<Arc<HubState>>,
    Path(human_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    accept(state, Identity::human(human_id), None, headers, ws)
}

/// Common admission path for all three endpoints.
fn accept(
    state: Arc<HubState>,
    identity: Identity,
    env_id: Option<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !valid_id(&identity.id) {
        return (StatusCode::BAD_REQUEST, "invalid client id").into_response();
    }

    if state.registry.len() >= state.config.max_connections {
        warn!("rejecting {identity}: connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    if state.config.enable_auth && !state.auth.authenticate(&identity, &headers) {
        info!("authentication failed for {identity}");
        return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    }

    let max_message = state.config.max_frame_bytes.saturating_mul(2);
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_session(state, identity, env_id, socket))
}

/// Runs one accepted connection to completion.
async fn handle_session(
    state: Arc<HubState>,
    identity: Identity,
    env_id: Option<String>,
    socket: WebSocket,
) {
    let session = Session::new(identity.clone(), env_id, state.config.send_queue_depth);
    state.registry.register(session.clone());
    session.set_state(SessionState::Open);
    state.total_connections.fetch_add(1, Ordering::Relaxed);
    state
        .metrics
        .counter_inc("hub.connections", &[("kind", &identity.kind.to_string())]);
    info!("new connection: {identity}");

    // Connection acknowledgement doubles as the first heartbeat.
    session.enqueue(Envelope::heartbeat(identity.clone()));

    let (sender, receiver) = socket.split();
    let mut write_task = tokio::spawn(write_loop(session.clone(), sender));
    read_loop(&state, &session, receiver).await;

    session.close(CloseReason::Disconnected);
    if tokio::time::timeout(WRITER_GRACE, &mut write_task)
        .await
        .is_err()
    {
        write_task.abort();
    }

    state.registry.deregister(&session);
    session.set_state(SessionState::Closed);
    info!(
        "connection closed: {identity} ({})",
        session
            .close_reason()
            .map(|r| r.as_str())
            .unwrap_or("disconnected")
    );
}

async fn read_loop(
    state: &Arc<HubState>,
    session: &Arc<Session>,
    mut receiver: SplitStream<WebSocket>,
) {
    let mut closed = session.closed_rx();
    loop {
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            frame = receiver.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    debug!("socket error for {}: {e}", session.identity);
                    break;
                }
                Some(Ok(Message::Text(text))) => handle_frame(state, session, text.as_str()),
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Binary(_))) => {
                    session.touch();
                    debug!("ignoring binary frame from {}", session.identity);
                }
            }
        }
    }
}

/// Decode, validate, and route a single inbound frame. Violations are
/// answered with an error envelope; the frame is never forwarded.
fn handle_frame(state: &Arc<HubState>, session: &Arc<Session>, text: &str) {
    session.touch();
    state.metrics.counter_inc("hub.frames_in", &[]);

    let envelope = match codec::decode(text, state.config.max_frame_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("rejecting frame from {}: {err}", session.identity);
            send_error(session, err.code(), err.to_string(), None);
            return;
        }
    };

    if state.config.enable_validation {
        if let Err(err) = validation::validate(&envelope) {
            warn!("invalid envelope from {}: {err}", session.identity);
            send_error(session, err.code(), err.to_string(), envelope.id.as_deref());
            return;
        }
    }

    if envelope.kind == EnvelopeType::Message {
        if let Err(message) = observe_stream(session, &envelope.payload) {
            send_error(
                session,
                crate::protocol::ErrorCode::ValidationError,
                message,
                envelope.id.as_deref(),
            );
            return;
        }
    }

    state.router.route(envelope, session);
}

/// Enforces per-session stream sequence discipline: sequences may repeat or
/// skip forward but never regress.
fn observe_stream(session: &Arc<Session>, payload: &Value) -> Result<(), String> {
    if payload.get("type").and_then(Value::as_str) != Some("stream") {
        return Ok(());
    }
    let (Some(stream_type), Some(sequence)) = (
        payload.get("stream_type").and_then(Value::as_str),
        payload.get("sequence").and_then(Value::as_u64),
    ) else {
        return Ok(());
    };
    if session.observe_stream_sequence(stream_type, sequence) {
        Ok(())
    } else {
        Err(format!(
            "stream sequence {sequence} regressed for {stream_type}"
        ))
    }
}

async fn write_loop(session: Arc<Session>, mut sender: SplitSink<WebSocket, Message>) {
    let mut closed = session.closed_rx();
    loop {
        tokio::select! {
            _ = async { while !*closed.borrow() { if closed.changed().await.is_err() { break; } } } => {
                let reason = session
                    .close_reason()
                    .map(|r| r.as_str())
                    .unwrap_or("closed");
                let frame = CloseFrame {
                    code: axum::extract::ws::close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
            envelope = session.queue().pop() => {
                let text = codec::encode(&envelope);
                if sender.send(Message::Text(text.into())).await.is_err() {
                    debug!("write failed for {}", session.identity);
                    break;
                }
            }
        }
    }
}
