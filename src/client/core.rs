//! Shared client transport: connect, read loop, send side, reconnection
//! with backoff, and request/response correlation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::monitor::MetricsSink;
use crate::protocol::{
    codec, validation, ActionPayload, Envelope, EnvelopeType, ErrorCode, ErrorPayload,
    EventPayload, Identity, OutcomePayload, Payload, StreamPayload,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Base delay for exponential reconnect backoff (milliseconds).
const BASE_BACKOFF_MS: u64 = 500;

/// Cap on the reconnect backoff (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Reconnect attempts before the client gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 50;

/// Failures surfaced to business callers of the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("reconnection failed after {0} attempts")]
    ReconnectionFailed(u32),

    #[error("request timed out")]
    Timeout,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("client is closed")]
    Closed,
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            ClientError::ConnectionLost | ClientError::Closed => ErrorCode::ConnectionLost,
            ClientError::ReconnectionFailed(_) => ErrorCode::ReconnectionFailed,
            ClientError::Timeout => ErrorCode::Timeout,
            ClientError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ClientError::Validation(_) => ErrorCode::ValidationError,
        }
    }
}

/// Client-side knobs. Backoff parameters are protocol constants and not
/// configurable.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port` base; the role path is appended.
    pub base_url: String,
    /// Validate outbound envelopes before sending.
    pub validate_messages: bool,
    /// Depth of the outbound queue.
    pub send_queue_depth: usize,
    /// How long `close()` waits for queued sends to drain.
    pub close_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8765".to_string(),
            validate_messages: true,
            send_queue_depth: 1024,
            close_grace: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

pub type HandlerResult = anyhow::Result<()>;

pub type ActionHandler =
    Arc<dyn Fn(ActionPayload, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type OutcomeHandler =
    Arc<dyn Fn(OutcomePayload, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type EventHandler =
    Arc<dyn Fn(EventPayload, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type StreamHandler =
    Arc<dyn Fn(StreamPayload, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type ErrorHandler =
    Arc<dyn Fn(ErrorPayload, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    action: Option<ActionHandler>,
    outcome: Option<OutcomeHandler>,
    event: Option<EventHandler>,
    stream: Option<StreamHandler>,
    error: Option<ErrorHandler>,
    action_named: HashMap<String, ActionHandler>,
    event_named: HashMap<String, EventHandler>,
    stream_named: HashMap<String, StreamHandler>,
}

struct ClientShared {
    identity: Identity,
    url: String,
    config: ClientConfig,
    metrics: Arc<dyn MetricsSink>,
    handlers: RwLock<HandlerTable>,
    pending: DashMap<String, oneshot::Sender<Result<OutcomePayload, ClientError>>>,
    out_tx: mpsc::Sender<Envelope>,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
    connected_tx: watch::Sender<bool>,
}

impl ClientShared {
    fn fail_pending(&self, err: ClientError) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// The transport shared by every role facade. Handler registrations live
/// here and survive reconnects; only the socket is replaced.
pub struct ClientCore {
    shared: Arc<ClientShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientCore {
    /// Opens the transport for `identity` at `base_url/path` and starts the
    /// read loop. Fails with `CONNECTION_FAILED` when the initial connect is
    /// refused; later failures are handled by reconnection.
    pub async fn connect(
        identity: Identity,
        path: &str,
        config: ClientConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ClientError> {
        let url = format!("{}/{}", config.base_url.trim_end_matches('/'), path);
        info!("{identity} connecting to {url}");

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        metrics.counter_inc("client.connects", &[]);

        let (out_tx, out_rx) = mpsc::channel(config.send_queue_depth);
        let (closed_tx, _) = watch::channel(false);
        let (connected_tx, _) = watch::channel(true);
        let shared = Arc::new(ClientShared {
            identity,
            url,
            config,
            metrics,
            handlers: RwLock::new(HandlerTable::default()),
            pending: DashMap::new(),
            out_tx,
            closing: AtomicBool::new(false),
            closed_tx,
            connected_tx,
        });

        let supervisor = tokio::spawn(supervise(shared.clone(), socket, out_rx));
        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Waits until the transport is up, e.g. after a server restart.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.connected_tx.subscribe();
        tokio::time::timeout(timeout, async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Enqueues an envelope for the writer.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        if self.shared.is_closing() {
            return Err(ClientError::Closed);
        }
        if self.shared.config.validate_messages {
            validation::validate(&envelope).map_err(|e| ClientError::Validation(e.to_string()))?;
        }
        self.shared
            .out_tx
            .send(envelope)
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Builds and sends a `message` envelope carrying `payload`.
    pub async fn send_payload(
        &self,
        recipient: Identity,
        payload: &Payload,
    ) -> Result<(), ClientError> {
        self.send(Envelope::message(
            self.shared.identity.clone(),
            recipient,
            payload,
        ))
        .await
    }

    /// Sends an action and waits for the outcome whose id echoes the
    /// action's id.
    pub async fn send_and_wait(
        &self,
        action: ActionPayload,
        recipient: Identity,
        timeout: Duration,
    ) -> Result<OutcomePayload, ClientError> {
        let id = action.id.clone();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id.clone(), tx);

        let envelope = Envelope::message(
            self.shared.identity.clone(),
            recipient,
            &Payload::Action(action),
        );
        if let Err(e) = self.send(envelope).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                self.shared
                    .metrics
                    .timing_observe("client.request", started.elapsed(), &[]);
                result
            }
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.shared.pending.remove(&id);
                self.shared.metrics.counter_inc("client.timeouts", &[]);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Closes the client: drains queued sends within the grace period,
    /// cancels the read loop and outstanding waits, and releases the
    /// transport. Safe to call more than once.
    pub async fn close(&self) {
        eprintln!("DEBUG close() called");
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            eprintln!("DEBUG close() already closing, return");
            return;
        }
        info!("closing client {}", self.shared.identity);

        let deadline = tokio::time::Instant::now() + self.shared.config.close_grace;
        let max = self.shared.out_tx.max_capacity();
        while self.shared.out_tx.capacity() < max && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        eprintln!("DEBUG sending closed_tx=true, receiver_count={}", self.shared.closed_tx.receiver_count());
        let send_result = self.shared.closed_tx.send(true);
        eprintln!("DEBUG send result={:?}, borrow_after={}", send_result.is_ok(), *self.shared.closed_tx.borrow());
        self.shared.fail_pending(ClientError::ConnectionLost);

        let task = {
            self.supervisor
                .lock()
                .expect("supervisor handle poisoned")
                .take()
        };
        eprintln!("DEBUG waiting on supervisor task: {}", task.is_some());
        if let Some(task) = task {
            let _ = task.await;
        }
        eprintln!("DEBUG close() done");
    }

    // ---- handler registration; registrations persist across reconnects ----

    pub fn on_action<F, Fut>(&self, handler: F)
    where
        F: Fn(ActionPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table().action = Some(Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_action_named<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(ActionPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table()
            .action_named
            .insert(name.to_string(), Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_outcome<F, Fut>(&self, handler: F)
    where
        F: Fn(OutcomePayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table().outcome = Some(Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_event<F, Fut>(&self, handler: F)
    where
        F: Fn(EventPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table().event = Some(Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_event_named<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(EventPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table()
            .event_named
            .insert(name.to_string(), Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_stream<F, Fut>(&self, handler: F)
    where
        F: Fn(StreamPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table().stream = Some(Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_stream_named<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(StreamPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table()
            .stream_named
            .insert(name.to_string(), Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    pub fn on_error<F, Fut>(&self, handler: F)
    where
        F: Fn(ErrorPayload, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.table().error = Some(Arc::new(move |p, e| Box::pin(handler(p, e))));
    }

    fn table(&self) -> std::sync::RwLockWriteGuard<'_, HandlerTable> {
        self.shared.handlers.write().expect("handler table poisoned")
    }
}

impl Drop for ClientCore {
    // Dropping the client without close() still releases the transport and
    // its tasks.
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.shared.closed_tx.send(true);
        let task = self
            .supervisor
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Computes the delay before reconnect attempt `attempt` (1-based):
/// exponential growth from the base with a hard cap, full jitter in
/// `[0, current)`.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF_MS
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF_MS);
    Duration::from_millis(rand::rng().random_range(0..exp))
}

#[derive(Debug)]
enum ConnectionEnd {
    /// `close()` was requested locally.
    Closed,
    /// The transport failed; reconnect.
    Lost,
    /// The Hub evicted this identity for a newer connection; do not fight it.
    Replaced,
}

async fn supervise(shared: Arc<ClientShared>, first: Socket, mut out_rx: mpsc::Receiver<Envelope>) {
    let mut socket = Some(first);
    let mut attempt: u32 = 0;

    loop {
        let ws = match socket.take() {
            Some(ws) => ws,
            None => {
                if shared.is_closing() {
                    break;
                }
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    warn!(
                        "{} giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts",
                        shared.identity
                    );
                    shared.fail_pending(ClientError::ReconnectionFailed(MAX_RECONNECT_ATTEMPTS));
                    break;
                }
                let delay = backoff_delay(attempt);
                debug!("{} reconnect attempt {attempt} in {delay:?}", shared.identity);
                let mut closed = shared.closed_tx.subscribe();
                tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match connect_async(shared.url.as_str()).await {
                    Ok((ws, _)) => {
                        info!("{} reconnected", shared.identity);
                        shared.metrics.counter_inc("client.reconnects", &[]);
                        ws
                    }
                    Err(e) => {
                        debug!("{} reconnect failed: {e}", shared.identity);
                        continue;
                    }
                }
            }
        };

        let _ = shared.connected_tx.send(true);
        attempt = 0;
        let ended = run_connection(&shared, ws, &mut out_rx).await;
        eprintln!("DEBUG run_connection ended with {:?}", ended);
        let _ = shared.connected_tx.send(false);

        match ended {
            ConnectionEnd::Closed => break,
            ConnectionEnd::Lost => {
                // Outstanding correlations cannot complete across a
                // reconnect; no replay is attempted.
                shared.fail_pending(ClientError::ConnectionLost);
                if shared.is_closing() {
                    break;
                }
            }
            ConnectionEnd::Replaced => {
                info!(
                    "{} was replaced by a newer connection; stopping",
                    shared.identity
                );
                shared.fail_pending(ClientError::ConnectionLost);
                break;
            }
        }
    }
    let _ = shared.connected_tx.send(false);
}

async fn run_connection(
    shared: &Arc<ClientShared>,
    ws: Socket,
    out_rx: &mut mpsc::Receiver<Envelope>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut closed = shared.closed_tx.subscribe();

    loop {
        tokio::select! {
            _ = async { eprintln!("DEBUG entering closed-wait block, current={}", *closed.borrow()); while !*closed.borrow() { if closed.changed().await.is_err() { break; } }; eprintln!("DEBUG exited closed-wait loop") } => {
                eprintln!("DEBUG run_connection observed close, sending close frame");
                let _ = sink.send(WsMessage::Close(None)).await;
                eprintln!("DEBUG run_connection sent close frame, returning Closed");
                return ConnectionEnd::Closed;
            }
            envelope = out_rx.recv() => match envelope {
                Some(envelope) => {
                    let text = codec::encode(&envelope);
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
                None => return ConnectionEnd::Closed,
            },
            frame = stream.next() => match frame {
                None => return ConnectionEnd::Lost,
                Some(Err(e)) => {
                    debug!("{} transport error: {e}", shared.identity);
                    return ConnectionEnd::Lost;
                }
                Some(Ok(WsMessage::Text(text))) => dispatch(shared, text.as_str()).await,
                Some(Ok(WsMessage::Close(frame))) => {
                    let replaced = frame
                        .as_ref()
                        .map(|f| f.reason.as_str() == "replaced")
                        .unwrap_or(false);
                    return if replaced {
                        ConnectionEnd::Replaced
                    } else {
                        ConnectionEnd::Lost
                    };
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Demultiplexes one inbound envelope to the registered handlers. Handler
/// failures are logged and never terminate the read loop.
async fn dispatch(shared: &Arc<ClientShared>, text: &str) {
    let envelope = match codec::decode(text, codec::MAX_FRAME_BYTES) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("{} dropping undecodable frame: {e}", shared.identity);
            return;
        }
    };

    match envelope.kind {
        EnvelopeType::Heartbeat => {
            debug!("{} heartbeat from {}", shared.identity, envelope.sender.id);
            // Echo liveness back so the Hub's idle clock restarts.
            let _ = shared
                .out_tx
                .try_send(Envelope::heartbeat_from(shared.identity.clone()));
        }
        EnvelopeType::Error => handle_error_envelope(shared, envelope).await,
        EnvelopeType::Message => handle_message(shared, envelope).await,
    }
}

async fn handle_error_envelope(shared: &Arc<ClientShared>, envelope: Envelope) {
    let payload: ErrorPayload = match serde_json::from_value(envelope.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("{} malformed error envelope: {e}", shared.identity);
            return;
        }
    };
    shared.metrics.counter_inc(
        "client.errors_in",
        &[("code", payload.error_code.as_str())],
    );

    // Protocol failures that name the offending message complete its
    // pending correlation as a typed failure.
    if let Some(id) = payload
        .details
        .get("original_message_id")
        .and_then(Value::as_str)
    {
        let mapped = match payload.error_code {
            ErrorCode::PermissionDenied => {
                Some(ClientError::PermissionDenied(payload.message.clone()))
            }
            ErrorCode::ValidationError => Some(ClientError::Validation(payload.message.clone())),
            _ => None,
        };
        if let Some(err) = mapped {
            if let Some((_, tx)) = shared.pending.remove(id) {
                let _ = tx.send(Err(err));
                return;
            }
        }
    }

    let handler = shared
        .handlers
        .read()
        .expect("handler table poisoned")
        .error
        .clone();
    match handler {
        Some(handler) => run_handler(handler(payload, envelope), "error").await,
        None => warn!(
            "{} hub error [{}]: {}",
            shared.identity, payload.error_code, payload.message
        ),
    }
}

async fn handle_message(shared: &Arc<ClientShared>, envelope: Envelope) {
    let payload = match Payload::from_value(&envelope.payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("{} unrecognized payload: {e}", shared.identity);
            return;
        }
    };

    match payload {
        Payload::Outcome(outcome) => {
            // A correlated outcome completes its waiter; strays go to the
            // outcome handler.
            if let Some((_, tx)) = shared.pending.remove(&outcome.id) {
                let _ = tx.send(Ok(outcome));
                return;
            }
            let handler = shared.handlers.read().expect("handler table poisoned").outcome.clone();
            if let Some(handler) = handler {
                run_handler(handler(outcome, envelope), "outcome").await;
            }
        }
        Payload::Action(action) => {
            let (base, named) = {
                let table = shared.handlers.read().expect("handler table poisoned");
                (
                    table.action.clone(),
                    table.action_named.get(&action.action).cloned(),
                )
            };
            if let Some(handler) = base {
                run_handler(handler(action.clone(), envelope.clone()), "action").await;
            }
            if let Some(handler) = named {
                run_handler(handler(action, envelope), "action").await;
            }
        }
        Payload::Event(event) => {
            let (base, named) = {
                let table = shared.handlers.read().expect("handler table poisoned");
                (
                    table.event.clone(),
                    table.event_named.get(&event.event).cloned(),
                )
            };
            if let Some(handler) = base {
                run_handler(handler(event.clone(), envelope.clone()), "event").await;
            }
            if let Some(handler) = named {
                run_handler(handler(event, envelope), "event").await;
            }
        }
        Payload::Stream(stream) => {
            let (base, named) = {
                let table = shared.handlers.read().expect("handler table poisoned");
                (
                    table.stream.clone(),
                    table.stream_named.get(&stream.stream_type).cloned(),
                )
            };
            if let Some(handler) = base {
                run_handler(handler(stream.clone(), envelope.clone()), "stream").await;
            }
            if let Some(handler) = named {
                run_handler(handler(stream, envelope), "stream").await;
            }
        }
    }
}

async fn run_handler(fut: BoxFuture<'_, HandlerResult>, what: &str) {
    if let Err(e) = fut.await {
        warn!("{what} handler failed: {e:#}");
    }
}
