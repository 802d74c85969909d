//! WebSocket client transport.
//!
//! A [`Transport`] owns at most one connection at a time. Each call to
//! [`Transport::open`] bumps a generation counter and spawns a connection
//! task; a task whose generation is no longer current tears itself down
//! without publishing lifecycle events.
//!
//! # Connection task
//!
//! ```text
//! connect_async ─► split ─┬─► sink   ─► writer task (requests, close)
//!                         └─► stream ─► read loop ─┬─► router.broadcast  (event frames)
//!                                                  └─► pending.settle    (responses)
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::pending::PendingRequests;
use super::state::{ConnectionState, TransportEvent};
use crate::error::{panic_message, ButlerError, Result};
use crate::protocol::{Frame, Request};
use crate::router::{BoxFuture, Context, Delegate, Router};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Close code for a normal, requested closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the peer sent a close frame without a status.
pub const NO_STATUS: u16 = 1005;

/// Close code reported for failed connects and lost connections.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Default capacity of the lifecycle event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// How long a requested close waits for the peer's acknowledgement.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Writer task options for each connection.
    pub writer: WriterConfig,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Close code and reason handed to the connection task.
#[derive(Debug)]
struct CloseRequest {
    code: u16,
    reason: String,
}

impl Default for CloseRequest {
    fn default() -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: String::new(),
        }
    }
}

/// How a connection ended.
#[derive(Debug)]
struct Closure {
    code: u16,
    reason: String,
    error: Option<String>,
}

impl Closure {
    fn closed(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            error: None,
        }
    }

    fn failed(error: ButlerError) -> Self {
        let error = error.to_string();
        Self {
            code: ABNORMAL_CLOSURE,
            reason: error.clone(),
            error: Some(error),
        }
    }
}

/// One live WebSocket connection.
struct Connection {
    writer: WriterHandle,
    pending: PendingRequests,
}

/// Mutable connection slot, guarded by one lock.
#[derive(Default)]
struct Slot {
    state: ConnectionState,
    generation: u64,
    connection: Option<Arc<Connection>>,
    shutdown: Option<oneshot::Sender<CloseRequest>>,
}

/// Outcome of handing a fresh connection to the slot.
enum Promotion {
    Open,
    Closing,
    Superseded,
}

struct Inner {
    router: Arc<Router>,
    config: TransportConfig,
    slot: Mutex<Slot>,
    events: broadcast::Sender<TransportEvent>,
}

/// Reconnectable WebSocket client bound to a local [`Router`].
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a transport with the default configuration.
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_config(router, TransportConfig::default())
    }

    /// Create a transport with the given configuration.
    pub fn with_config(router: Arc<Router>, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                router,
                config,
                slot: Mutex::new(Slot::default()),
                events,
            }),
        }
    }

    /// The router inbound broadcasts are delivered to.
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Check whether requests may be sent.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Subscribe to lifecycle events.
    ///
    /// Only events published after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Number of requests awaiting a response on the current connection.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map_or(0, |connection| connection.pending.len())
    }

    /// Connect to `address` (e.g. `ws://127.0.0.1:26532`).
    ///
    /// Any previous connection is closed first. Must be called from within a
    /// tokio runtime. Progress is reported through [`Transport::subscribe`].
    pub fn open(&self, address: impl Into<String>) {
        let address = address.into();

        // Retire the previous connection under the same lock that bumps the
        // generation, so its teardown can never be mistaken for current.
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (generation, previous) = {
            let mut slot = self.inner.lock();
            let previous = slot.shutdown.take();
            slot.generation += 1;
            slot.state = ConnectionState::Connecting;
            slot.connection = None;
            slot.shutdown = Some(shutdown_tx);
            (slot.generation, previous)
        };

        if let Some(tx) = previous {
            debug!(generation, "Closing superseded connection");
            let _ = tx.send(CloseRequest::default());
        }

        debug!(%address, generation, "Opening connection");
        tokio::spawn(run_connection(
            Arc::clone(&self.inner),
            address,
            generation,
            shutdown_rx,
        ));
    }

    /// Close the connection normally (code 1000).
    pub fn close(&self) {
        self.close_with(NORMAL_CLOSURE, "");
    }

    /// Close the connection with a specific code and reason.
    ///
    /// No-op if already closed or closing.
    pub fn close_with(&self, code: u16, reason: &str) {
        let shutdown = {
            let mut slot = self.inner.lock();
            if slot.state == ConnectionState::Closed {
                return;
            }
            slot.state = ConnectionState::Closing;
            slot.shutdown.take()
        };

        if let Some(tx) = shutdown {
            debug!(code, reason, "Closing connection");
            let _ = tx.send(CloseRequest {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with `NotConnected` unless the connection is open, with
    /// `Remote` if the peer answered with an error, and with
    /// `ConnectionClosed` if the connection went away first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let connection = self.inner.open_connection()?;
        let (id, response) = connection.pending.allocate()?;

        let sent = match Frame::from(Request::new(id, method, params)).encode() {
            Ok(text) => connection.writer.send_text(text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            connection.pending.cancel(id);
            return Err(e);
        }
        drop(connection);

        debug!(id, method, "Request sent");
        response
            .await
            .unwrap_or(Err(ButlerError::ConnectionClosed))
    }

    /// Forward every call the router cannot answer locally to the remote
    /// peer.
    ///
    /// Installs a root delegate that turns `router.call(name, args)` into
    /// `request(name, args)`. More specific local delegates still win.
    pub fn forward_calls(&self) {
        let delegate = ForwardDelegate {
            transport: Arc::downgrade(&self.inner),
        };
        self.inner.router.register_delegate("", Arc::new(delegate));
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Root delegate that relays calls over the transport.
///
/// Holds a weak reference so the router does not keep the transport alive.
struct ForwardDelegate {
    transport: Weak<Inner>,
}

impl Delegate for ForwardDelegate {
    fn call(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let inner = self.transport.upgrade();
        Box::pin(async move {
            let inner = inner.ok_or(ButlerError::NotConnected)?;
            Transport { inner }
                .request(ctx.name(), Value::Array(args))
                .await
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_connection(&self) -> Result<Arc<Connection>> {
        let slot = self.lock();
        match (&slot.state, &slot.connection) {
            (ConnectionState::Open, Some(connection)) => Ok(Arc::clone(connection)),
            _ => Err(ButlerError::NotConnected),
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Install a freshly connected socket if its generation is still current.
    fn promote(&self, generation: u64, connection: &Arc<Connection>) -> Promotion {
        let mut slot = self.lock();
        if slot.generation != generation {
            return Promotion::Superseded;
        }
        slot.connection = Some(Arc::clone(connection));
        match slot.state {
            ConnectionState::Connecting => {
                slot.state = ConnectionState::Open;
                Promotion::Open
            }
            _ => Promotion::Closing,
        }
    }

    /// Tear down a connection and, if still current, publish its closure.
    fn finish(&self, generation: u64, connection: Option<&Connection>, closure: Closure) {
        let rejected = connection.map_or(0, |c| c.pending.reject_all());

        let current = {
            let mut slot = self.lock();
            if slot.generation == generation {
                slot.state = ConnectionState::Closed;
                slot.connection = None;
                slot.shutdown = None;
                true
            } else {
                false
            }
        };

        if !current {
            debug!(generation, rejected, "Superseded connection finished");
            return;
        }

        info!(
            code = closure.code,
            reason = %closure.reason,
            rejected,
            "Connection closed"
        );
        if let Some(error) = closure.error {
            self.emit(TransportEvent::Error(error));
        }
        self.emit(TransportEvent::Close {
            code: closure.code,
            reason: closure.reason,
        });
    }

    fn handle_inbound(&self, connection: &Connection, text: &str) {
        match Frame::decode(text) {
            Ok(Frame::Broadcast(broadcast)) => {
                // A panicking handler must not take the connection task down.
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    self.router.broadcast(&broadcast.event, &broadcast.params)
                }));
                let failure = match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => e,
                    Err(panic) => ButlerError::handler(panic_message(panic.as_ref())),
                };
                warn!(event = %broadcast.event, error = %failure, "Broadcast handler failed");
                self.emit(TransportEvent::Error(failure.to_string()));
            }
            Ok(Frame::Response(response)) => {
                let id = response.id;
                if !connection.pending.settle(id, response.into_result()) {
                    warn!(id, "Response for unknown request");
                }
            }
            Ok(Frame::Request(request)) => {
                warn!(id = request.id, method = %request.method, "Ignoring inbound request");
            }
            Err(e) => {
                warn!(error = %e, "Malformed inbound frame");
                self.emit(TransportEvent::Error(e.to_string()));
            }
        }
    }
}

/// Connection task: connect, pump inbound frames, tear down.
async fn run_connection(
    inner: Arc<Inner>,
    address: String,
    generation: u64,
    mut shutdown: oneshot::Receiver<CloseRequest>,
) {
    let socket = tokio::select! {
        result = tokio_tungstenite::connect_async(address.as_str()) => match result {
            Ok((socket, _response)) => socket,
            Err(e) => {
                warn!(%address, error = %e, "Connect failed");
                let error = ButlerError::Transport(format!("connect to {address} failed: {e}"));
                inner.finish(generation, None, Closure::failed(error));
                return;
            }
        },
        request = &mut shutdown => {
            let request = request.unwrap_or_default();
            inner.finish(generation, None, Closure::closed(request.code, request.reason));
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let (writer, _writer_task) = spawn_writer_task(sink, inner.config.writer.clone());
    let connection = Arc::new(Connection {
        writer,
        pending: PendingRequests::new(),
    });

    match inner.promote(generation, &connection) {
        Promotion::Open => {
            info!(%address, "Connection open");
            inner.emit(TransportEvent::Open);
        }
        Promotion::Closing => {}
        Promotion::Superseded => {
            debug!(generation, "Connection superseded before open");
            let _ = connection.writer.close(NORMAL_CLOSURE, "").await;
            connection.pending.reject_all();
            return;
        }
    }

    let mut closure = Closure::closed(ABNORMAL_CLOSURE, "connection lost");
    let mut closing = false;
    let mut deadline = tokio::time::Instant::now();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => inner.handle_inbound(&connection, &text),
                Some(Ok(Message::Close(frame))) => {
                    // Keep reading until the stream ends; tungstenite answers
                    // the close handshake itself.
                    closure = match frame {
                        Some(frame) => Closure::closed(u16::from(frame.code), frame.reason.into_owned()),
                        None => Closure::closed(NO_STATUS, ""),
                    };
                }
                Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame"),
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "Connection failed");
                    closure = Closure::failed(ButlerError::Transport(e.to_string()));
                    break;
                }
            },
            request = &mut shutdown, if !closing => {
                closing = true;
                deadline = tokio::time::Instant::now() + CLOSE_TIMEOUT;
                let request = request.unwrap_or_default();
                closure = Closure::closed(request.code, request.reason.clone());
                if connection.writer.close(request.code, request.reason).await.is_err() {
                    break;
                }
            }
            () = tokio::time::sleep_until(deadline), if closing => {
                debug!("Close acknowledgement timed out");
                break;
            }
        }
    }

    inner.finish(generation, Some(&connection), closure);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(Arc::new(Router::new()))
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.writer, WriterConfig::default());
    }

    #[test]
    fn test_initially_closed() {
        let transport = transport();
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(!transport.is_open());
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_when_closed_is_not_connected() {
        let transport = transport();
        let result = transport.request("foo", Value::Array(vec![])).await;
        assert!(matches!(result, Err(ButlerError::NotConnected)));
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let transport = transport();
        let mut events = transport.subscribe();
        transport.close();
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_connect_closes_abnormally() {
        let transport = transport();
        let mut events = transport.subscribe();

        // Port 1 is never listening.
        transport.open("ws://127.0.0.1:1");
        assert_eq!(transport.state(), ConnectionState::Connecting);

        match events.recv().await.unwrap() {
            TransportEvent::Error(message) => assert!(
                message.starts_with("Transport error: connect to ws://127.0.0.1:1 failed"),
                "unexpected error: {message}"
            ),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            TransportEvent::Close { code, .. } => assert_eq!(code, ABNORMAL_CLOSURE),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_while_connecting() {
        let transport = transport();
        let mut events = transport.subscribe();

        transport.open("ws://127.0.0.1:1");
        transport.close_with(4000, "bye");
        assert_eq!(transport.state(), ConnectionState::Closing);

        // Either the shutdown or the failed connect wins the race; both end
        // in a single Close event.
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Close { .. } => break,
                TransportEvent::Error(_) => continue,
                TransportEvent::Open => panic!("connection must not open"),
            }
        }
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_forwarded_call_when_closed() {
        let router = Arc::new(Router::new());
        let transport = Transport::new(Arc::clone(&router));
        transport.forward_calls();

        assert!(router.has_delegate(""));
        let result = router.call("player.play", &()).await;
        assert!(matches!(result, Err(ButlerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_forwarded_call_after_transport_dropped() {
        let router = Arc::new(Router::new());
        Transport::new(Arc::clone(&router)).forward_calls();

        let result = router.call("player.play", &()).await;
        assert!(matches!(result, Err(ButlerError::NotConnected)));
    }
}
