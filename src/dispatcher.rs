//! Server-side request dispatcher.
//!
//! A [`Dispatcher`] accepts WebSocket peers and mirrors the client
//! [`Transport`](crate::transport::Transport):
//!
//! - every inbound request is applied to the local [`Router`] in its own
//!   task, and the outcome is sent back as a response frame;
//! - every local broadcast outside the excluded namespaces is serialized once
//!   and queued to every connected peer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use butler_bus::{Context, Dispatcher, Router};
//! use serde_json::Value;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> butler_bus::Result<()> {
//! let router = Arc::new(Router::new());
//! router.register_fn("echo", |_: &Context, args: Vec<Value>| Ok(args));
//!
//! let dispatcher = Dispatcher::new(Arc::clone(&router));
//! let listener = TcpListener::bind("127.0.0.1:26532").await?;
//! dispatcher.serve(listener).await
//! # }
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, ButlerError, Result};
use crate::protocol::{Broadcast, Frame, Request, Response};
use crate::router::{is_within, HandlerId, Router};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Namespaces kept local by default.
pub const DEFAULT_EXCLUDED_NAMESPACES: &[&str] = &["log"];

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Broadcasts inside these namespaces are never sent to peers.
    pub excluded_namespaces: Vec<String>,
    /// Writer task options for each peer.
    pub writer: WriterConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            excluded_namespaces: DEFAULT_EXCLUDED_NAMESPACES
                .iter()
                .map(|ns| ns.to_string())
                .collect(),
            writer: WriterConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Check whether broadcasts of `name` stay local.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_namespaces
            .iter()
            .any(|namespace| is_within(name, namespace))
    }
}

struct DispatcherInner {
    router: Arc<Router>,
    config: DispatcherConfig,
    peers: Mutex<HashMap<u64, WriterHandle>>,
    next_peer_id: AtomicU64,
    /// Root handler feeding local broadcasts to peers.
    fan_out: HandlerId,
}

/// Serves router delegates to WebSocket peers and relays router broadcasts
/// to them.
///
/// Cheap to clone; clones share peers. The broadcast relay is removed from
/// the router when the last clone is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher with the default configuration.
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_config(router, DispatcherConfig::default())
    }

    /// Create a dispatcher with the given configuration.
    pub fn with_config(router: Arc<Router>, config: DispatcherConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DispatcherInner>| {
            let relay = weak.clone();
            let fan_out = router.on_all(move |ctx, args| {
                if let Some(inner) = relay.upgrade() {
                    inner.fan_out(ctx.name(), args);
                }
                Ok(())
            });

            DispatcherInner {
                router,
                config,
                peers: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(1),
                fan_out,
            }
        });

        Self { inner }
    }

    /// The router requests are applied to.
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.inner.lock_peers().len()
    }

    /// Accept peers from `listener` until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Dispatcher listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.serve_peer(stream).await {
                    warn!(%addr, error = %e, "Peer failed");
                }
            });
        }
    }

    /// Perform the WebSocket handshake on `stream` and serve it until it
    /// closes.
    pub async fn serve_peer<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let socket = tokio_tungstenite::accept_async(stream).await?;
        let (sink, mut stream) = socket.split();
        let (writer, _writer_task) = spawn_writer_task(sink, self.inner.config.writer.clone());

        let peer = self.inner.add_peer(writer.clone());
        info!(peer, "Peer connected");

        let result = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_text(&writer, &text),
                Some(Ok(Message::Binary(_))) => debug!(peer, "Ignoring binary frame"),
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                | None => break Ok(()),
                Some(Err(e)) => break Err(ButlerError::from(e)),
            }
        };

        self.inner.remove_peer(peer);
        info!(peer, "Peer disconnected");
        result
    }

    /// Decode one inbound text and answer it asynchronously.
    ///
    /// A malformed request is still answered with an error response when
    /// its `id` can be read.
    fn handle_text(&self, writer: &WriterHandle, text: &str) {
        match Frame::decode(text) {
            Ok(Frame::Request(request)) => {
                let dispatcher = self.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let response = dispatcher.handle_request(request).await;
                    send_response(&writer, response).await;
                });
            }
            Ok(_) => warn!("Ignoring non-request frame from peer"),
            Err(e) => match salvage_id(text) {
                Some(id) => {
                    warn!(id, error = %e, "Malformed request from peer");
                    let writer = writer.clone();
                    let response = Response::err(id, e.to_string());
                    tokio::spawn(async move { send_response(&writer, response).await });
                }
                None => warn!(error = %e, "Malformed frame from peer"),
            },
        }
    }

    /// Apply one request to the router and build its response.
    ///
    /// Delegate errors and panics become error responses.
    pub async fn handle_request(&self, request: Request) -> Response {
        let id = request.id;
        let method = request.method.clone();
        let args = request.into_args();

        let outcome = AssertUnwindSafe(self.inner.router.apply(&method, args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Response::ok(id, result),
            Ok(Err(e)) => {
                debug!(id, method = %method, error = %e, "Request failed");
                Response::err(id, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(id, method = %method, message = %message, "Delegate panicked");
                Response::err(id, message)
            }
        }
    }
}

async fn send_response(writer: &WriterHandle, response: Response) {
    let id = response.id;
    let sent = match Frame::from(response).encode() {
        Ok(text) => writer.send_text(text).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        debug!(id, error = %e, "Dropping response");
    }
}

/// Read the request id from a text that did not decode as a frame.
fn salvage_id(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}

impl DispatcherInner {
    fn lock_peers(&self) -> MutexGuard<'_, HashMap<u64, WriterHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_peer(&self, writer: WriterHandle) -> u64 {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.lock_peers().insert(id, writer);
        id
    }

    fn remove_peer(&self, id: u64) -> bool {
        self.lock_peers().remove(&id).is_some()
    }

    /// Queue a broadcast to every peer; never waits on a slow one.
    fn fan_out(&self, name: &str, args: &[Value]) {
        if self.config.is_excluded(name) {
            return;
        }

        let text = match Frame::from(Broadcast::new(name, args.to_vec())).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(event = name, error = %e, "Failed to encode broadcast");
                return;
            }
        };

        let mut peers = self.lock_peers();
        peers.retain(|peer, writer| match writer.try_send(OutboundFrame::Text(text.clone())) {
            Ok(()) => true,
            Err(ButlerError::BackpressureTimeout) => {
                warn!(peer, event = name, "Peer queue full, dropping broadcast");
                true
            }
            Err(_) => {
                debug!(peer, "Pruning closed peer");
                false
            }
        });
        debug!(event = name, recipients = peers.len(), "Broadcast relayed");
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.router.off("", self.fan_out);
    }
}
