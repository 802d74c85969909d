//! Error types for butler-bus.

use std::any::Any;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for all router, transport, and dispatcher operations.
#[derive(Debug, Error)]
pub enum ButlerError {
    /// No delegate was registered anywhere in the prefix chain of a call.
    #[error("no delegate for method \"{0}\"")]
    NotFound(String),

    /// A request was attempted while the transport was not open.
    #[error("WebSocket not connected")]
    NotConnected,

    /// The connection was torn down before a response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A handler or delegate failed.
    #[error("{0}")]
    Handler(String),

    /// The remote peer answered a request with an error.
    #[error("{0}")]
    Remote(String),

    /// Protocol error (malformed frame, unexpected shape, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel-level failure reported by the transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backpressure timeout - writer queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket protocol or handshake error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl ButlerError {
    /// Build a handler failure from any displayable message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Result type alias using ButlerError.
pub type Result<T> = std::result::Result<T, ButlerError>;

/// Extract the message from a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
