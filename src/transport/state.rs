//! Connection state and lifecycle events.

use serde::Serialize;

/// Lifecycle state of the transport's connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Connected; requests may be sent.
    Open,
    /// Close requested, waiting for the peer.
    Closing,
    /// No connection.
    #[default]
    Closed,
}

impl ConnectionState {
    /// Check whether requests may be sent.
    #[inline]
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Lifecycle event published by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open.
    Open,
    /// The connection terminated (including failed connects).
    Close {
        /// WebSocket close code (1000 = normal, 1006 = abnormal).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// A transport-level fault (connect failure, malformed frame, etc.).
    Error(String),
}
