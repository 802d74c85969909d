//! Aggregate configuration.
//!
//! Each component owns its configuration type next to its implementation
//! ([`RouterConfig`], [`TransportConfig`], [`ReconnectPolicy`],
//! [`DispatcherConfig`], [`WriterConfig`](crate::writer::WriterConfig)).
//! [`ButlerConfig`] bundles them so a process bootstrap can load everything
//! from one JSON document:
//!
//! ```
//! use butler_bus::config::ButlerConfig;
//! use butler_bus::router::MissingDelegate;
//!
//! let config = ButlerConfig::from_json_str(r#"{
//!     "address": "ws://127.0.0.1:26532",
//!     "router": { "missing_delegate": "ignore" },
//!     "reconnect": { "kind": "fixed", "delay_ms": 8000 },
//!     "dispatcher": { "excluded_namespaces": ["log", "metrics"] }
//! }"#).unwrap();
//!
//! assert_eq!(config.router.missing_delegate, MissingDelegate::Ignore);
//! assert_eq!(config.dispatcher.excluded_namespaces.len(), 2);
//! ```
//!
//! Durations are written in milliseconds.

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatcherConfig;
use crate::error::Result;
use crate::router::RouterConfig;
use crate::transport::{ReconnectPolicy, TransportConfig};

/// Default address a client connects to.
pub const DEFAULT_ADDRESS: &str = "ws://127.0.0.1:26532";

/// Configuration for a full client/server stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButlerConfig {
    /// WebSocket address the transport connects to (client) or binds (server).
    pub address: String,
    /// Router options.
    pub router: RouterConfig,
    /// Transport options.
    pub transport: TransportConfig,
    /// Reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// Dispatcher options.
    pub dispatcher: DispatcherConfig,
}

impl Default for ButlerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            router: RouterConfig::default(),
            transport: TransportConfig::default(),
            reconnect: ReconnectPolicy::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ButlerConfig {
    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Serde helper for `Duration` fields stored as milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as whole milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserialize a duration from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
