//! # butler-bus
//!
//! Namespaced publish/subscribe and delegate router with a WebSocket
//! transport that carries calls and events between processes.
//!
//! ## Architecture
//!
//! - **Router** (in-process): dot-separated names form a namespace tree.
//!   Events reach every handler along the name's prefix chain; calls reach the
//!   single most specific delegate.
//! - **Transport** (client): one reconnectable WebSocket connection. Outbound
//!   requests carry sequence ids and are correlated with their responses;
//!   inbound broadcasts are re-emitted into the local router.
//! - **Dispatcher** (server): applies inbound requests to its router and
//!   relays the router's broadcasts to every connected peer.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use butler_bus::transport::ReconnectPolicy;
//! use butler_bus::{ReconnectSupervisor, Router, Transport};
//!
//! #[tokio::main]
//! async fn main() -> butler_bus::Result<()> {
//!     let router = Arc::new(Router::new());
//!     router.on("player", |ctx, args| {
//!         println!("{}: {:?}", ctx.name(), args);
//!         Ok(())
//!     });
//!
//!     let transport = Transport::new(Arc::clone(&router));
//!     transport.forward_calls();
//!     let _supervisor = ReconnectSupervisor::start(
//!         transport,
//!         "ws://127.0.0.1:26532",
//!         ReconnectPolicy::default(),
//!     );
//!
//!     // Answered by the remote dispatcher.
//!     let volume = router.call("player.volume", &()).await?;
//!     println!("volume: {volume}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod router;
pub mod transport;
pub mod writer;

pub use config::ButlerConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{ButlerError, Result};
pub use router::{Context, HandlerId, MissingDelegate, Router, RouterConfig};
pub use transport::{
    ConnectionState, ReconnectPolicy, ReconnectSupervisor, Transport, TransportConfig,
    TransportEvent,
};
