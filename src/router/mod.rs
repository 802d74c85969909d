//! Router module - namespaced publish/subscribe and delegate dispatch.
//!
//! Provides:
//! - [`Router`] - the router itself
//! - [`Context`] - the `{name, prefix, suffix}` value passed to handlers
//! - [`HandlerRegistry`] / [`DelegateRegistry`] - the backing registries
//! - [`prefix_chain`] - name decomposition
//!
//! # Example
//!
//! ```
//! use butler_bus::router::{Context, Router};
//! use serde_json::Value;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> butler_bus::Result<()> {
//! let router = Router::new();
//!
//! // Observe every event below "player"
//! router.on("player", |ctx, args| {
//!     println!("{} ({}): {:?}", ctx.name(), ctx.suffix(), args);
//!     Ok(())
//! });
//! router.emit("player.state", &("playing",))?;
//!
//! // Answer every call below "player"
//! router.register_fn("player", |ctx: &Context, _args: Vec<Value>| {
//!     Ok(format!("handled {}", ctx.suffix()))
//! });
//! let reply = router.call("player.play", &()).await?;
//! assert_eq!(reply, "handled play");
//! # Ok(())
//! # }
//! ```

mod bus;
mod context;
mod name;
mod registry;

pub use bus::{to_args, MissingDelegate, Router, RouterConfig};
pub use context::Context;
pub use name::{is_within, prefix_chain, SEPARATOR};
pub use registry::{
    BoxFuture, Delegate, DelegateRegistry, Handler, HandlerEntry, HandlerId, HandlerRegistry,
    SyncDelegate, TypedDelegate,
};
