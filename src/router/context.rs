//! Dispatch context passed to handlers and delegates.
//!
//! A shared handler (for example one registered on the root namespace) can
//! inspect the context to learn which concrete name triggered it and which
//! part of that name was matched by its registration.
//!
//! # Example
//!
//! ```ignore
//! router.on("player", |ctx, args| {
//!     // emit("player.state", ...) arrives with prefix "player", suffix "state"
//!     tracing::info!(event = ctx.name(), suffix = ctx.suffix(), ?args);
//!     Ok(())
//! });
//! ```

use serde::Serialize;

/// Context for a single handler or delegate invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Context {
    /// The full name that was emitted or called.
    name: String,
    /// The namespace whose handler or delegate matched.
    prefix: String,
    /// The remainder of `name` below `prefix`.
    suffix: String,
}

impl Context {
    /// Create a new context.
    pub fn new(name: &str, prefix: &str, suffix: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    /// Get the dispatched name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the matched namespace.
    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Get the unmatched remainder.
    #[inline]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}
