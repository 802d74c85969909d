//! Handler and delegate registries.
//!
//! - [`HandlerRegistry`] keeps an ordered list of event handlers per
//!   namespace. Each registration gets a [`HandlerId`] used to remove it.
//! - [`DelegateRegistry`] keeps at most one delegate per namespace; the last
//!   registration wins.
//!
//! Delegates are stored as trait objects. [`TypedDelegate`] and
//! [`SyncDelegate`] adapt plain closures by deserializing the positional
//! arguments into the closure's parameter type and serializing its result.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::Context;
use crate::error::Result;

/// Boxed future for delegate results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Event handler: receives the dispatch context and positional arguments.
pub type Handler = Arc<dyn Fn(&Context, &[Value]) -> Result<()> + Send + Sync>;

/// Trait for delegate functions answering `call`/`apply`.
pub trait Delegate: Send + Sync + 'static {
    /// Invoke the delegate with raw positional arguments.
    fn call(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>>;
}

/// Decode positional arguments into a typed parameter.
///
/// The arguments are presented to serde as a JSON array, so tuples and
/// `Vec<Value>` both work as parameter types.
fn decode_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Array(args))?)
}

/// Wrapper that deserializes arguments before calling an async delegate.
pub struct TypedDelegate<F, T, R, Fut>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    delegate: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedDelegate<F, T, R, Fut>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed delegate.
    pub fn new(delegate: F) -> Self {
        Self {
            delegate,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Delegate for TypedDelegate<F, T, R, Fut>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.delegate)(ctx, parsed);
        Box::pin(async move {
            let result = fut.await?;
            Ok(serde_json::to_value(result)?)
        })
    }
}

/// Wrapper for delegates that answer synchronously.
pub struct SyncDelegate<F, T, R>
where
    F: Fn(&Context, T) -> Result<R> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    delegate: F,
    _phantom: PhantomData<fn(T) -> R>,
}

impl<F, T, R> SyncDelegate<F, T, R>
where
    F: Fn(&Context, T) -> Result<R> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    /// Create a new synchronous delegate.
    pub fn new(delegate: F) -> Self {
        Self {
            delegate,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R> Delegate for SyncDelegate<F, T, R>
where
    F: Fn(&Context, T) -> Result<R> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    fn call(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        // Runs before the future is returned, so the body executes on the
        // caller's task even if the future is never polled.
        let outcome = decode_args(args)
            .and_then(|parsed| (self.delegate)(&ctx, parsed))
            .and_then(|result| Ok(serde_json::to_value(result)?));
        Box::pin(async move { outcome })
    }
}

/// Token identifying one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

/// A registered handler with its id.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Registration id.
    pub id: HandlerId,
    /// The handler function.
    pub handler: Handler,
}

/// Registry mapping namespaces to ordered handler lists.
#[derive(Default)]
pub struct HandlerRegistry {
    /// Handlers by namespace, in registration order.
    handlers: HashMap<String, Vec<HandlerEntry>>,
    /// Ids of every handler currently registered.
    live: HashSet<HandlerId>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the list at `name`.
    pub fn insert(&mut self, name: &str, id: HandlerId, handler: Handler) {
        self.handlers
            .entry(name.to_string())
            .or_default()
            .push(HandlerEntry { id, handler });
        self.live.insert(id);
    }

    /// Remove the handler `id` from the list at `name`.
    ///
    /// Returns `false` if no such registration exists at `name`.
    pub fn remove(&mut self, name: &str, id: HandlerId) -> bool {
        let Some(entries) = self.handlers.get_mut(name) else {
            return false;
        };
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return false;
        };

        entries.remove(pos);
        if entries.is_empty() {
            self.handlers.remove(name);
        }
        self.live.remove(&id);
        true
    }

    /// Copy the handler list at `name`.
    pub fn snapshot(&self, name: &str) -> Vec<HandlerEntry> {
        self.handlers.get(name).cloned().unwrap_or_default()
    }

    /// Check whether a handler registration is still present.
    pub fn is_live(&self, id: HandlerId) -> bool {
        self.live.contains(&id)
    }

    /// Number of handlers registered at exactly `name`.
    pub fn len(&self, name: &str) -> usize {
        self.handlers.get(name).map_or(0, Vec::len)
    }

    /// Check if no handler is registered anywhere.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
        self.live.clear();
    }
}

/// Registry mapping namespaces to a single delegate.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delegate at `name`, replacing any previous one.
    pub fn set(&mut self, name: &str, delegate: Arc<dyn Delegate>) {
        self.delegates.insert(name.to_string(), delegate);
    }

    /// Clear the delegate at `name`.
    pub fn remove(&mut self, name: &str) -> bool {
        self.delegates.remove(name).is_some()
    }

    /// Get the delegate at exactly `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Delegate>> {
        self.delegates.get(name).cloned()
    }

    /// Check if a delegate is registered at exactly `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    /// Remove every delegate.
    pub fn clear(&mut self) {
        self.delegates.clear();
    }
}
