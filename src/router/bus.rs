//! The namespace router.
//!
//! [`Router`] combines a [`HandlerRegistry`] for publish/subscribe with a
//! [`DelegateRegistry`] for single-delegate calls. Both walk the prefix chain
//! of the dispatched name, most-specific first:
//!
//! - `broadcast`/`emit` invoke every handler at every prefix.
//! - `apply`/`call` invoke only the delegate at the first prefix that has one.
//!
//! Registry locks are never held while user code runs, so handlers and
//! delegates may freely re-enter the router.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::{
    Delegate, DelegateRegistry, HandlerEntry, HandlerId, HandlerRegistry, SyncDelegate,
    TypedDelegate,
};
use super::{prefix_chain, Context};
use crate::error::{ButlerError, Result};

/// What `apply`/`call` does when no delegate exists in the whole chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDelegate {
    /// Fail with [`ButlerError::NotFound`].
    #[default]
    Fail,
    /// Succeed with `null`.
    Ignore,
}

/// Router configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Policy for calls that find no delegate.
    pub missing_delegate: MissingDelegate,
}

/// Both registries behind one lock so `reset` is atomic.
#[derive(Default)]
struct Registries {
    handlers: HandlerRegistry,
    delegates: DelegateRegistry,
}

/// Hierarchical publish/subscribe and delegate router.
///
/// Construct one per process (or per test) and share it by `Arc`.
pub struct Router {
    config: RouterConfig,
    registries: Mutex<Registries>,
    next_handler_id: AtomicU64,
}

impl Router {
    /// Create a router with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a router with the given configuration.
    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            config,
            registries: Mutex::new(Registries::default()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// Get the router configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Registries> {
        // Handlers never run under the lock, so a poisoned guard still holds
        // consistent registries.
        self.registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Publish / subscribe
    // ------------------------------------------------------------------

    /// Append a handler at `name` (`""` observes every event).
    ///
    /// Returns the id to pass to [`Router::off`].
    pub fn on<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&Context, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.lock().handlers.insert(name, id, Arc::new(handler));
        id
    }

    /// Append a handler at the root namespace.
    pub fn on_all<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Context, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        self.on("", handler)
    }

    /// Remove a handler previously added at `name`.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        self.lock().handlers.remove(name, id)
    }

    /// Invoke every handler along the prefix chain of `name` with `args`.
    ///
    /// Handler lists are snapshotted before the first invocation. A handler
    /// removed during the pass is skipped if its turn has not come yet;
    /// handlers added during the pass do not fire until the next one. The
    /// first handler error aborts the pass and is returned.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> Result<()> {
        let passes: Vec<(Context, Vec<HandlerEntry>)> = {
            let registries = self.lock();
            prefix_chain(name)
                .into_iter()
                .map(|(prefix, suffix)| {
                    (
                        Context::new(name, prefix, suffix),
                        registries.handlers.snapshot(prefix),
                    )
                })
                .filter(|(_, entries)| !entries.is_empty())
                .collect()
        };

        for (ctx, entries) in passes {
            for entry in entries {
                if !self.lock().handlers.is_live(entry.id) {
                    continue;
                }
                (entry.handler)(&ctx, args)?;
            }
        }

        Ok(())
    }

    /// Serialize `payload` into positional arguments and broadcast them.
    ///
    /// Sequences (tuples, arrays, `Vec`s) spread into one argument per
    /// element, `()` yields no arguments, and any other value becomes a single
    /// argument. Wrap a sequence in a one-tuple to pass it as one argument.
    pub fn emit<T: Serialize + ?Sized>(&self, name: &str, payload: &T) -> Result<()> {
        let args = to_args(payload)?;
        self.broadcast(name, &args)
    }

    // ------------------------------------------------------------------
    // Delegates
    // ------------------------------------------------------------------

    /// Install an async delegate at `name`, replacing any previous one.
    ///
    /// Positional arguments are deserialized into `T` (a tuple or
    /// `Vec<Value>`); the result is serialized back to JSON.
    pub fn register<F, T, R, Fut>(&self, name: &str, delegate: F)
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register_delegate(name, Arc::new(TypedDelegate::new(delegate)));
    }

    /// Install a synchronous delegate at `name`.
    pub fn register_fn<F, T, R>(&self, name: &str, delegate: F)
    where
        F: Fn(&Context, T) -> Result<R> + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
        R: Serialize + 'static,
    {
        self.register_delegate(name, Arc::new(SyncDelegate::new(delegate)));
    }

    /// Install a pre-built delegate at `name`.
    pub fn register_delegate(&self, name: &str, delegate: Arc<dyn Delegate>) {
        self.lock().delegates.set(name, delegate);
    }

    /// Clear the delegate at `name`.
    pub fn unregister(&self, name: &str) -> bool {
        self.lock().delegates.remove(name)
    }

    /// Check whether a delegate is installed at exactly `name`.
    pub fn has_delegate(&self, name: &str) -> bool {
        self.lock().delegates.contains(name)
    }

    /// Number of handlers installed at exactly `name`.
    pub fn handler_count(&self, name: &str) -> usize {
        self.lock().handlers.len(name)
    }

    /// Find the first delegate along the prefix chain of `name`.
    fn resolve(&self, name: &str) -> Option<(Arc<dyn Delegate>, Context)> {
        let registries = self.lock();
        prefix_chain(name).into_iter().find_map(|(prefix, suffix)| {
            registries
                .delegates
                .get(prefix)
                .map(|delegate| (delegate, Context::new(name, prefix, suffix)))
        })
    }

    /// Invoke the most specific delegate for `name` with positional `args`.
    pub async fn apply(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let Some((delegate, ctx)) = self.resolve(name) else {
            return match self.config.missing_delegate {
                MissingDelegate::Fail => Err(ButlerError::NotFound(name.to_string())),
                MissingDelegate::Ignore => {
                    tracing::debug!(method = name, "no delegate, ignoring call");
                    Ok(Value::Null)
                }
            };
        };

        delegate.call(ctx, args).await
    }

    /// Serialize `payload` into positional arguments (see [`Router::emit`])
    /// and apply them.
    pub async fn call<T: Serialize + ?Sized>(&self, name: &str, payload: &T) -> Result<Value> {
        let args = to_args(payload)?;
        self.apply(name, args).await
    }

    /// Like [`Router::call`], deserializing the result into `R`.
    pub async fn call_as<T, R>(&self, name: &str, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call(name, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Remove every handler and delegate.
    pub fn reset(&self) {
        let mut registries = self.lock();
        registries.handlers.clear();
        registries.delegates.clear();
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Convert a serializable payload into positional arguments.
pub fn to_args<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<Value>> {
    Ok(match serde_json::to_value(payload)? {
        Value::Array(args) => args,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// One recorded handler/delegate invocation.
    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        spy: &'static str,
        name: String,
        prefix: String,
        suffix: String,
        args: Vec<Value>,
    }

    fn call(spy: &'static str, name: &str, prefix: &str, suffix: &str, args: Value) -> Call {
        let args = match args {
            Value::Array(a) => a,
            _ => panic!("args must be an array"),
        };
        Call {
            spy,
            name: name.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
            args,
        }
    }

    /// Records invocations across handlers and delegates.
    #[derive(Clone, Default)]
    struct Agency {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl Agency {
        fn record(&self, spy: &'static str, ctx: &Context, args: &[Value]) {
            self.calls.lock().unwrap().push(Call {
                spy,
                name: ctx.name().into(),
                prefix: ctx.prefix().into(),
                suffix: ctx.suffix().into(),
                args: args.to_vec(),
            });
        }

        fn handler(
            &self,
            spy: &'static str,
        ) -> impl Fn(&Context, &[Value]) -> Result<()> + Send + Sync + 'static {
            let agency = self.clone();
            move |ctx, args| {
                agency.record(spy, ctx, args);
                Ok(())
            }
        }

        fn delegate(
            &self,
            spy: &'static str,
        ) -> impl Fn(&Context, Vec<Value>) -> Result<&'static str> + Send + Sync + 'static {
            let agency = self.clone();
            move |ctx, args| {
                agency.record(spy, ctx, &args);
                Ok(spy)
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_on_adds_listeners() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("foo", agency.handler("one"));
        router.on("foo", agency.handler("two"));

        router.emit("foo", &(1,)).unwrap();
        router.emit("bar", &(2,)).unwrap();
        router.emit("foo", &(3,)).unwrap();

        assert_eq!(
            agency.calls(),
            vec![
                call("one", "foo", "foo", "", json!([1])),
                call("two", "foo", "foo", "", json!([1])),
                call("one", "foo", "foo", "", json!([3])),
                call("two", "foo", "foo", "", json!([3])),
            ]
        );
    }

    #[test]
    fn test_off_removes_listeners() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("foo", agency.handler("one"));
        let two = router.on("foo", agency.handler("two"));
        router.on("foo", agency.handler("three"));
        assert!(router.off("foo", two));

        router.emit("foo", &()).unwrap();

        assert_eq!(
            agency.calls(),
            vec![
                call("one", "foo", "foo", "", json!([])),
                call("three", "foo", "foo", "", json!([])),
            ]
        );
    }

    #[test]
    fn test_off_during_emit_skips_pending_handlers() {
        let router = Arc::new(Router::new());
        let agency = Agency::default();
        let ids: Arc<Mutex<Vec<HandlerId>>> = Arc::default();

        let r = Arc::clone(&router);
        let pending = Arc::clone(&ids);
        router.on("foo.bar", move |_, _| {
            let ids = pending.lock().unwrap().clone();
            r.off("foo.bar", ids[0]);
            r.off("foo", ids[1]);
            Ok(())
        });
        let one = router.on("foo.bar", agency.handler("one"));
        let two = router.on("foo", agency.handler("two"));
        ids.lock().unwrap().extend([one, two]);

        router.emit("foo.bar", &()).unwrap();
        router.emit("foo.bar", &()).unwrap();

        assert!(agency.calls().is_empty());
    }

    #[test]
    fn test_off_during_emit_leaves_earlier_handlers() {
        let router = Arc::new(Router::new());
        let agency = Agency::default();

        let one = router.on("foo.bar", agency.handler("one"));
        let r = Arc::clone(&router);
        router.on("foo", move |_, _| {
            r.off("foo.bar", one);
            Ok(())
        });

        router.emit("foo.bar", &()).unwrap();
        router.emit("foo.bar", &()).unwrap();

        assert_eq!(
            agency.calls(),
            vec![call("one", "foo.bar", "foo.bar", "", json!([]))]
        );
    }

    #[test]
    fn test_on_during_emit_fires_next_pass() {
        let router = Arc::new(Router::new());
        let agency = Agency::default();

        let r = Arc::clone(&router);
        let a = agency.clone();
        let added = Arc::new(std::sync::atomic::AtomicBool::new(false));
        router.on("foo.bar", move |_, _| {
            if !added.swap(true, Ordering::SeqCst) {
                r.on("foo", a.handler("late"));
            }
            Ok(())
        });

        router.emit("foo.bar", &()).unwrap();
        assert!(agency.calls().is_empty());

        router.emit("foo.bar", &()).unwrap();
        assert_eq!(
            agency.calls(),
            vec![call("late", "foo.bar", "foo", "bar", json!([]))]
        );
    }

    #[test]
    fn test_emit_fires_most_specific_first() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("", agency.handler("one"));
        router.on("foo", agency.handler("two"));
        router.on("foo.bar", agency.handler("three"));
        router.on("foo.baz", agency.handler("four"));

        router.emit("foo.bar", &(1, 2)).unwrap();

        assert_eq!(
            agency.calls(),
            vec![
                call("three", "foo.bar", "foo.bar", "", json!([1, 2])),
                call("two", "foo.bar", "foo", "bar", json!([1, 2])),
                call("one", "foo.bar", "", "foo.bar", json!([1, 2])),
            ]
        );
    }

    #[test]
    fn test_broadcast_matches_emit() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("", agency.handler("one"));
        router.on("foo", agency.handler("two"));
        router.on("foo.bar", agency.handler("three"));

        router.broadcast("foo.bar", &[json!(1), json!(2)]).unwrap();

        assert_eq!(
            agency.calls(),
            vec![
                call("three", "foo.bar", "foo.bar", "", json!([1, 2])),
                call("two", "foo.bar", "foo", "bar", json!([1, 2])),
                call("one", "foo.bar", "", "foo.bar", json!([1, 2])),
            ]
        );
    }

    #[test]
    fn test_ancestor_fires_exactly_once() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("a", agency.handler("a"));

        router.emit("a.b.c.d", &()).unwrap();

        let calls = agency.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].suffix, "b.c.d");
    }

    #[test]
    fn test_handler_error_aborts_pass() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("foo", |_, _| Err(ButlerError::handler("boom")));
        router.on("foo", agency.handler("after"));
        router.on("", agency.handler("root"));

        let err = router.emit("foo", &()).unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert!(agency.calls().is_empty());
    }

    #[test]
    fn test_emit_scalar_is_single_arg() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("foo", agency.handler("one"));

        router.emit("foo", "hello").unwrap();
        router.emit("foo", &(vec![1, 2],)).unwrap();

        assert_eq!(
            agency.calls(),
            vec![
                call("one", "foo", "foo", "", json!(["hello"])),
                call("one", "foo", "foo", "", json!([[1, 2]])),
            ]
        );
    }

    #[tokio::test]
    async fn test_register_last_wins() {
        let router = Router::new();
        let agency = Agency::default();
        router.register_fn("foo", agency.delegate("one"));
        router.register_fn("foo", agency.delegate("two"));

        let result = router.call("foo", &(1,)).await.unwrap();

        assert_eq!(result, json!("two"));
        assert_eq!(agency.calls(), vec![call("two", "foo", "foo", "", json!([1]))]);
    }

    #[tokio::test]
    async fn test_unregister_then_call_fails() {
        let router = Router::new();
        let agency = Agency::default();
        router.register_fn("foo", agency.delegate("one"));
        router.register_fn("foo", agency.delegate("two"));
        assert!(router.unregister("foo"));

        let err = router.call("foo", &()).await.unwrap_err();

        assert!(matches!(err, ButlerError::NotFound(ref name) if name == "foo"));
        assert!(agency.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_then_call_ignored() {
        let router = Router::with_config(RouterConfig {
            missing_delegate: MissingDelegate::Ignore,
        });
        let agency = Agency::default();
        router.register_fn("foo", agency.delegate("one"));
        router.unregister("foo");

        let result = router.call("foo", &()).await.unwrap();

        assert_eq!(result, Value::Null);
        assert!(agency.calls().is_empty());
    }

    #[tokio::test]
    async fn test_call_fires_most_specific_delegate() {
        let router = Router::new();
        let agency = Agency::default();
        router.register_fn("", agency.delegate("one"));
        router.register_fn("foo", agency.delegate("two"));
        router.register_fn("foo.bar", agency.delegate("three"));
        router.register_fn("foo.baz", agency.delegate("four"));

        let results = vec![
            router.call("baz", &(1,)).await.unwrap(),
            router.call("foo", &(2,)).await.unwrap(),
            router.call("foo.bar.baz", &(3,)).await.unwrap(),
        ];

        assert_eq!(results, vec![json!("one"), json!("two"), json!("three")]);
        assert_eq!(
            agency.calls(),
            vec![
                call("one", "baz", "", "baz", json!([1])),
                call("two", "foo", "foo", "", json!([2])),
                call("three", "foo.bar.baz", "foo.bar", "baz", json!([3])),
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_matches_call() {
        let router = Router::new();
        let agency = Agency::default();
        router.register_fn("", agency.delegate("one"));
        router.register_fn("foo.bar", agency.delegate("three"));

        assert_eq!(router.apply("baz", vec![json!(1)]).await.unwrap(), json!("one"));
        assert_eq!(
            router.apply("foo.bar.baz", vec![json!(3)]).await.unwrap(),
            json!("three")
        );
        assert_eq!(
            agency.calls(),
            vec![
                call("one", "baz", "", "baz", json!([1])),
                call("three", "foo.bar.baz", "foo.bar", "baz", json!([3])),
            ]
        );
    }

    #[tokio::test]
    async fn test_async_delegate() {
        let router = Router::new();
        router.register("math.add", |_ctx: Context, (a, b): (i64, i64)| async move {
            tokio::task::yield_now().await;
            Ok(a + b)
        });

        let sum: i64 = router.call_as("math.add", &(2, 40)).await.unwrap();
        assert_eq!(sum, 42);
    }

    #[tokio::test]
    async fn test_delegate_error_propagates() {
        let router = Router::new();
        router.register_fn("foo", |_: &Context, _: Vec<Value>| -> Result<Value> {
            Err(ButlerError::handler("boom"))
        });

        let err = router.call("foo", &()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_reset_removes_everything() {
        let router = Router::new();
        let agency = Agency::default();
        router.on("foo", agency.handler("one"));
        router.on("foo", agency.handler("two"));
        router.on("bar", agency.handler("three"));
        router.register_fn("foo", agency.delegate("one"));
        router.register_fn("", agency.delegate("root"));
        router.reset();

        router.emit("foo", &()).unwrap();
        router.emit("bar", &()).unwrap();
        assert!(router.call("foo", &()).await.is_err());
        assert!(router.call("bar", &()).await.is_err());

        assert!(agency.calls().is_empty());
        assert_eq!(router.handler_count("foo"), 0);
        assert!(!router.has_delegate(""));
    }

    #[test]
    fn test_to_args() {
        assert_eq!(to_args(&()).unwrap(), Vec::<Value>::new());
        assert_eq!(to_args(&(1, "a")).unwrap(), vec![json!(1), json!("a")]);
        assert_eq!(to_args(&json!({"k": 1})).unwrap(), vec![json!({"k": 1})]);
    }
}
