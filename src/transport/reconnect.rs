//! Automatic reconnection.
//!
//! [`ReconnectSupervisor`] watches a [`Transport`]'s lifecycle events. Every
//! `Close` or `Error` schedules one reconnection attempt after the policy
//! delay, replacing any attempt already scheduled; `Open` cancels it. The
//! supervisor also republishes lifecycle events into the router as `open`,
//! `close` (`[code, reason]`) and `error` (`[message]`).

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use super::client::Transport;
use super::state::TransportEvent;
use crate::config::duration_ms;
use crate::router::Router;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(8);

/// Router event republished when the connection opens.
pub const OPEN_EVENT: &str = "open";

/// Router event republished when the connection closes.
pub const CLOSE_EVENT: &str = "close";

/// Router event republished on transport errors.
pub const ERROR_EVENT: &str = "error";

/// Delay schedule between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Always wait the same delay.
    Fixed {
        /// Delay before each attempt.
        #[serde(with = "duration_ms", rename = "delay_ms")]
        delay: Duration,
    },
    /// Double the delay after each failed attempt, up to `max`.
    Backoff {
        /// Delay before the first attempt.
        #[serde(with = "duration_ms", rename = "initial_ms")]
        initial: Duration,
        /// Upper bound on the delay.
        #[serde(with = "duration_ms", rename = "max_ms")]
        max: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (0 = first since last open).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay } => delay,
            ReconnectPolicy::Backoff { initial, max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Background task that keeps a transport connected.
///
/// Dropping the supervisor stops it; the transport itself stays as it is.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    /// Open `transport` to `address` and keep it connected.
    pub fn start(transport: Transport, address: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let address = address.into();
        // Subscribe before opening so the first Open is not missed.
        let events = transport.subscribe();
        transport.open(address.clone());

        let task = tokio::spawn(supervise(transport, address, policy, events));
        Self { task }
    }

    /// Stop reconnecting.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Check whether the supervisor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn supervise(
    transport: Transport,
    address: String,
    policy: ReconnectPolicy,
    mut events: Receiver<TransportEvent>,
) {
    let router = Arc::clone(transport.router());
    let mut attempt: u32 = 0;
    let mut retry: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconnect supervisor lagged behind transport events");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };

                match &event {
                    TransportEvent::Open => {
                        retry = None;
                        attempt = 0;
                    }
                    TransportEvent::Close { .. } | TransportEvent::Error(_) => {
                        let delay = policy.delay(attempt);
                        debug!(?delay, attempt, "Scheduling reconnect");
                        retry = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                }
                republish(&router, event);
            }
            () = wait(&mut retry) => {
                retry = None;
                attempt = attempt.saturating_add(1);
                info!(%address, attempt, "Reconnecting");
                transport.open(address.clone());
            }
        }
    }
}

/// Resolve when the scheduled attempt is due; never if none is scheduled.
async fn wait(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.await,
        None => pending().await,
    }
}

fn republish(router: &Router, event: TransportEvent) {
    let (name, args) = match event {
        TransportEvent::Open => (OPEN_EVENT, Vec::new()),
        TransportEvent::Close { code, reason } => (CLOSE_EVENT, vec![json!(code), json!(reason)]),
        TransportEvent::Error(message) => (ERROR_EVENT, vec![json!(message)]),
    };

    if let Err(e) = router.broadcast(name, &args) {
        warn!(event = name, error = %e, "Lifecycle handler failed");
    }
}
