//! In-flight request bookkeeping.
//!
//! [`PendingRequests`] hands out sequential request ids and keeps one
//! `oneshot` sender per outstanding request. Every entry is settled exactly
//! once: by its response, or by [`PendingRequests::reject_all`] when the
//! connection goes away.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ButlerError, Result};

/// Receiver side of one pending request.
pub type ResponseReceiver = oneshot::Receiver<Result<Value>>;

#[derive(Default)]
struct PendingState {
    next_id: u64,
    waiting: HashMap<u64, oneshot::Sender<Result<Value>>>,
    closed: bool,
}

/// Pending-request map for one connection.
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    /// Create an empty map; ids start at 0.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and register a waiter for it.
    ///
    /// Fails with `ConnectionClosed` once [`PendingRequests::reject_all`] ran.
    pub fn allocate(&self) -> Result<(u64, ResponseReceiver)> {
        let mut state = self.lock();
        if state.closed {
            return Err(ButlerError::ConnectionClosed);
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = oneshot::channel();
        state.waiting.insert(id, tx);
        Ok((id, rx))
    }

    /// Settle request `id`. Returns `false` if no such request is pending.
    pub fn settle(&self, id: u64, result: Result<Value>) -> bool {
        let Some(tx) = self.lock().waiting.remove(&id) else {
            return false;
        };
        // The caller may have stopped waiting; that is not an error.
        let _ = tx.send(result);
        true
    }

    /// Forget request `id` without settling it.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().waiting.remove(&id).is_some()
    }

    /// Reject every pending request with `ConnectionClosed` and refuse new
    /// ones. Returns the number of requests rejected.
    pub fn reject_all(&self) -> usize {
        let waiting = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.waiting)
        };

        let count = waiting.len();
        for (_, tx) in waiting {
            let _ = tx.send(Err(ButlerError::ConnectionClosed));
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Check if no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
