//! Completion sinks.
//!
//! A [`Completion`] is written exactly once and can be observed three ways,
//! chosen freely by the caller:
//!
//! - a blocking wait on a condition variable (`wait_blocking`)
//! - an async wait (`wait`)
//! - continuations registered with `on_complete`
//!
//! The completer never runs caller code while holding the slot lock, and
//! never blocks: a slow continuation delays only the task that completed it.

use crate::error::MuxResult;
use crate::protocol::RespValue;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Callback invoked once with the final result.
pub type Continuation = Box<dyn FnOnce(&MuxResult<RespValue>) + Send + 'static>;

#[derive(Default)]
struct Slot {
    result: Option<MuxResult<RespValue>>,
    continuations: Vec<Continuation>,
}

/// Write-once result cell with blocking, async and callback delivery.
#[derive(Default)]
pub struct Completion {
    slot: Mutex<Slot>,
    ready: Condvar,
    notify: Notify,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Completion")
            .field("complete", &slot.result.is_some())
            .field("continuations", &slot.continuations.len())
            .finish()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `result` and wakes every waiter.
    ///
    /// Returns `false` (and drops `result`) if a result was already stored.
    pub fn complete(&self, result: MuxResult<RespValue>) -> bool {
        let continuations = {
            let mut slot = self.slot.lock();
            if slot.result.is_some() {
                return false;
            }
            slot.result = Some(result.clone());
            std::mem::take(&mut slot.continuations)
        };

        self.ready.notify_all();
        self.notify.notify_waiters();

        for continuation in continuations {
            continuation(&result);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.slot.lock().result.is_some()
    }

    /// Returns a copy of the result if one has been stored.
    pub fn peek(&self) -> Option<MuxResult<RespValue>> {
        self.slot.lock().result.clone()
    }

    /// Registers a callback. Runs it immediately if already complete.
    pub fn on_complete(&self, continuation: Continuation) {
        let ready = {
            let mut slot = self.slot.lock();
            match &slot.result {
                Some(result) => result.clone(),
                None => {
                    slot.continuations.push(continuation);
                    return;
                }
            }
        };
        continuation(&ready);
    }

    /// Blocks the calling thread until a result is stored or `timeout`
    /// elapses. Must not be called from inside an async task.
    pub fn wait_blocking(&self, timeout: Duration) -> Option<MuxResult<RespValue>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.result.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.result.clone()
    }

    /// Waits asynchronously for the result.
    pub async fn wait(&self) -> MuxResult<RespValue> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();

            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }
}
