//! Timeout scheduling
//!
//! The coordinator only relies on the [`TimeoutScheduler`] contract. The
//! default [`TokioTimer`] runs each timeout as a sleeping tokio task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

/// Callback run when a timeout elapses
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle identifying one scheduled timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Schedules single-shot callbacks
pub trait TimeoutScheduler: Send + Sync {
    /// Run `callback` once after `duration` unless cancelled first
    fn schedule(&self, duration: Duration, callback: TimeoutCallback) -> TimerHandle;

    /// Cancel a scheduled callback. Cancelling a fired or unknown handle is a no-op.
    fn cancel(&self, handle: &TimerHandle);
}

/// [`TimeoutScheduler`] backed by `tokio::time::sleep`
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default)]
pub struct TokioTimer {
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timeouts scheduled and not yet fired or cancelled
    pub fn active(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl TimeoutScheduler for TokioTimer {
    fn schedule(&self, duration: Duration, callback: TimeoutCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id, ?duration, "TokioTimer::schedule: called");

        let tasks = Arc::clone(&self.tasks);
        // Hold the lock across spawn so the task cannot remove its entry before it is inserted
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let still_armed = tasks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id).is_some();
            if still_armed {
                callback();
            }
        });
        guard.insert(id, task.abort_handle());

        TimerHandle::new(id)
    }

    fn cancel(&self, handle: &TimerHandle) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id());
        if let Some(abort) = removed {
            debug!(id = handle.id(), "TokioTimer::cancel: aborted");
            abort.abort();
        }
    }
}
