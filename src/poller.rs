//! Interval-based fetch-and-cancel primitive.
//!
//! `StatusPoller::start` runs a fetch immediately and then again `interval`
//! after each fetch *completes*, so a slow server never sees overlapping
//! requests. The returned `PollSession` owns the cancellation.
//!
//! Callbacks run while the session's active flag is locked. `stop()` takes the
//! same lock, so once it returns no callback is running and none will run,
//! including for a fetch that was already in flight. For the same reason a
//! callback must not call `stop()` on its own session; it returns
//! `ControlFlow::Break(())` instead.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Spawns poll loops. Holds no state of its own.
pub struct StatusPoller;

impl StatusPoller {
    /// Starts polling `fetch` every `interval` (measured from completion).
    ///
    /// Errors go to `on_error` and do not stop polling unless the callback
    /// says so. Must be called inside a tokio runtime.
    pub fn start<T, E, F, Fut, R, X>(
        mut fetch: F,
        interval: Duration,
        mut on_result: R,
        mut on_error: X,
    ) -> PollSession
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        R: FnMut(T) -> ControlFlow<()> + Send + 'static,
        X: FnMut(E) -> ControlFlow<()> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            active: Mutex::new(true),
            stopped: Notify::new(),
            ticks: AtomicU64::new(0),
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let shared = task_shared;
            loop {
                if !shared.is_active() {
                    break;
                }

                let outcome = tokio::select! {
                    outcome = fetch() => outcome,
                    _ = shared.stopped.notified() => break,
                };

                let flow = {
                    let mut active = shared.active.lock().unwrap_or_else(PoisonError::into_inner);
                    if !*active {
                        // Stopped while the fetch was in flight; drop the result.
                        break;
                    }
                    shared.ticks.fetch_add(1, Ordering::SeqCst);
                    let flow = match outcome {
                        Ok(value) => on_result(value),
                        Err(error) => on_error(error),
                    };
                    if flow.is_break() {
                        *active = false;
                    }
                    flow
                };

                if flow.is_break() {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shared.stopped.notified() => break,
                }
            }
        });

        PollSession { shared }
    }
}

struct Shared {
    active: Mutex<bool>,
    stopped: Notify,
    ticks: AtomicU64,
}

impl Shared {
    fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one running poll loop. Dropping it stops the loop.
pub struct PollSession {
    shared: Arc<Shared>,
}

impl PollSession {
    /// Stops the loop. Idempotent. After this returns no callback runs again.
    pub fn stop(&self) {
        let mut active = self
            .shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *active {
            *active = false;
            self.shared.stopped.notify_one();
        }
    }

    /// False once stopped, either explicitly or by a callback returning `Break`.
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Number of fetch results that were delivered to a callback.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }
}

impl Drop for PollSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSession")
            .field("active", &self.is_active())
            .field("ticks", &self.ticks())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
