//! Cooperative cancellation shared between a sync run and its HTTP calls

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    notify: Notify,
}

/// Cloneable cancellation flag
///
/// Checked between items by the sync engine and at every backoff sleep by
/// the resilient client. The engine brackets each run with [`begin_run`]
/// and [`end_run`]; [`cancel_run`] only takes effect inside that bracket,
/// so a request that arrives after a run finished leaves nothing behind.
///
/// [`begin_run`]: CancelToken::begin_run
/// [`end_run`]: CancelToken::end_run
/// [`cancel_run`]: CancelToken::cancel_run
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation unconditionally and wake any sleeper
    pub fn cancel(&self) {
        self.inner.state.store(CANCELLED, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Cancel the run in progress, if any
    ///
    /// Returns `false` when no run was in progress.
    pub fn cancel_run(&self) -> bool {
        let cancelled = self
            .inner
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            self.inner.notify.notify_waiters();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// Clear a previous request so the token can serve the next run
    pub fn reset(&self) {
        self.inner.state.store(IDLE, Ordering::SeqCst);
    }

    /// Mark a run as started, discarding any earlier request
    pub fn begin_run(&self) {
        self.inner.state.store(RUNNING, Ordering::SeqCst);
    }

    /// Mark the run as over; later [`cancel_run`](CancelToken::cancel_run) calls are no-ops
    pub fn end_run(&self) {
        self.reset();
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `false` when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}
