//! Counting wait primitive with timeout support.
//!
//! Tracks a number of in-flight operations and lets a coordinator block
//! until they have all completed, or until a timeout elapses. Used to
//! bound how long shutdown waits on a connection before forcing it closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Counter of in-flight operations that can be awaited.
#[derive(Debug, Default)]
pub struct Wait {
    count: AtomicUsize,
    notify: Notify,
}

impl Wait {
    /// Create a new wait with no in-flight operations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` in-flight operations.
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one in-flight operation as complete.
    pub fn done(&self) {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(1) => self.notify.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("Wait::done called with no operations in flight"),
        }
    }

    /// Register one in-flight operation, completed when the guard drops.
    pub fn enter(self: &Arc<Self>) -> WaitGuard {
        self.add(1);
        WaitGuard {
            wait: Arc::clone(self),
        }
    }

    /// Number of operations currently in flight.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the in-flight count reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a `done` racing with
            // the load cannot be missed.
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the in-flight count reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the timeout elapsed first.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_err()
    }
}

/// RAII handle for one in-flight operation.
#[derive(Debug)]
pub struct WaitGuard {
    wait: Arc<Wait>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.wait.done();
    }
}
