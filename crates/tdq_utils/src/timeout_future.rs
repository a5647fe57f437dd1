use std::{future::Future, time::Duration};

/// A future that gives up after a deadline.
pub struct TimeoutFuture<F: Future> {
    fut: F,
    timeout: Duration,
}

impl<F: Future> TimeoutFuture<F> {
    pub fn new(fut: F, timeout: Duration) -> Self {
        Self { fut, timeout }
    }

    /// Waits for the future to complete, or returns [None] once the timeout elapses.
    pub async fn wait(self) -> Option<F::Output> {
        tokio::time::timeout(self.timeout, self.fut).await.ok()
    }
}
