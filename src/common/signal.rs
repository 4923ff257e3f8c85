//! Done - one-shot "this is over" flag that can be awaited

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Set once, observed by any number of waiters.
#[derive(Debug, Default)]
pub struct Done {
    closed: AtomicBool,
    notify: Notify,
}

impl Done {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as done. Returns true only for the call that flipped it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once `close` has been called
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_close_once() {
        let done = Done::new();
        assert!(done.close());
        assert!(!done.close());
        assert!(done.is_closed());
        done.wait().await;
    }

    #[tokio::test]
    async fn test_wait_wakes() {
        let done = Arc::new(Done::new());
        let waiter = {
            let done = Arc::clone(&done);
            tokio::spawn(async move { done.wait().await })
        };
        tokio::task::yield_now().await;
        done.close();
        waiter.await.unwrap();
    }
}
