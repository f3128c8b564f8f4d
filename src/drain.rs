//! Active-request counter with graceful drain.
//!
//! Producer and consumer count the requests they are tracking. `stop()`
//! marks the component as stopping and resolves once the count reaches zero.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Counter of tracked requests that can be waited on.
#[derive(Debug)]
pub struct Drain {
    active: watch::Sender<usize>,
    stopping: AtomicBool,
}

impl Drain {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active,
            stopping: AtomicBool::new(false),
        }
    }

    /// A request started being tracked.
    pub fn begin(&self) {
        self.active.send_modify(|n| *n += 1);
    }

    /// A tracked request reached its terminal state.
    pub fn end(&self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Number of tracked requests.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Mark as stopping and wait for the count to reach zero.
    ///
    /// Resolves immediately when nothing is tracked. Every call waits on the
    /// same counter, so repeated calls resolve together.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.stopping.store(true, Ordering::Release);
        let mut rx = self.active.subscribe();

        async move {
            // The sender lives as long as its owner; an error means the owner
            // is gone and there is nothing left to wait for.
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_with_nothing_active() {
        let drain = Drain::new();

        tokio::time::timeout(Duration::from_millis(100), drain.stop())
            .await
            .unwrap();
        assert!(drain.is_stopping());
    }

    #[tokio::test]
    async fn test_stop_waits_for_zero() {
        let drain = Arc::new(Drain::new());
        drain.begin();
        drain.begin();

        let waiter = tokio::spawn(drain.stop());
        let second = tokio::spawn(drain.stop());

        drain.end();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drain.end();
        waiter.await.unwrap();
        second.await.unwrap();
        assert_eq!(drain.active(), 0);
    }

    #[test]
    fn test_end_saturates() {
        let drain = Drain::new();
        drain.end();
        assert_eq!(drain.active(), 0);
    }
}
