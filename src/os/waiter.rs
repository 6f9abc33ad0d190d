//! Counting wake/wait rendezvous between callbacks and sequential code.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{GensioError, Result};

/// A counting block/wake primitive.
///
/// Every `wake()` is remembered: N wakes followed by N waits all succeed
/// without suspending. Clones share the same count.
#[derive(Debug, Clone)]
pub struct Waiter {
    permits: Arc<Semaphore>,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Increment the pending count, releasing one suspended waiter if any.
    pub fn wake(&self) {
        self.permits.add_permits(1);
    }

    /// Wait for one wake, or fail with `Timeout` once `timeout` has elapsed.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        self.wait_count(1, timeout).await
    }

    /// Wait for `count` wakes within a single timeout.
    pub async fn wait_count(&self, count: u32, timeout: Duration) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.permits.acquire_many(count)).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            // the semaphore is never closed
            Ok(Err(_)) => Err(GensioError::LocalClosed),
            Err(_) => Err(GensioError::Timeout),
        }
    }

    /// Consume a pending wake without suspending.
    pub fn try_wait(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wakes delivered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wakes_are_counted() {
        let waiter = Waiter::new();
        for _ in 0..5 {
            waiter.wake();
        }
        assert_eq!(waiter.pending(), 5);

        let start = Instant::now();
        for _ in 0..5 {
            waiter.wait(Duration::from_secs(5)).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn timeout_is_not_early() {
        let waiter = Waiter::new();
        let start = Instant::now();
        let res = waiter.wait(Duration::from_millis(60)).await;
        assert!(matches!(res, Err(GensioError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn wake_from_another_task() {
        let waiter = Waiter::new();
        let remote = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.wake();
            remote.wake();
        });
        waiter.wait_count(2, Duration::from_secs(5)).await.unwrap();
        assert!(!waiter.try_wait());
    }
}
