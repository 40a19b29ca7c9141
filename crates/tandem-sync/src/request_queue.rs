//! # Request Queue
//!
//! Bounded admission for outbound HTTP calls.
//!
//! ```text
//!   caller ──► pending < capacity? ──no──► RateLimited
//!                    │ yes
//!                    ▼
//!             wait for one of `max_concurrent` permits ──► run
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{SyncError, SyncResult};

pub struct RequestQueue {
    permits: Semaphore,
    pending: AtomicUsize,
    capacity: usize,
}

struct PendingSlot<'a>(&'a AtomicUsize);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RequestQueue {
    /// `capacity` counts both waiting and running calls.
    pub fn new(capacity: usize, max_concurrent: usize) -> Self {
        RequestQueue {
            permits: Semaphore::new(max_concurrent.max(1)),
            pending: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Calls currently waiting or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub async fn run<F, Fut, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(capacity = self.capacity, "Request queue full, rejecting call");
            return Err(SyncError::RateLimited {
                capacity: self.capacity,
            });
        }
        let _slot = PendingSlot(&self.pending);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        f().await
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pending", &self.pending())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_rejects_past_capacity() {
        let queue = Arc::new(RequestQueue::new(2, 1));
        let (tx, rx) = oneshot::channel::<()>();

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(|| async move {
                        let _ = rx.await;
                        Ok(1)
                    })
                    .await
            })
        };
        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run(|| async { Ok(2) }).await })
        };
        while queue.pending() < 2 {
            tokio::task::yield_now().await;
        }

        let rejected = queue.run(|| async { Ok(3) }).await;
        assert!(matches!(rejected, Err(SyncError::RateLimited { capacity: 2 })));

        tx.send(()).unwrap();
        assert_eq!(running.await.unwrap().unwrap(), 1);
        assert_eq!(waiting.await.unwrap().unwrap(), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_errors_release_slot() {
        let queue = RequestQueue::new(1, 1);
        let err = queue
            .run(|| async { Err::<(), _>(SyncError::Timeout(5)) })
            .await;
        assert!(err.is_err());
        assert_eq!(queue.pending(), 0);
        assert!(queue.run(|| async { Ok(()) }).await.is_ok());
    }
}
