//! Backend transports implementing the [`Server`](crate::Server) and
//! [`Topic`](crate::Topic) contracts.

use std::{sync::Arc, time::Duration};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::api::ServeError;

pub mod file;
pub mod mem;

/// Bounded pool of message workers shared by the backend servers.
///
/// A permit is acquired before a worker task is spawned and released when
/// the task finishes, so the number of live workers never exceeds the
/// configured concurrency.
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Blocks until a worker slot is free.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// True when no worker is in flight.
    pub(crate) fn idle(&self) -> bool {
        self.permits.available_permits() == self.capacity
    }
}

/// Shutdown tail shared by the backend servers: polls the worker pool for
/// quiescence at `poll` intervals.
///
/// Returns [`ServeError::Closed`] once the pool is idle. If `deadline`
/// fires first, raises the receiver cancellation signal and returns
/// [`ServeError::DeadlineExceeded`].
pub(crate) async fn drain(
    pool: &WorkerPool,
    poll: Duration,
    deadline: &CancellationToken,
    receivers: &CancellationToken,
) -> ServeError {
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = deadline.cancelled() => {
                receivers.cancel();
                return ServeError::DeadlineExceeded;
            }
            _ = ticker.tick() => {
                if pool.idle() {
                    return ServeError::Closed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_pool_bounds_acquisition() {
        let pool = WorkerPool::new(2);
        let p1 = pool.acquire().await.unwrap();
        let _p2 = pool.acquire().await.unwrap();
        assert!(!pool.idle());

        // A third acquire must wait until a permit is released
        let waited = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waited.is_err());

        drop(p1);
        let _p3 = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_reports_closed_when_idle() {
        let pool = WorkerPool::new(4);
        let deadline = CancellationToken::new();
        let receivers = CancellationToken::new();

        let err = drain(&pool, Duration::from_millis(10), &deadline, &receivers).await;
        assert!(matches!(err, ServeError::Closed));
        assert!(!receivers.is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_deadline_cancels_receivers() {
        let pool = WorkerPool::new(1);
        let _busy = pool.acquire().await.unwrap();

        let deadline = CancellationToken::new();
        let receivers = CancellationToken::new();
        let d = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            d.cancel();
        });

        let err = drain(&pool, Duration::from_millis(10), &deadline, &receivers).await;
        assert!(matches!(err, ServeError::DeadlineExceeded));
        assert!(receivers.is_cancelled());
    }
}
