//! Bounded-retry lock proxy
//!
//! Grid lock calls can fail transiently while the topology changes (a node
//! joins or leaves and partitions move). [`RetryingLock`] masks those
//! failures by retrying each operation a fixed number of times with a fixed
//! pause, surfacing the last error only once the attempts are used up.

use crate::error::{ClusterError, Result};
use crate::grid::Grid;
use crate::metrics;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Raw exclusive-lock operations
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Acquire `name` for `holder`; `wait = None` blocks until acquired.
    /// Returns `false` when the wait expires.
    async fn acquire(&self, name: &str, holder: &str, wait: Option<Duration>) -> Result<bool>;

    /// Release one hold; `false` if `holder` does not own the lock
    async fn release(&self, name: &str, holder: &str) -> Result<bool>;
}

/// Locks served by the grid's native lock primitive
pub struct GridLockBackend {
    grid: Arc<dyn Grid>,
}

impl GridLockBackend {
    pub fn new(grid: Arc<dyn Grid>) -> Self {
        Self { grid }
    }
}

#[async_trait]
impl LockBackend for GridLockBackend {
    async fn acquire(&self, name: &str, holder: &str, wait: Option<Duration>) -> Result<bool> {
        self.grid.lock_acquire(name, holder, wait).await
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        self.grid.lock_release(name, holder).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Lock backend proxy applying a [`RetryPolicy`] to every call
pub struct RetryingLock<B> {
    backend: B,
    policy: RetryPolicy,
}

impl<B: LockBackend> RetryingLock<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn retry<T, F, Fut>(&self, operation: &str, name: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(ClusterError::RetriesExhausted {
                        operation: format!("{} {}", operation, name),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(
                        lock = name,
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Lock operation failed, retrying"
                    );
                    metrics::record_lock_retry(operation);
                    tokio::time::sleep(self.policy.backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl<B: LockBackend> LockBackend for RetryingLock<B> {
    async fn acquire(&self, name: &str, holder: &str, wait: Option<Duration>) -> Result<bool> {
        self.retry("acquire", name, || self.backend.acquire(name, holder, wait))
            .await
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        self.retry("release", name, || self.backend.release(name, holder))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Backend failing the first `failures` calls with a topology error
    struct FlakyBackend {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl LockBackend for FlakyBackend {
        async fn acquire(&self, _name: &str, _holder: &str, _wait: Option<Duration>) -> Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ClusterError::Topology(format!("rebalance in progress ({})", call)))
            } else {
                Ok(true)
            }
        }

        async fn release(&self, _name: &str, _holder: &str) -> Result<bool> {
            Err(ClusterError::InvalidInput("not retryable".into()))
        }
    }

    fn policy(attempts: u32, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    #[tokio::test]
    async fn test_exhausts_after_configured_attempts() {
        let lock = RetryingLock::new(FlakyBackend::new(u32::MAX), policy(10, 20));

        let start = Instant::now();
        let err = lock.acquire("k", "h", None).await.unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(lock.backend.calls.load(Ordering::SeqCst), 10);
        assert!(elapsed >= Duration::from_millis(9 * 20));
        match err {
            ClusterError::RetriesExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 10);
                assert!(source.to_string().contains("(10)"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let lock = RetryingLock::new(FlakyBackend::new(2), policy(10, 1));
        assert!(lock.acquire("k", "h", None).await.unwrap());
        assert_eq!(lock.backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_immediate() {
        let lock = RetryingLock::new(FlakyBackend::new(0), policy(10, 1_000));
        let err = lock.release("k", "h").await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }
}
