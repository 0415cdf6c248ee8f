//! Leveled task execution
//!
//! Work that blocks on work it submitted can starve a fixed-size pool: if
//! every worker waits on a child that needs a worker, nothing moves. The
//! leveled executor gives each nesting level its own pool of permits, so a
//! task at level `n` only ever waits on tasks at level `n + 1`, which draw
//! from a different pool.

use crate::config::ExecutorConfig;
use crate::error::{ClusterError, Result};
use crate::metrics;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

struct ExecutorInner {
    pools: RwLock<Vec<Arc<Semaphore>>>,
    pool_size: usize,
    max_levels: usize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ExecutorInner {
    fn pool(&self, level: u32) -> Arc<Semaphore> {
        let index = (level as usize).min(self.max_levels - 1);
        if level as usize >= self.max_levels {
            warn!(
                level,
                max_levels = self.max_levels,
                "Task nesting deeper than the dedicated pools, sharing the last one"
            );
        }

        if let Some(pool) = self.pools.read().get(index) {
            return Arc::clone(pool);
        }

        let mut pools = self.pools.write();
        while pools.len() <= index {
            debug!(level = pools.len(), size = self.pool_size, "Created task pool");
            pools.push(Arc::new(Semaphore::new(self.pool_size)));
        }
        Arc::clone(&pools[index])
    }
}

/// One bounded pool per nesting level, created on first use
#[derive(Clone)]
pub struct LeveledExecutor {
    inner: Arc<ExecutorInner>,
}

impl LeveledExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                pools: RwLock::new(Vec::new()),
                pool_size: config.pool_size.max(1),
                max_levels: config.max_levels.max(1),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Pools created so far
    pub fn levels(&self) -> usize {
        self.inner.pools.read().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run `task` on the pool for `level` and hand back its join handle
    pub fn spawn<F, T>(&self, level: u32, task: F) -> Result<JoinHandle<Result<T>>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClusterError::NodeStopping("executor is shut down".into()));
        }

        let pool = self.inner.pool(level);
        let shutdown = self.inner.shutdown.clone();
        metrics::record_task_submitted(level);

        Ok(self.inner.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(ClusterError::NodeStopping("executor is shut down".into()));
                }
                permit = pool.acquire_owned() => permit
                    .map_err(|_| ClusterError::NodeStopping("task pool closed".into()))?,
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    Err(ClusterError::Cancelled("task cut off by executor shutdown".into()))
                }
                result = task => result,
            }
        }))
    }

    /// Run `task` on the pool for `level` and wait for its result
    pub async fn run<F, T>(&self, level: u32, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.spawn(level, task)?;
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ClusterError::Cancelled("task aborted".into())),
            Err(e) => Err(ClusterError::Internal(format!("task panicked: {}", e))),
        }
    }

    /// Cut off every running and queued task and refuse new ones
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        for pool in self.inner.pools.read().iter() {
            pool.close();
        }
        self.inner.tracker.wait().await;
        info!("Leveled executor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor(pool_size: usize) -> LeveledExecutor {
        LeveledExecutor::new(&ExecutorConfig {
            pool_size,
            max_levels: 16,
        })
    }

    /// Each level submits the next one and blocks on it
    fn nested(executor: LeveledExecutor, level: u32, depth: u32) -> BoxFuture<'static, Result<u32>> {
        async move {
            if level == depth {
                return Ok(level);
            }
            let child = executor.clone();
            executor
                .run(level + 1, nested(child, level + 1, depth))
                .await
        }
        .boxed()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nested_submission_does_not_deadlock() {
        let executor = executor(1);
        let depth = 5;
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            executor.run(0, nested(executor.clone(), 0, depth)),
        )
        .await
        .expect("nested tasks deadlocked")
        .unwrap();
        assert_eq!(result, depth);
        assert_eq!(executor.levels(), depth as usize + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let executor = executor(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                executor
                    .spawn(0, async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_off_work() {
        let executor = executor(1);
        let stuck = executor
            .spawn(0, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();
        tokio::task::yield_now().await;

        executor.shutdown().await;
        let err = stuck.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Cancelled(_) | ClusterError::NodeStopping(_)
        ));
        assert!(executor
            .spawn(0, async { Ok(()) })
            .unwrap_err()
            .is_node_stopping());
    }
}
