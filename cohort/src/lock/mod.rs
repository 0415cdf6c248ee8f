//! Named distributed locks
//!
//! Exclusive, cluster-wide locks keyed by string. Ownership is the pair of
//! the local node and the caller's [`RequestContext`] holder, so the same
//! context may re-enter a lock it already holds while any other context,
//! local or remote, waits.
//!
//! Every grid call goes through [`RetryingLock`], which masks transient
//! topology errors. Successful acquisitions are recorded in a diagnostic
//! side table that a watchdog scans for locks held suspiciously long.

mod retry;
mod rwlock;

pub use retry::{GridLockBackend, LockBackend, RetryPolicy, RetryingLock};
pub use rwlock::{ReadGuard, ReadWriteLock, WriteGuard};

use crate::config::LockConfig;
use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::grid::Grid;
use crate::metrics;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Diagnostic record of a lock held by this node
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub name: String,
    pub holder: String,
    pub node: NodeId,
    pub acquired_at: DateTime<Utc>,
    pub holds: u32,
    pub backtrace: Arc<Backtrace>,
    started: Instant,
}

impl LockInfo {
    pub fn held_for(&self) -> Duration {
        self.started.elapsed()
    }
}

struct LockInner {
    backend: Arc<dyn LockBackend>,
    local: NodeId,
    held: Mutex<HashMap<String, LockInfo>>,
    config: LockConfig,
}

impl LockInner {
    fn holder(&self, ctx: &RequestContext) -> String {
        format!("{}/{}", self.local, ctx.holder())
    }

    fn record_acquired(&self, name: &str, holder: &str) {
        let mut held = self.held.lock();
        held.entry(name.to_string())
            .and_modify(|info| info.holds += 1)
            .or_insert_with(|| LockInfo {
                name: name.to_string(),
                holder: holder.to_string(),
                node: self.local.clone(),
                acquired_at: Utc::now(),
                holds: 1,
                backtrace: Arc::new(Backtrace::capture()),
                started: Instant::now(),
            });
        metrics::update_locks_held(held.len());
    }

    fn record_released(&self, name: &str) {
        let mut held = self.held.lock();
        if let Some(info) = held.get_mut(name) {
            info.holds = info.holds.saturating_sub(1);
            if info.holds == 0 {
                held.remove(name);
            }
        }
        metrics::update_locks_held(held.len());
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        if !self.backend.release(name, holder).await? {
            return Err(ClusterError::LockNotHeld {
                name: name.to_string(),
                holder: holder.to_string(),
            });
        }
        self.record_released(name);
        debug!(lock = name, holder, "Released lock");
        Ok(())
    }
}

/// Cluster-wide named locks
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockInner>,
    watchdog: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

impl LockService {
    pub fn new(grid: Arc<dyn Grid>, config: &LockConfig) -> Self {
        let policy = RetryPolicy {
            attempts: config.retry_attempts,
            backoff: config.retry_backoff(),
        };
        let local = grid.local_node().id;
        let backend = RetryingLock::new(GridLockBackend::new(grid), policy);
        Self::with_backend(Arc::new(backend), local, config)
    }

    /// Build on a custom backend
    pub fn with_backend(backend: Arc<dyn LockBackend>, local: NodeId, config: &LockConfig) -> Self {
        Self {
            inner: Arc::new(LockInner {
                backend,
                local,
                held: Mutex::new(HashMap::new()),
                config: config.clone(),
            }),
            watchdog: Arc::new(Mutex::new(None)),
        }
    }

    /// Block until `name` is acquired
    pub async fn lock(&self, ctx: &RequestContext, name: &str) -> Result<LockGuard> {
        let holder = self.inner.holder(ctx);
        let start = Instant::now();
        match self.inner.backend.acquire(name, &holder, None).await {
            Ok(true) => {
                metrics::record_lock_acquire("acquired", start.elapsed());
                Ok(self.acquired(name, holder))
            }
            // An unbounded wait only returns false if the grid gave up on us
            Ok(false) => {
                metrics::record_lock_acquire("error", start.elapsed());
                Err(ClusterError::Internal(format!(
                    "unbounded acquire of {} returned without the lock",
                    name
                )))
            }
            Err(e) => {
                metrics::record_lock_acquire("error", start.elapsed());
                Err(e)
            }
        }
    }

    /// Acquire `name` waiting at most `timeout`; `Ok(None)` when the wait expires
    pub async fn try_lock(
        &self,
        ctx: &RequestContext,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>> {
        let holder = self.inner.holder(ctx);
        let start = Instant::now();
        match self.inner.backend.acquire(name, &holder, Some(timeout)).await {
            Ok(true) => {
                metrics::record_lock_acquire("acquired", start.elapsed());
                Ok(Some(self.acquired(name, holder)))
            }
            Ok(false) => {
                metrics::record_lock_acquire("timeout", start.elapsed());
                debug!(lock = name, timeout_ms = timeout.as_millis() as u64, "Lock wait expired");
                Ok(None)
            }
            Err(e) => {
                metrics::record_lock_acquire("error", start.elapsed());
                Err(e)
            }
        }
    }

    /// Release a lock held by `ctx` whose guard was detached
    pub async fn unlock(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let holder = self.inner.holder(ctx);
        self.inner.release(name, &holder).await
    }

    fn acquired(&self, name: &str, holder: String) -> LockGuard {
        self.inner.record_acquired(name, &holder);
        debug!(lock = name, holder = %holder, "Acquired lock");
        LockGuard {
            inner: Some(Arc::clone(&self.inner)),
            name: name.to_string(),
            holder,
        }
    }

    /// Locks currently held through this service
    pub fn held_locks(&self) -> Vec<LockInfo> {
        self.inner.held.lock().values().cloned().collect()
    }

    /// Locks held longer than `threshold`
    pub fn long_held_locks(&self, threshold: Duration) -> Vec<LockInfo> {
        self.inner
            .held
            .lock()
            .values()
            .filter(|info| info.held_for() > threshold)
            .cloned()
            .collect()
    }

    /// Start the long-held lock watchdog; a second call is a no-op
    pub fn start_watchdog(&self) {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return;
        }

        let period = self.inner.config.watchdog_period().max(Duration::from_millis(1));
        let threshold = self.inner.config.long_held_threshold();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let service = self.clone();

        let handle = tokio::spawn(async move {
            info!(
                period_secs = period.as_secs(),
                threshold_secs = threshold.as_secs(),
                "Lock watchdog started"
            );
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => service.report_long_held(threshold),
                }
            }
            info!("Lock watchdog stopped");
        });
        *slot = Some((token, handle));
    }

    pub async fn stop_watchdog(&self) {
        let running = self.watchdog.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Lock watchdog task failed");
            }
        }
    }

    fn report_long_held(&self, threshold: Duration) {
        let long_held = self.long_held_locks(threshold);
        if long_held.is_empty() {
            return;
        }
        metrics::record_long_held_locks(long_held.len());
        for info in long_held {
            warn!(
                lock = %info.name,
                holder = %info.holder,
                node = %info.node,
                held_secs = info.held_for().as_secs(),
                holds = info.holds,
                backtrace = %info.backtrace,
                "Lock held longer than threshold"
            );
        }
    }
}

/// Held lock; release with [`LockGuard::unlock`].
///
/// Dropping a guard without unlocking releases the lock on a background
/// task, which only works inside a tokio runtime.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    inner: Option<Arc<LockInner>>,
    name: String,
    holder: String,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish()
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn unlock(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.release(&self.name, &self.holder).await,
            None => Ok(()),
        }
    }

    /// Keep the lock past the guard; release later with [`LockService::unlock`]
    pub fn detach(mut self) {
        self.inner = None;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.release(&name, &holder).await {
                        if !e.is_node_stopping() {
                            warn!(lock = %name, error = %e, "Background lock release failed");
                        }
                    }
                });
            }
            Err(_) => {
                warn!(lock = %name, holder = %holder, "Lock guard dropped outside a runtime, lock leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::LocalFabric;
    use crate::node::Node;
    use bytes::Bytes;

    fn test_config() -> LockConfig {
        LockConfig {
            retry_attempts: 2,
            retry_backoff_ms: 5,
            ..Default::default()
        }
    }

    fn join(fabric: &LocalFabric, port: u16) -> Arc<dyn Grid> {
        fabric
            .join(Node::new(NodeId::new("127.0.0.1", port)))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_across_nodes() {
        let fabric = LocalFabric::new();
        let grids: Vec<_> = (1..=3).map(|p| join(&fabric, p)).collect();
        let services: Vec<_> = grids
            .iter()
            .map(|g| LockService::new(Arc::clone(g), &test_config()))
            .collect();

        const N: usize = 30;
        let mut handles = Vec::new();
        for i in 0..N {
            let locks = services[i % services.len()].clone();
            let grid = Arc::clone(&grids[i % grids.len()]);
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new();
                let guard = locks.lock(&ctx, "counter").await.unwrap();
                let current = grid
                    .cache_get("shared", b"n")
                    .await
                    .unwrap()
                    .map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
                    .unwrap_or(0);
                tokio::task::yield_now().await;
                grid.cache_put(
                    "shared",
                    Bytes::from_static(b"n"),
                    Bytes::copy_from_slice(&(current + 1).to_le_bytes()),
                )
                .await
                .unwrap();
                guard.unlock().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let raw = grids[0].cache_get("shared", b"n").await.unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(raw[..8].try_into().unwrap()), N as u64);
        assert!(services.iter().all(|s| s.held_locks().is_empty()));
    }

    #[tokio::test]
    async fn test_try_lock_expires_with_none() {
        let fabric = LocalFabric::new();
        let locks = LockService::new(join(&fabric, 1), &test_config());
        let owner = RequestContext::new();
        let other = RequestContext::new();

        let guard = locks.lock(&owner, "k").await.unwrap();
        let attempt = locks
            .try_lock(&other, "k", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(attempt.is_none());

        guard.unlock().await.unwrap();
        let attempt = locks
            .try_lock(&other, "k", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(attempt.is_some());
        attempt.unwrap().unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_context_reenters() {
        let fabric = LocalFabric::new();
        let locks = LockService::new(join(&fabric, 1), &test_config());
        let ctx = RequestContext::new();

        let outer = locks.lock(&ctx, "k").await.unwrap();
        let inner = locks.lock(&ctx, "k").await.unwrap();
        assert_eq!(locks.held_locks()[0].holds, 2);

        inner.unlock().await.unwrap();
        assert_eq!(locks.held_locks().len(), 1);
        outer.unlock().await.unwrap();
        assert!(locks.held_locks().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_without_holding_fails() {
        let fabric = LocalFabric::new();
        let locks = LockService::new(join(&fabric, 1), &test_config());
        let err = locks
            .unlock(&RequestContext::new(), "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::LockNotHeld { .. }));
    }

    #[tokio::test]
    async fn test_detached_guard_released_by_name() {
        let fabric = LocalFabric::new();
        let locks = LockService::new(join(&fabric, 1), &test_config());
        let ctx = RequestContext::new();

        locks.lock(&ctx, "k").await.unwrap().detach();
        assert_eq!(locks.held_locks().len(), 1);
        locks.unlock(&ctx, "k").await.unwrap();
        assert!(locks.held_locks().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let fabric = LocalFabric::new();
        let locks = LockService::new(join(&fabric, 1), &test_config());

        drop(locks.lock(&RequestContext::new(), "k").await.unwrap());
        let next = locks
            .try_lock(&RequestContext::new(), "k", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_long_held_locks() {
        let fabric = LocalFabric::new();
        let locks = LockService::new(join(&fabric, 1), &test_config());
        let ctx = RequestContext::new();

        let guard = locks.lock(&ctx, "slow").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let long = locks.long_held_locks(Duration::from_millis(10));
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].name, "slow");
        assert!(long[0].holder.ends_with(&ctx.holder().to_string()));
        assert!(locks.long_held_locks(Duration::from_secs(60)).is_empty());
        guard.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_start_stop() {
        let fabric = LocalFabric::new();
        let config = LockConfig {
            watchdog_period_secs: 1,
            ..test_config()
        };
        let locks = LockService::new(join(&fabric, 1), &config);
        locks.start_watchdog();
        locks.start_watchdog();
        locks.stop_watchdog().await;
        locks.stop_watchdog().await;
    }
}
