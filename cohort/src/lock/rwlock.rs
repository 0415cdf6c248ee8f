//! Read/write lock emulated on an exclusive lock and a reader counter
//!
//! Readers briefly take the exclusive lock `write.<name>`, bump the atomic
//! `read.<name>` and let go, so readers never exclude each other but do
//! serialize with writers. A writer takes `write.<name>` and proceeds only
//! once the counter reads zero; otherwise it lets go and parks on the
//! counter's change stream until the last reader leaves.
//!
//! Not fair and not fast. Meant for rare structural operations, never for
//! hot paths.

use super::{LockGuard, LockService};
use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::grid::Grid;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ReadWriteLock {
    locks: LockService,
    grid: Arc<dyn Grid>,
    name: String,
    write_key: String,
    read_key: String,
    poll: Duration,
}

impl ReadWriteLock {
    pub fn new(locks: LockService, grid: Arc<dyn Grid>, name: &str, poll: Duration) -> Self {
        Self {
            locks,
            grid,
            name: name.to_string(),
            write_key: format!("write.{}", name),
            read_key: format!("read.{}", name),
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current number of registered readers
    pub async fn readers(&self) -> Result<i64> {
        self.grid.atomic_get(&self.read_key).await
    }

    /// Register as a reader; blocks only while a writer holds the lock
    pub async fn lock_read(&self, ctx: &RequestContext) -> Result<ReadGuard> {
        let gate = self.locks.lock(ctx, &self.write_key).await?;
        let registered = self.grid.atomic_add(&self.read_key, 1).await;
        gate.unlock().await?;
        let readers = registered?;
        debug!(lock = %self.name, readers, "Read lock acquired");
        Ok(ReadGuard {
            grid: Some(Arc::clone(&self.grid)),
            read_key: self.read_key.clone(),
        })
    }

    /// Take the write lock once no reader is registered.
    ///
    /// With a `timeout`, fails with [`ClusterError::Timeout`] when the lock
    /// could not be obtained in time.
    pub async fn lock_write(
        &self,
        ctx: &RequestContext,
        timeout: Option<Duration>,
    ) -> Result<WriteGuard> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut readers = self.grid.atomic_watch(&self.read_key)?;

        loop {
            let guard = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.locks.try_lock(ctx, &self.write_key, remaining).await? {
                        Some(guard) => guard,
                        None => return Err(self.timed_out(timeout)),
                    }
                }
                None => self.locks.lock(ctx, &self.write_key).await?,
            };

            let active = match self.grid.atomic_get(&self.read_key).await {
                Ok(active) => active,
                Err(e) => {
                    guard.unlock().await?;
                    return Err(e);
                }
            };
            if active <= 0 {
                debug!(lock = %self.name, "Write lock acquired");
                return Ok(WriteGuard { guard });
            }
            guard.unlock().await?;

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(self.timed_out(timeout));
                    }
                    self.poll.min(remaining)
                }
                None => self.poll,
            };
            debug!(lock = %self.name, readers = active, "Writer parked until readers drain");
            // Timing out here only means re-checking under the lock
            let _ = tokio::time::timeout(wait, readers_drained(&mut readers)).await;
        }
    }

    fn timed_out(&self, timeout: Option<Duration>) -> ClusterError {
        ClusterError::Timeout(format!(
            "write lock {} not acquired within {:?}",
            self.name,
            timeout.unwrap_or_default()
        ))
    }
}

/// Resolve once the reader counter drops to zero
async fn readers_drained(readers: &mut watch::Receiver<i64>) -> Result<()> {
    loop {
        let drained = *readers.borrow_and_update() <= 0;
        if drained {
            return Ok(());
        }
        readers
            .changed()
            .await
            .map_err(|_| ClusterError::NodeStopping("reader counter closed".into()))?;
    }
}

/// Registered reader; release with [`ReadGuard::unlock`]
#[must_use = "the reader is deregistered as soon as the guard is dropped"]
pub struct ReadGuard {
    grid: Option<Arc<dyn Grid>>,
    read_key: String,
}

impl ReadGuard {
    pub async fn unlock(mut self) -> Result<()> {
        match self.grid.take() {
            Some(grid) => release_reader(grid.as_ref(), &self.read_key).await,
            None => Ok(()),
        }
    }
}

/// Decrement the reader counter, refusing to go below zero
async fn release_reader(grid: &dyn Grid, read_key: &str) -> Result<()> {
    loop {
        let current = grid.atomic_get(read_key).await?;
        if current <= 0 {
            return Err(ClusterError::LockNotHeld {
                name: read_key.to_string(),
                holder: "reader".to_string(),
            });
        }
        if grid
            .atomic_compare_and_set(read_key, current, current - 1)
            .await?
        {
            return Ok(());
        }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let Some(grid) = self.grid.take() else {
            return;
        };
        let read_key = std::mem::take(&mut self.read_key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_reader(grid.as_ref(), &read_key).await {
                        if !e.is_node_stopping() {
                            warn!(lock = %read_key, error = %e, "Background reader release failed");
                        }
                    }
                });
            }
            Err(_) => warn!(lock = %read_key, "Read guard dropped outside a runtime, reader leaked"),
        }
    }
}

/// Held write lock
#[derive(Debug)]
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    guard: LockGuard,
}

impl WriteGuard {
    pub async fn unlock(self) -> Result<()> {
        self.guard.unlock().await
    }
}
