use super::{decode, decode_opt, encode, Storable};
use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::grid::{CacheSettings, Grid};
use crate::lock::{LockGuard, LockService};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

type KeyLocks = Arc<Mutex<HashMap<(Uuid, Bytes), LockGuard>>>;

/// Distributed key/value map
pub struct DistributedMap<K, V> {
    grid: Arc<dyn Grid>,
    locks: LockService,
    name: String,
    key_locks: KeyLocks,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for DistributedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            locks: self.locks.clone(),
            name: self.name.clone(),
            key_locks: Arc::clone(&self.key_locks),
            _types: PhantomData,
        }
    }
}

impl<K: Storable, V: Storable> DistributedMap<K, V> {
    /// Open the map, creating its cache on first use
    pub async fn open(
        grid: Arc<dyn Grid>,
        locks: LockService,
        name: &str,
        settings: CacheSettings,
    ) -> Result<Self> {
        grid.create_cache(name, settings).await?;
        Ok(Self {
            grid,
            locks,
            name: name.to_string(),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            _types: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let raw = self.grid.cache_get(&self.name, &encode(key)?).await?;
        decode_opt(raw)
    }

    pub async fn get_or_default(&self, key: &K, default: V) -> Result<V> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.grid.cache_get(&self.name, &encode(key)?).await?.is_some())
    }

    /// Store `value`, returning the previous value
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let previous = self
            .grid
            .cache_put(&self.name, encode(&key)?, encode(&value)?)
            .await?;
        decode_opt(previous)
    }

    /// Store `value` unless the key is present; returns the existing value
    pub async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let existing = self
            .grid
            .cache_put_if_absent(&self.name, encode(&key)?, encode(&value)?)
            .await?;
        decode_opt(existing)
    }

    /// Overwrite only an existing entry; returns the replaced value
    pub async fn replace(&self, key: K, value: V) -> Result<Option<V>> {
        let key = encode(&key)?;
        let value = encode(&value)?;
        loop {
            let Some(current) = self.grid.cache_get(&self.name, &key).await? else {
                return Ok(None);
            };
            if self
                .grid
                .cache_compare_and_set(
                    &self.name,
                    key.clone(),
                    Some(current.clone()),
                    Some(value.clone()),
                )
                .await?
            {
                return Ok(Some(decode(&current)?));
            }
        }
    }

    /// Overwrite the entry only if it currently equals `expected`
    pub async fn replace_if(&self, key: K, expected: &V, value: V) -> Result<bool> {
        self.grid
            .cache_compare_and_set(
                &self.name,
                encode(&key)?,
                Some(encode(expected)?),
                Some(encode(&value)?),
            )
            .await
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        let removed = self.grid.cache_remove(&self.name, &encode(key)?).await?;
        decode_opt(removed)
    }

    /// Remove the entry only if it currently equals `expected`
    pub async fn remove_if(&self, key: &K, expected: &V) -> Result<bool> {
        self.grid
            .cache_compare_and_set(&self.name, encode(key)?, Some(encode(expected)?), None)
            .await
    }

    pub async fn keys(&self) -> Result<Vec<K>> {
        self.grid
            .cache_entries(&self.name)
            .await?
            .into_iter()
            .map(|(k, _)| decode(&k))
            .collect()
    }

    pub async fn values(&self) -> Result<Vec<V>> {
        self.grid
            .cache_entries(&self.name)
            .await?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    pub async fn entries(&self) -> Result<Vec<(K, V)>> {
        self.grid
            .cache_entries(&self.name)
            .await?
            .into_iter()
            .map(|(k, v)| Ok((decode(&k)?, decode(&v)?)))
            .collect()
    }

    pub async fn len(&self) -> Result<usize> {
        self.grid.cache_len(&self.name).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<()> {
        self.grid.cache_clear(&self.name).await
    }

    // ---- per-key locks ----

    fn key_lock_name(&self, key: &[u8]) -> String {
        format!("cohort.map.{}.{}", self.name, hex::encode(key))
    }

    /// Lock `key` for `ctx`. Release with [`DistributedMap::unlock`] using
    /// the same context; locking an already held key again is a no-op.
    pub async fn lock(&self, ctx: &RequestContext, key: &K) -> Result<()> {
        let key = encode(key)?;
        let held = self.key_locks.lock().contains_key(&(ctx.holder(), key.clone()));
        if held {
            return Ok(());
        }
        let guard = self.locks.lock(ctx, &self.key_lock_name(&key)).await?;
        self.key_locks.lock().insert((ctx.holder(), key), guard);
        Ok(())
    }

    /// Like [`DistributedMap::lock`], giving up after `timeout`
    pub async fn try_lock(&self, ctx: &RequestContext, key: &K, timeout: Duration) -> Result<bool> {
        let key = encode(key)?;
        let held = self.key_locks.lock().contains_key(&(ctx.holder(), key.clone()));
        if held {
            return Ok(true);
        }
        match self
            .locks
            .try_lock(ctx, &self.key_lock_name(&key), timeout)
            .await?
        {
            Some(guard) => {
                self.key_locks.lock().insert((ctx.holder(), key), guard);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn unlock(&self, ctx: &RequestContext, key: &K) -> Result<()> {
        let key = encode(key)?;
        let guard = self.key_locks.lock().remove(&(ctx.holder(), key.clone()));
        match guard {
            Some(guard) => guard.unlock().await,
            None => {
                debug!(map = %self.name, "Unlock of a key this context does not hold");
                Err(ClusterError::LockNotHeld {
                    name: self.key_lock_name(&key),
                    holder: ctx.holder().to_string(),
                })
            }
        }
    }
}
