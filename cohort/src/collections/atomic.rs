use super::{decode_opt, encode, Storable};
use crate::error::Result;
use crate::grid::{CacheSettings, Grid};
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;

/// Cache holding every [`AtomicReference`] value, keyed by reference name
pub const ATOMIC_REFERENCES_CACHE: &str = "cohort.atomic_references";

/// Cluster-wide 64-bit counter. Every operation is a single grid atomic,
/// no extra locking involved.
#[derive(Clone)]
pub struct AtomicLong {
    grid: Arc<dyn Grid>,
    name: String,
}

impl AtomicLong {
    pub fn new(grid: Arc<dyn Grid>, name: &str) -> Self {
        Self {
            grid,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<i64> {
        self.grid.atomic_get(&self.name).await
    }

    pub async fn set(&self, value: i64) -> Result<()> {
        self.grid.atomic_set(&self.name, value).await
    }

    pub async fn compare_and_set(&self, expected: i64, new: i64) -> Result<bool> {
        self.grid
            .atomic_compare_and_set(&self.name, expected, new)
            .await
    }

    /// Returns the incremented value
    pub async fn increment(&self) -> Result<i64> {
        self.add_and_get(1).await
    }

    /// Returns the decremented value
    pub async fn decrement(&self) -> Result<i64> {
        self.add_and_get(-1).await
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64> {
        self.grid.atomic_add(&self.name, delta).await
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64> {
        let updated = self.grid.atomic_add(&self.name, delta).await?;
        Ok(updated.wrapping_sub(delta))
    }
}

/// Cluster-wide reference to a value of `T`
pub struct AtomicReference<T> {
    grid: Arc<dyn Grid>,
    name: String,
    _types: PhantomData<fn() -> T>,
}

impl<T> Clone for AtomicReference<T> {
    fn clone(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<T: Storable> AtomicReference<T> {
    pub async fn open(grid: Arc<dyn Grid>, name: &str, settings: CacheSettings) -> Result<Self> {
        grid.create_cache(ATOMIC_REFERENCES_CACHE, settings).await?;
        Ok(Self {
            grid,
            name: name.to_string(),
            _types: PhantomData,
        })
    }

    fn key(&self) -> Bytes {
        Bytes::copy_from_slice(self.name.as_bytes())
    }

    pub async fn get(&self) -> Result<Option<T>> {
        decode_opt(
            self.grid
                .cache_get(ATOMIC_REFERENCES_CACHE, &self.key())
                .await?,
        )
    }

    pub async fn set(&self, value: &T) -> Result<()> {
        self.grid
            .cache_put(ATOMIC_REFERENCES_CACHE, self.key(), encode(value)?)
            .await?;
        Ok(())
    }

    /// Swap `expected` for `new` atomically; `None` stands for no value
    pub async fn compare_and_set(&self, expected: Option<&T>, new: Option<&T>) -> Result<bool> {
        let expected = expected.map(encode).transpose()?;
        let new = new.map(encode).transpose()?;
        self.grid
            .cache_compare_and_set(ATOMIC_REFERENCES_CACHE, self.key(), expected, new)
            .await
    }

    /// Store `value` and return the previous one.
    ///
    /// This is two grid round-trips, a read then a write, and is NOT
    /// atomic: another node may write in between and its value is lost.
    /// Use [`AtomicReference::compare_and_set`] when that matters.
    pub async fn get_and_set(&self, value: &T) -> Result<Option<T>> {
        let previous = self.get().await?;
        self.set(value).await?;
        Ok(previous)
    }
}
