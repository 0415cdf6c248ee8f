use super::{decode_opt, encode, Storable};
use crate::error::Result;
use crate::grid::Grid;
use std::marker::PhantomData;
use std::sync::Arc;

/// Distributed FIFO queue backed by the grid's native queue
pub struct DistributedQueue<T> {
    grid: Arc<dyn Grid>,
    name: String,
    _types: PhantomData<fn() -> T>,
}

impl<T> Clone for DistributedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<T: Storable> DistributedQueue<T> {
    pub fn new(grid: Arc<dyn Grid>, name: &str) -> Self {
        Self {
            grid,
            name: name.to_string(),
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn offer(&self, value: &T) -> Result<()> {
        self.grid.queue_offer(&self.name, encode(value)?).await
    }

    /// Take the head of the queue, if any
    pub async fn poll(&self) -> Result<Option<T>> {
        decode_opt(self.grid.queue_poll(&self.name).await?)
    }

    pub async fn peek(&self) -> Result<Option<T>> {
        decode_opt(self.grid.queue_peek(&self.name).await?)
    }

    /// Take everything currently queued
    pub async fn drain(&self) -> Result<Vec<T>> {
        let mut drained = Vec::new();
        while let Some(value) = self.poll().await? {
            drained.push(value);
        }
        Ok(drained)
    }

    pub async fn len(&self) -> Result<usize> {
        self.grid.queue_len(&self.name).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<()> {
        self.grid.queue_clear(&self.name).await
    }
}
