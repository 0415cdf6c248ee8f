use super::{encode, DistributedMap, Storable};
use crate::error::Result;
use crate::grid::{Grid, TxOp};
use std::sync::Arc;
use tracing::debug;

/// Multi-map update applied all at once.
///
/// Mutations are buffered locally and handed to the grid's transaction
/// facility on [`Transaction::commit`]. Dropping an uncommitted transaction
/// discards it; nothing reaches the grid before commit.
pub struct Transaction {
    grid: Arc<dyn Grid>,
    ops: Vec<TxOp>,
}

impl Transaction {
    pub fn new(grid: Arc<dyn Grid>) -> Self {
        Self {
            grid,
            ops: Vec::new(),
        }
    }

    pub fn put<K: Storable, V: Storable>(
        &mut self,
        map: &DistributedMap<K, V>,
        key: &K,
        value: &V,
    ) -> Result<&mut Self> {
        self.ops.push(TxOp::Put {
            cache: map.name().to_string(),
            key: encode(key)?,
            value: encode(value)?,
        });
        Ok(self)
    }

    pub fn remove<K: Storable, V: Storable>(
        &mut self,
        map: &DistributedMap<K, V>,
        key: &K,
    ) -> Result<&mut Self> {
        self.ops.push(TxOp::Remove {
            cache: map.name().to_string(),
            key: encode(key)?,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let count = self.ops.len();
        self.grid.commit(self.ops).await?;
        debug!(operations = count, "Committed transaction");
        Ok(())
    }
}
