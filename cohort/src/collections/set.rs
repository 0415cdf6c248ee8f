use super::{decode, encode, Storable};
use crate::error::Result;
use crate::grid::{CacheSettings, Grid};
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;

/// Distributed set; members are the keys of a cache
pub struct DistributedSet<T> {
    grid: Arc<dyn Grid>,
    name: String,
    _types: PhantomData<fn() -> T>,
}

impl<T> Clone for DistributedSet<T> {
    fn clone(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<T: Storable> DistributedSet<T> {
    pub async fn open(grid: Arc<dyn Grid>, name: &str, settings: CacheSettings) -> Result<Self> {
        grid.create_cache(name, settings).await?;
        Ok(Self {
            grid,
            name: name.to_string(),
            _types: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `value`; `false` if it was already a member
    pub async fn add(&self, value: &T) -> Result<bool> {
        let existing = self
            .grid
            .cache_put_if_absent(&self.name, encode(value)?, Bytes::new())
            .await?;
        Ok(existing.is_none())
    }

    /// Remove `value`; `false` if it was not a member
    pub async fn remove(&self, value: &T) -> Result<bool> {
        Ok(self
            .grid
            .cache_remove(&self.name, &encode(value)?)
            .await?
            .is_some())
    }

    pub async fn contains(&self, value: &T) -> Result<bool> {
        Ok(self
            .grid
            .cache_get(&self.name, &encode(value)?)
            .await?
            .is_some())
    }

    pub async fn members(&self) -> Result<Vec<T>> {
        self.grid
            .cache_entries(&self.name)
            .await?
            .into_iter()
            .map(|(k, _)| decode(&k))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::LocalFabric;
    use crate::node::{Node, NodeId};

    #[tokio::test]
    async fn test_set_semantics() {
        let fabric = LocalFabric::new();
        let grid = fabric
            .join(Node::new(NodeId::new("127.0.0.1", 1)))
            .unwrap();
        let set: DistributedSet<u64> = DistributedSet::open(grid, "s", CacheSettings::default())
            .await
            .unwrap();

        assert!(set.add(&1).await.unwrap());
        assert!(!set.add(&1).await.unwrap());
        assert!(set.add(&2).await.unwrap());
        assert_eq!(set.len().await.unwrap(), 2);
        assert!(set.contains(&2).await.unwrap());

        assert!(set.remove(&2).await.unwrap());
        assert!(!set.remove(&2).await.unwrap());
        assert_eq!(set.members().await.unwrap(), vec![1]);
    }
}
