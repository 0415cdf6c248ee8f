use super::{decode, decode_opt, encode, Storable};
use crate::error::Result;
use crate::grid::{CacheSettings, Grid};
use std::marker::PhantomData;
use std::sync::Arc;

/// Distributed map from a key to an ordered list of values.
///
/// Updates are read-modify-write on the whole list and are not atomic
/// across nodes: concurrent writers to one key can lose values. Callers
/// that need every value kept must hold a lock around the update.
pub struct DistributedMultiMap<K, V> {
    grid: Arc<dyn Grid>,
    name: String,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for DistributedMultiMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<K: Storable, V: Storable + PartialEq> DistributedMultiMap<K, V> {
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

    /// Values stored under `key`, in insertion order
    pub async fn get(&self, key: &K) -> Result<Vec<V>> {
        let raw = self.grid.cache_get(&self.name, &encode(key)?).await?;
        Ok(decode_opt(raw)?.unwrap_or_default())
    }

    /// Append `value` to the list under `key`
    pub async fn put(&self, key: K, value: V) -> Result<()> {
        let key = encode(&key)?;
        let mut values: Vec<V> = decode_opt(self.grid.cache_get(&self.name, &key).await?)?
            .unwrap_or_default();
        values.push(value);
        self.grid
            .cache_put(&self.name, key, encode(&values)?)
            .await?;
        Ok(())
    }

    /// Remove every value under `key`
    pub async fn remove(&self, key: &K) -> Result<Vec<V>> {
        let removed = self.grid.cache_remove(&self.name, &encode(key)?).await?;
        Ok(decode_opt(removed)?.unwrap_or_default())
    }

    /// Remove the first occurrence of `value`; the key goes away with its
    /// last value
    pub async fn remove_value(&self, key: &K, value: &V) -> Result<bool> {
        let key = encode(key)?;
        let Some(raw) = self.grid.cache_get(&self.name, &key).await? else {
            return Ok(false);
        };
        let mut values: Vec<V> = decode(&raw)?;
        let Some(position) = values.iter().position(|v| v == value) else {
            return Ok(false);
        };
        values.remove(position);

        if values.is_empty() {
            self.grid.cache_remove(&self.name, &key).await?;
        } else {
            self.grid
                .cache_put(&self.name, key, encode(&values)?)
                .await?;
        }
        Ok(true)
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.grid.cache_get(&self.name, &encode(key)?).await?.is_some())
    }

    pub async fn keys(&self) -> Result<Vec<K>> {
        self.grid
            .cache_entries(&self.name)
            .await?
            .into_iter()
            .map(|(k, _)| decode(&k))
            .collect()
    }

    /// Number of keys
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

    async fn open() -> DistributedMultiMap<String, String> {
        let fabric = LocalFabric::new();
        let grid = fabric
            .join(Node::new(NodeId::new("127.0.0.1", 1)))
            .unwrap();
        DistributedMultiMap::open(grid, "mm", CacheSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_values_keep_insertion_order() {
        let mm = open().await;
        mm.put("k".into(), "v1".into()).await.unwrap();
        mm.put("k".into(), "v2".into()).await.unwrap();
        mm.put("k".into(), "v1".into()).await.unwrap();
        assert_eq!(mm.get(&"k".into()).await.unwrap(), vec!["v1", "v2", "v1"]);
    }

    #[tokio::test]
    async fn test_last_value_removes_key() {
        let mm = open().await;
        mm.put("k".into(), "a".into()).await.unwrap();
        mm.put("k".into(), "b".into()).await.unwrap();

        assert!(mm.remove_value(&"k".into(), &"a".into()).await.unwrap());
        assert!(!mm.remove_value(&"k".into(), &"a".into()).await.unwrap());
        assert_eq!(mm.keys().await.unwrap(), vec!["k"]);

        assert!(mm.remove_value(&"k".into(), &"b".into()).await.unwrap());
        assert!(mm.keys().await.unwrap().is_empty());
        assert!(!mm.contains_key(&"k".into()).await.unwrap());
        assert!(mm.get(&"k".into()).await.unwrap().is_empty());
    }
}
