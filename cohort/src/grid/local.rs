//! In-process grid
//!
//! A [`LocalFabric`] is the shared "network": every [`LocalGrid`] joined to
//! it is one node. State lives in the fabric, so a value put through one
//! node is visible to the others, topics fan out to every subscribed node,
//! and a node leaving releases its locks and service registrations.

use super::{CacheSettings, Grid, MembershipChange, TopicMessage, TxOp};
use crate::error::{ClusterError, Result};
use crate::node::{Node, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, info};

/// Partitions per cache
pub const DEFAULT_PARTITIONS: u32 = 1024;

struct CacheState {
    settings: CacheSettings,
    entries: HashMap<Bytes, Bytes>,
}

impl CacheState {
    fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: HashMap::new(),
        }
    }
}

struct LockState {
    node: NodeId,
    holder: String,
    holds: u32,
}

struct Subscriber {
    node: NodeId,
    tx: mpsc::UnboundedSender<TopicMessage>,
}

#[derive(Default)]
struct FabricState {
    members: BTreeMap<NodeId, Node>,
    caches: HashMap<String, CacheState>,
    queues: HashMap<String, VecDeque<Bytes>>,
    atomics: HashMap<String, watch::Sender<i64>>,
    locks: HashMap<String, LockState>,
    topics: HashMap<String, Vec<Subscriber>>,
    services: HashMap<String, NodeId>,
}

impl FabricState {
    fn cache_mut(&mut self, name: &str) -> &mut CacheState {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| CacheState::new(CacheSettings::default()))
    }

    fn atomic(&mut self, name: &str) -> &watch::Sender<i64> {
        self.atomics
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(0).0)
    }

    fn server_members(&self) -> Vec<NodeId> {
        self.members
            .values()
            .filter(|n| !n.is_client())
            .map(|n| n.id.clone())
            .collect()
    }
}

struct FabricInner {
    partitions: u32,
    state: Mutex<FabricState>,
    lock_released: Notify,
    membership_tx: broadcast::Sender<MembershipChange>,
}

/// Shared in-process cluster fabric
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let (membership_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(FabricInner {
                partitions: partitions.max(1),
                state: Mutex::new(FabricState::default()),
                lock_released: Notify::new(),
                membership_tx,
            }),
        }
    }

    /// Join a node to the fabric
    pub fn join(&self, node: Node) -> Result<Arc<LocalGrid>> {
        {
            let mut state = self.inner.state.lock();
            if state.members.contains_key(&node.id) {
                return Err(ClusterError::Config(format!(
                    "node {} is already a member",
                    node.id
                )));
            }
            state.members.insert(node.id.clone(), node.clone());
        }

        info!(node = %node.id, "Node joined local fabric");
        let _ = self
            .inner
            .membership_tx
            .send(MembershipChange::Joined(node.clone()));

        Ok(Arc::new(LocalGrid {
            fabric: Arc::clone(&self.inner),
            node,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn member_count(&self) -> usize {
        self.inner.state.lock().members.len()
    }
}

/// One node's handle onto a [`LocalFabric`]
pub struct LocalGrid {
    fabric: Arc<FabricInner>,
    node: Node,
    closed: AtomicBool,
}

impl LocalGrid {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClusterError::NodeStopping(format!(
                "grid node {} is closed",
                self.node.id
            )))
        } else {
            Ok(())
        }
    }

    fn try_lock(&self, name: &str, holder: &str) -> bool {
        let mut state = self.fabric.state.lock();
        match state.locks.get_mut(name) {
            Some(lock) if lock.holder == holder => {
                lock.holds += 1;
                true
            }
            Some(_) => false,
            None => {
                state.locks.insert(
                    name.to_string(),
                    LockState {
                        node: self.node.id.clone(),
                        holder: holder.to_string(),
                        holds: 1,
                    },
                );
                true
            }
        }
    }
}

/// FNV-1a; stable across nodes, unlike the std hasher
fn partition_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl Grid for LocalGrid {
    fn local_node(&self) -> Node {
        self.node.clone()
    }

    fn members(&self) -> Vec<Node> {
        self.fabric.state.lock().members.values().cloned().collect()
    }

    fn membership_events(&self) -> broadcast::Receiver<MembershipChange> {
        self.fabric.membership_tx.subscribe()
    }

    fn partition_owner(&self, cache: &str, key: &[u8]) -> Result<NodeId> {
        let owners = self.fabric.state.lock().server_members();
        if owners.is_empty() {
            return Err(ClusterError::NodeUnavailable(format!(
                "no server node owns partitions of {}",
                cache
            )));
        }
        let partition = partition_hash(key) % u64::from(self.fabric.partitions);
        Ok(owners[(partition as usize) % owners.len()].clone())
    }

    fn partition_owners(&self, _cache: &str) -> Vec<NodeId> {
        let owners = self.fabric.state.lock().server_members();
        if owners.is_empty() {
            return owners;
        }
        let mut distinct: Vec<NodeId> = (0..self.fabric.partitions as usize)
            .map(|p| owners[p % owners.len()].clone())
            .collect();
        distinct.sort();
        distinct.dedup();
        distinct
    }

    async fn create_cache(&self, name: &str, settings: CacheSettings) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        state
            .caches
            .entry(name.to_string())
            .or_insert_with(|| CacheState::new(settings));
        Ok(())
    }

    async fn destroy_cache(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.fabric.state.lock().caches.remove(name).is_some() {
            debug!(cache = name, "Destroyed cache");
        }
        Ok(())
    }

    async fn cache_settings(&self, name: &str) -> Result<Option<CacheSettings>> {
        self.ensure_open()?;
        Ok(self.fabric.state.lock().caches.get(name).map(|c| c.settings))
    }

    async fn cache_get(&self, cache: &str, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let state = self.fabric.state.lock();
        Ok(state
            .caches
            .get(cache)
            .and_then(|c| c.entries.get(key).cloned()))
    }

    async fn cache_put(&self, cache: &str, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        Ok(state.cache_mut(cache).entries.insert(key, value))
    }

    async fn cache_put_if_absent(
        &self,
        cache: &str,
        key: Bytes,
        value: Bytes,
    ) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        let entries = &mut state.cache_mut(cache).entries;
        match entries.get(&key) {
            Some(existing) => Ok(Some(existing.clone())),
            None => {
                entries.insert(key, value);
                Ok(None)
            }
        }
    }

    async fn cache_remove(&self, cache: &str, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        Ok(state
            .caches
            .get_mut(cache)
            .and_then(|c| c.entries.remove(key)))
    }

    async fn cache_compare_and_set(
        &self,
        cache: &str,
        key: Bytes,
        expected: Option<Bytes>,
        new: Option<Bytes>,
    ) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        let entries = &mut state.cache_mut(cache).entries;
        if entries.get(&key) != expected.as_ref() {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key, value);
            }
            None => {
                entries.remove(&key);
            }
        }
        Ok(true)
    }

    async fn cache_entries(&self, cache: &str) -> Result<Vec<(Bytes, Bytes)>> {
        self.ensure_open()?;
        let state = self.fabric.state.lock();
        Ok(state
            .caches
            .get(cache)
            .map(|c| {
                c.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cache_len(&self, cache: &str) -> Result<usize> {
        self.ensure_open()?;
        let state = self.fabric.state.lock();
        Ok(state.caches.get(cache).map(|c| c.entries.len()).unwrap_or(0))
    }

    async fn cache_clear(&self, cache: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(c) = self.fabric.state.lock().caches.get_mut(cache) {
            c.entries.clear();
        }
        Ok(())
    }

    async fn commit(&self, ops: Vec<TxOp>) -> Result<()> {
        self.ensure_open()?;
        // Single critical section: readers see all of the writes or none
        let mut state = self.fabric.state.lock();
        for op in ops {
            match op {
                TxOp::Put { cache, key, value } => {
                    state.cache_mut(&cache).entries.insert(key, value);
                }
                TxOp::Remove { cache, key } => {
                    if let Some(c) = state.caches.get_mut(&cache) {
                        c.entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn queue_offer(&self, queue: &str, value: Bytes) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    async fn queue_poll(&self, queue: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        Ok(state.queues.get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn queue_peek(&self, queue: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let state = self.fabric.state.lock();
        Ok(state.queues.get(queue).and_then(|q| q.front().cloned()))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;
        let state = self.fabric.state.lock();
        Ok(state.queues.get(queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn queue_clear(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.fabric.state.lock().queues.remove(queue);
        Ok(())
    }

    async fn atomic_get(&self, name: &str) -> Result<i64> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        let value = *state.atomic(name).borrow();
        Ok(value)
    }

    async fn atomic_set(&self, name: &str, value: i64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        state.atomic(name).send_replace(value);
        Ok(())
    }

    async fn atomic_compare_and_set(&self, name: &str, expected: i64, new: i64) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        let atomic = state.atomic(name);
        if *atomic.borrow() != expected {
            return Ok(false);
        }
        atomic.send_replace(new);
        Ok(true)
    }

    async fn atomic_add(&self, name: &str, delta: i64) -> Result<i64> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        let atomic = state.atomic(name);
        let updated = atomic.borrow().wrapping_add(delta);
        atomic.send_replace(updated);
        Ok(updated)
    }

    fn atomic_watch(&self, name: &str) -> Result<watch::Receiver<i64>> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        Ok(state.atomic(name).subscribe())
    }

    async fn lock_acquire(
        &self,
        name: &str,
        holder: &str,
        wait: Option<Duration>,
    ) -> Result<bool> {
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);

        loop {
            self.ensure_open()?;

            // Register for wake-ups before checking, so a release between
            // the check and the await is not lost
            let notified = self.fabric.lock_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_lock(name, holder) {
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(false);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn lock_release(&self, name: &str, holder: &str) -> Result<bool> {
        self.ensure_open()?;
        let released = {
            let mut state = self.fabric.state.lock();
            match state.locks.get_mut(name) {
                Some(lock) if lock.holder == holder => {
                    lock.holds -= 1;
                    if lock.holds == 0 {
                        state.locks.remove(name);
                    }
                    true
                }
                _ => false,
            }
        };
        if released {
            self.fabric.lock_released.notify_waiters();
        }
        Ok(released)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            // Delivery happens under the fabric lock, which keeps every
            // sender's messages in order at every receiver
            subscribers.retain(|sub| {
                sub.tx
                    .send(TopicMessage {
                        sender: self.node.id.clone(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            });
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<TopicMessage>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.fabric.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                node: self.node.id.clone(),
                tx,
            });
        Ok(rx)
    }

    async fn service_deploy_if_absent(&self, service_id: &str, host: &NodeId) -> Result<NodeId> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        let current = state
            .services
            .entry(service_id.to_string())
            .or_insert_with(|| host.clone());
        Ok(current.clone())
    }

    async fn service_host(&self, service_id: &str) -> Result<Option<NodeId>> {
        self.ensure_open()?;
        Ok(self.fabric.state.lock().services.get(service_id).cloned())
    }

    async fn service_undeploy(&self, service_id: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.fabric.state.lock().services.remove(service_id).is_some())
    }

    async fn service_undeploy_if(&self, service_id: &str, expected: &NodeId) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.fabric.state.lock();
        if state.services.get(service_id) != Some(expected) {
            return Ok(false);
        }
        state.services.remove(service_id);
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let id = &self.node.id;
        {
            let mut state = self.fabric.state.lock();
            state.members.remove(id);
            state.locks.retain(|_, lock| &lock.node != id);
            state.services.retain(|_, host| *host != *id);
            for subscribers in state.topics.values_mut() {
                subscribers.retain(|sub| &sub.node != id);
            }
        }
        self.fabric.lock_released.notify_waiters();

        info!(node = %id, "Node left local fabric");
        let _ = self
            .fabric
            .membership_tx
            .send(MembershipChange::Left(self.node.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::node::ATTR_CLIENT;

    fn node(port: u16) -> Node {
        Node::new(NodeId::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_cache_shared_between_nodes() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        let b = fabric.join(node(2)).unwrap();

        a.cache_put("c", Bytes::from_static(b"k"), Bytes::from_static(b"v"))
            .await
            .unwrap();
        let v = b.cache_get("c", b"k").await.unwrap();
        assert_eq!(v, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        let key = Bytes::from_static(b"k");

        assert!(a
            .cache_compare_and_set("c", key.clone(), None, Some(Bytes::from_static(b"1")))
            .await
            .unwrap());
        assert!(!a
            .cache_compare_and_set("c", key.clone(), None, Some(Bytes::from_static(b"2")))
            .await
            .unwrap());
        assert!(a
            .cache_compare_and_set("c", key, Some(Bytes::from_static(b"1")), None)
            .await
            .unwrap());
        assert_eq!(a.cache_len("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_client_owns_no_partitions() {
        let fabric = LocalFabric::with_partitions(16);
        let _a = fabric.join(node(1)).unwrap();
        let _b = fabric.join(node(2)).unwrap();
        let c = fabric
            .join(node(3).with_attribute(ATTR_CLIENT, "true"))
            .unwrap();

        let owners = c.partition_owners("cache");
        assert_eq!(owners.len(), 2);
        assert!(!owners.contains(&c.local_node().id));
    }

    #[tokio::test]
    async fn test_lock_reentrant_and_released_on_leave() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        let b = fabric.join(node(2)).unwrap();

        assert!(a.lock_acquire("l", "a/1", None).await.unwrap());
        assert!(a.lock_acquire("l", "a/1", None).await.unwrap());
        assert!(!b
            .lock_acquire("l", "b/1", Some(Duration::from_millis(20)))
            .await
            .unwrap());

        a.close().await.unwrap();
        assert!(b
            .lock_acquire("l", "b/1", Some(Duration::from_millis(200)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_topic_order_per_sender() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        let b = fabric.join(node(2)).unwrap();
        let mut rx = b.subscribe("t").unwrap();

        for i in 0..100u8 {
            a.publish("t", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..100u8 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload[0], i);
            assert_eq!(msg.sender, a.local_node().id);
        }
    }

    #[tokio::test]
    async fn test_closed_grid_rejects_calls() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        a.close().await.unwrap();
        let err = a.cache_len("c").await.unwrap_err();
        assert!(err.is_node_stopping());
        assert_eq!(fabric.member_count(), 0);
    }

    #[tokio::test]
    async fn test_conditional_undeploy_keeps_newer_host() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        let b = fabric.join(node(2)).unwrap();
        let (old, new) = (a.local_node().id, b.local_node().id);

        a.service_deploy_if_absent("svc", &old).await.unwrap();
        // Someone else already replaced the stale claim
        a.service_undeploy("svc").await.unwrap();
        b.service_deploy_if_absent("svc", &new).await.unwrap();

        assert!(!a.service_undeploy_if("svc", &old).await.unwrap());
        assert_eq!(a.service_host("svc").await.unwrap(), Some(new.clone()));
        assert!(b.service_undeploy_if("svc", &new).await.unwrap());
        assert_eq!(a.service_host("svc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_keeps_creation_settings() {
        let fabric = LocalFabric::new();
        let a = fabric.join(node(1)).unwrap();
        let settings = CacheSettings {
            mode: CacheMode::Partitioned,
            backups: 1,
        };
        a.create_cache("c", settings).await.unwrap();
        // A second create does not overwrite
        a.create_cache("c", CacheSettings::default()).await.unwrap();
        assert_eq!(a.cache_settings("c").await.unwrap(), Some(settings));
        assert_eq!(a.cache_settings("missing").await.unwrap(), None);
    }
}
