//! The compute-grid seam
//!
//! Everything in this crate is layered on a small set of grid primitives:
//! membership, partition ownership, distributed caches with compare-and-set,
//! native queues, atomic longs, exclusive locks, ordered topics, a
//! transaction facility and a service directory. Discovery, rebalancing and
//! replication are the grid's business.
//!
//! # Implementations
//!
//! - **Local**: [`LocalFabric`] hosts several in-process nodes that share
//!   one fabric. Used by tests and by single-node deployments.
//!
//! Another clustering backend plugs in by implementing [`Grid`].

mod local;

pub use local::{LocalFabric, LocalGrid, DEFAULT_PARTITIONS};

use crate::config::CacheMode;
use crate::error::Result;
use crate::node::{Node, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Creation settings for a distributed cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub mode: CacheMode,
    pub backups: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            mode: CacheMode::Replicated,
            backups: 2,
        }
    }
}

/// A message received from a topic
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub sender: NodeId,
    pub payload: Bytes,
}

/// Membership change emitted by the grid
#[derive(Debug, Clone)]
pub enum MembershipChange {
    Joined(Node),
    Left(Node),
}

impl MembershipChange {
    pub fn node(&self) -> &Node {
        match self {
            MembershipChange::Joined(node) | MembershipChange::Left(node) => node,
        }
    }
}

/// One mutation inside a grid transaction
#[derive(Debug, Clone)]
pub enum TxOp {
    Put {
        cache: String,
        key: Bytes,
        value: Bytes,
    },
    Remove {
        cache: String,
        key: Bytes,
    },
}

/// Primitives consumed from the underlying grid
#[async_trait]
pub trait Grid: Send + Sync + 'static {
    // ---- membership ----

    /// This process's node; stable for the process lifetime
    fn local_node(&self) -> Node;

    /// Current members, clients included, sorted by id
    fn members(&self) -> Vec<Node>;

    /// Subscribe to join/leave events
    fn membership_events(&self) -> broadcast::Receiver<MembershipChange>;

    // ---- affinity ----

    /// Node owning the primary copy of the partition holding `key`
    fn partition_owner(&self, cache: &str, key: &[u8]) -> Result<NodeId>;

    /// Distinct nodes owning at least one partition of `cache`
    fn partition_owners(&self, cache: &str) -> Vec<NodeId>;

    // ---- caches ----

    /// Create a cache if it does not exist yet
    async fn create_cache(&self, name: &str, settings: CacheSettings) -> Result<()>;

    async fn destroy_cache(&self, name: &str) -> Result<()>;

    /// Settings `name` was created with; `None` if it does not exist
    async fn cache_settings(&self, name: &str) -> Result<Option<CacheSettings>>;

    async fn cache_get(&self, cache: &str, key: &[u8]) -> Result<Option<Bytes>>;

    /// Store a value, returning the previous one
    async fn cache_put(&self, cache: &str, key: Bytes, value: Bytes) -> Result<Option<Bytes>>;

    /// Store only if absent, returning the existing value otherwise
    async fn cache_put_if_absent(
        &self,
        cache: &str,
        key: Bytes,
        value: Bytes,
    ) -> Result<Option<Bytes>>;

    async fn cache_remove(&self, cache: &str, key: &[u8]) -> Result<Option<Bytes>>;

    /// Swap `expected` for `new` atomically; `None` means absent on either side
    async fn cache_compare_and_set(
        &self,
        cache: &str,
        key: Bytes,
        expected: Option<Bytes>,
        new: Option<Bytes>,
    ) -> Result<bool>;

    async fn cache_entries(&self, cache: &str) -> Result<Vec<(Bytes, Bytes)>>;

    async fn cache_len(&self, cache: &str) -> Result<usize>;

    async fn cache_clear(&self, cache: &str) -> Result<()>;

    /// Apply every operation or none
    async fn commit(&self, ops: Vec<TxOp>) -> Result<()>;

    // ---- queues ----

    async fn queue_offer(&self, queue: &str, value: Bytes) -> Result<()>;

    async fn queue_poll(&self, queue: &str) -> Result<Option<Bytes>>;

    async fn queue_peek(&self, queue: &str) -> Result<Option<Bytes>>;

    async fn queue_len(&self, queue: &str) -> Result<usize>;

    async fn queue_clear(&self, queue: &str) -> Result<()>;

    // ---- atomics ----

    async fn atomic_get(&self, name: &str) -> Result<i64>;

    async fn atomic_set(&self, name: &str, value: i64) -> Result<()>;

    async fn atomic_compare_and_set(&self, name: &str, expected: i64, new: i64) -> Result<bool>;

    /// Add `delta` and return the new value
    async fn atomic_add(&self, name: &str, delta: i64) -> Result<i64>;

    /// Stream of value changes for an atomic long
    fn atomic_watch(&self, name: &str) -> Result<watch::Receiver<i64>>;

    // ---- locks ----

    /// Acquire an exclusive, reentrant lock for `holder`.
    ///
    /// `wait = None` blocks until acquired. Returns `false` when the wait
    /// expires.
    async fn lock_acquire(&self, name: &str, holder: &str, wait: Option<Duration>)
        -> Result<bool>;

    /// Release one hold; returns `false` if `holder` did not own the lock
    async fn lock_release(&self, name: &str, holder: &str) -> Result<bool>;

    // ---- topics ----

    /// Ordered publish: messages from one sender arrive in send order
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<TopicMessage>>;

    // ---- service directory ----

    /// Register `host` for `service_id` unless another node already is;
    /// returns the node that hosts it afterwards
    async fn service_deploy_if_absent(&self, service_id: &str, host: &NodeId) -> Result<NodeId>;

    async fn service_host(&self, service_id: &str) -> Result<Option<NodeId>>;

    async fn service_undeploy(&self, service_id: &str) -> Result<bool>;

    /// Remove the entry only while `expected` still hosts it
    async fn service_undeploy_if(&self, service_id: &str, expected: &NodeId) -> Result<bool>;

    // ---- lifecycle ----

    /// Leave the cluster; further calls fail with `NodeStopping`
    async fn close(&self) -> Result<()>;
}
