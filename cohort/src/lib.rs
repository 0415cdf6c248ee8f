//! Cohort - distributed coordination for a fleet of server nodes
//!
//! Lets every node share state with and hand work to the others, on top of
//! a compute grid that provides membership, partitioned caches, atomics,
//! locks and ordered topics.
//!
//! # Architecture
//!
//! - **Grid**: the primitives consumed from the underlying grid; an
//!   in-process implementation backs tests and single-node setups
//! - **Registry**: membership views, master election, node properties
//! - **Locks**: named locks with bounded retry, a read/write lock built on
//!   top, and a watchdog for locks held too long
//! - **Collections**: map, multimap, set, queue, atomic long, atomic
//!   reference and multi-map transactions
//! - **Messaging**: broadcast and addressed messages with request/reply
//! - **RPC**: affinity calls that run a job on the node owning a key
//! - **Executor**: one bounded pool per nesting level so nested work cannot
//!   deadlock
//! - **Services**: cluster singletons, including a failover-safe scheduler
//! - **Transfer**: one-shot file links between nodes, optionally over TLS
//!
//! # Example
//!
//! ```no_run
//! use cohort::{Cluster, ClusterConfig, LocalFabric, RequestContext};
//!
//! # async fn run() -> cohort::Result<()> {
//! let fabric = LocalFabric::new();
//! let cluster = Cluster::start_local(&fabric, ClusterConfig::default()).await?;
//!
//! let ctx = RequestContext::new();
//! let guard = cluster.locks().lock(&ctx, "reports.rebuild").await?;
//! let views = cluster.map::<String, u64>("views").await?;
//! views.put("home".to_string(), 1).await?;
//! guard.unlock().await?;
//!
//! cluster.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod collections;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod grid;
pub mod jobs;
pub mod lock;
pub mod messaging;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod tasks;
pub mod transfer;

mod cluster;

pub use cluster::{Cluster, ClusterListener, MembershipEvent};
pub use collections::{
    AtomicLong, AtomicReference, DistributedMap, DistributedMultiMap, DistributedQueue,
    DistributedSet, Storable, Transaction,
};
pub use config::{
    AddressMapping, AddressResolverConfig, CacheMode, ClusterConfig, ClusterTlsConfig,
    DiscoveryConfig, ExecutorConfig, LockConfig, MessagingConfig, RpcConfig, TransferConfig,
};
pub use context::RequestContext;
pub use error::{ClusterError, Result};
pub use executor::LeveledExecutor;
pub use grid::{CacheSettings, Grid, LocalFabric, LocalGrid};
pub use jobs::{ClusterJob, JobContext, JobRegistry};
pub use lock::{LockGuard, LockInfo, LockService, ReadGuard, ReadWriteLock, WriteGuard};
pub use messaging::{ListenerId, MessageBus, MessageEvent, MessageListener};
pub use node::{AddressResolver, Node, NodeId};
pub use registry::{describe_local_node, NodeRegistry};
pub use rpc::AffinityDispatcher;
pub use service::{
    ScheduledCommand, ScheduledExecutor, ScheduledExecutorService, ServiceContext, ServiceManager,
    ServiceProxy, SingletonService,
};
pub use tasks::TaskManager;
pub use transfer::{FileTransferService, TransferLink};
