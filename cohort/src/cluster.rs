//! Cluster facade
//!
//! One [`Cluster`] per process ties the subsystems to a grid node:
//!
//! ```text
//!   Cluster
//!    ├── NodeRegistry          membership, master, node properties
//!    ├── LockService           named locks + long-held watchdog
//!    ├── MessageBus            cohort.messages
//!    ├── AffinityDispatcher    cohort.affinity, runs work on LeveledExecutor
//!    ├── ServiceManager        singleton services
//!    ├── TaskManager           submit / submit_all
//!    └── FileTransferService   one-shot file links
//! ```
//!
//! Each membership listener gets its own task and sees events in the order
//! the grid reported them, never on the grid's event stream. Shutdown
//! notifies listeners first, then tears the subsystems down while the grid
//! can still carry their last messages, and closes the grid last. A start
//! that fails part way unwinds the same way, so no half-started node stays
//! a member.

use crate::collections::{
    AtomicLong, AtomicReference, DistributedMap, DistributedMultiMap, DistributedQueue,
    DistributedSet, Storable, Transaction,
};
use crate::config::ClusterConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::executor::LeveledExecutor;
use crate::grid::{CacheSettings, Grid, LocalFabric, MembershipChange};
use crate::jobs::{ClusterJob, JobRegistry};
use crate::lock::{LockService, ReadWriteLock};
use crate::messaging::MessageBus;
use crate::metrics;
use crate::node::{AddressResolver, Node, NodeId};
use crate::registry::{describe_local_node, NodeRegistry};
use crate::rpc::AffinityDispatcher;
use crate::service::{ScheduledExecutor, ServiceManager, ServiceTable};
use crate::tasks::TaskManager;
use crate::transfer::FileTransferService;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on each listener's shutdown callback
const SHUTDOWN_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// A member joined or left
#[derive(Clone)]
pub struct MembershipEvent {
    pub cluster: Cluster,
    pub node: Node,
}

/// Membership and lifecycle callbacks
#[async_trait]
pub trait ClusterListener: Send + Sync + 'static {
    async fn on_member_joined(&self, _event: MembershipEvent) {}

    async fn on_member_left(&self, _event: MembershipEvent) {}

    /// Called once from `Cluster::close`, before anything is torn down
    async fn on_shutdown(&self, _cluster: Cluster) {}
}

enum ListenerEvent {
    Joined(MembershipEvent),
    Left(MembershipEvent),
}

/// A listener and the queue feeding it
struct ListenerSlot {
    listener: Arc<dyn ClusterListener>,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

/// Subsystems already running while `Cluster::start` is in progress
struct PartialStart {
    grid: Arc<dyn Grid>,
    locks: Option<LockService>,
    bus: Option<MessageBus>,
    executor: Option<LeveledExecutor>,
    dispatcher: Option<AffinityDispatcher>,
}

impl PartialStart {
    fn new(grid: Arc<dyn Grid>) -> Self {
        Self {
            grid,
            locks: None,
            bus: None,
            executor: None,
            dispatcher: None,
        }
    }

    /// Stop whatever came up and leave the grid
    async fn unwind(self) {
        if let Some(locks) = self.locks {
            locks.stop_watchdog().await;
        }
        if let Some(executor) = self.executor {
            executor.shutdown().await;
        }
        if let Some(bus) = self.bus {
            bus.close().await;
        }
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.close().await;
        }
        if let Err(e) = self.grid.close().await {
            warn!(error = %e, "Failed to leave the grid after a failed start");
        }
    }
}

struct ClusterInner {
    config: ClusterConfig,
    grid: Arc<dyn Grid>,
    cache_settings: CacheSettings,
    registry: Arc<NodeRegistry>,
    locks: LockService,
    bus: MessageBus,
    executor: LeveledExecutor,
    jobs: JobRegistry,
    dispatcher: AffinityDispatcher,
    services: ServiceManager,
    tasks: TaskManager,
    transfers: FileTransferService,
    listeners: RwLock<Vec<ListenerSlot>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// This process's membership in the cluster
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Bring up every subsystem on top of an already joined grid node
    ///
    /// On failure everything started so far is stopped and the grid node
    /// is closed before the error is returned.
    pub async fn start(config: ClusterConfig, grid: Arc<dyn Grid>) -> Result<Self> {
        let mut started = PartialStart::new(Arc::clone(&grid));
        match Self::bring_up(config, grid, &mut started).await {
            Ok(cluster) => Ok(cluster),
            Err(e) => {
                warn!(node = %started.grid.local_node().id, error = %e, "Cluster node failed to start");
                started.unwind().await;
                Err(e)
            }
        }
    }

    async fn bring_up(
        config: ClusterConfig,
        grid: Arc<dyn Grid>,
        started: &mut PartialStart,
    ) -> Result<Self> {
        config.validate()?;
        let cache_settings = CacheSettings {
            mode: config.cache_mode(),
            backups: config.backups(),
        };

        let registry = Arc::new(NodeRegistry::new(Arc::clone(&grid), cache_settings).await?);
        let locks = LockService::new(Arc::clone(&grid), &config.lock);
        locks.start_watchdog();
        started.locks = Some(locks.clone());

        let bus = MessageBus::start(Arc::clone(&grid), &config.messaging)?;
        started.bus = Some(bus.clone());
        let executor = LeveledExecutor::new(&config.executor);
        started.executor = Some(executor.clone());
        let jobs = JobRegistry::new();
        let table = ServiceTable::default();
        let dispatcher = AffinityDispatcher::start(
            Arc::clone(&grid),
            executor.clone(),
            jobs.clone(),
            table.clone(),
            &config.rpc,
        )?;
        started.dispatcher = Some(dispatcher.clone());
        let services = ServiceManager::new(
            Arc::clone(&grid),
            Arc::clone(&registry),
            dispatcher.clone(),
            table,
            executor.clone(),
            cache_settings,
        );
        let tasks = TaskManager::new(
            &grid,
            Arc::clone(&registry),
            dispatcher.clone(),
            config.cloud_runner,
            cache_settings,
        )
        .await?;

        let resolver = AddressResolver::new(&config.address_resolver);
        let transfers =
            FileTransferService::start(&config.transfer, &config.tls, &resolver, &config.bind_host)
                .await?;

        let events = grid.membership_events();
        let inner = Arc::new(ClusterInner {
            config,
            grid,
            cache_settings,
            registry,
            locks,
            bus,
            executor,
            jobs,
            dispatcher,
            services,
            tasks,
            transfers,
            listeners: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(membership_pump(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));

        metrics::update_member_count(inner.grid.members().len());
        info!(
            node = %inner.registry.local_id(),
            name = %inner.config.node_name,
            members = inner.grid.members().len(),
            mode = ?cache_settings.mode,
            backups = cache_settings.backups,
            "Cluster node started"
        );
        Ok(Self { inner })
    }

    /// Join `fabric` as the node `config` describes and start on it
    pub async fn start_local(fabric: &LocalFabric, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let grid = fabric.join(describe_local_node(&config))?;
        Self::start(config, grid).await
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn grid(&self) -> &Arc<dyn Grid> {
        &self.inner.grid
    }

    pub fn local_id(&self) -> &NodeId {
        self.inner.registry.local_id()
    }

    pub fn cache_settings(&self) -> CacheSettings {
        self.inner.cache_settings
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn locks(&self) -> &LockService {
        &self.inner.locks
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn executor(&self) -> &LeveledExecutor {
        &self.inner.executor
    }

    pub fn dispatcher(&self) -> &AffinityDispatcher {
        &self.inner.dispatcher
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    pub fn services(&self) -> &ServiceManager {
        &self.inner.services
    }

    pub fn transfers(&self) -> &FileTransferService {
        &self.inner.transfers
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ---- collections ----

    pub async fn map<K: Storable, V: Storable>(&self, name: &str) -> Result<DistributedMap<K, V>> {
        DistributedMap::open(
            Arc::clone(&self.inner.grid),
            self.inner.locks.clone(),
            name,
            self.inner.cache_settings,
        )
        .await
    }

    pub async fn multimap<K: Storable, V: Storable + PartialEq>(
        &self,
        name: &str,
    ) -> Result<DistributedMultiMap<K, V>> {
        DistributedMultiMap::open(Arc::clone(&self.inner.grid), name, self.inner.cache_settings)
            .await
    }

    pub async fn set<T: Storable>(&self, name: &str) -> Result<DistributedSet<T>> {
        DistributedSet::open(Arc::clone(&self.inner.grid), name, self.inner.cache_settings).await
    }

    pub fn queue<T: Storable>(&self, name: &str) -> DistributedQueue<T> {
        DistributedQueue::new(Arc::clone(&self.inner.grid), name)
    }

    pub fn atomic_long(&self, name: &str) -> AtomicLong {
        AtomicLong::new(Arc::clone(&self.inner.grid), name)
    }

    pub async fn atomic_reference<T: Storable>(&self, name: &str) -> Result<AtomicReference<T>> {
        AtomicReference::open(Arc::clone(&self.inner.grid), name, self.inner.cache_settings).await
    }

    pub fn read_write_lock(&self, name: &str) -> ReadWriteLock {
        ReadWriteLock::new(
            self.inner.locks.clone(),
            Arc::clone(&self.inner.grid),
            name,
            self.inner.config.lock.write_lock_poll(),
        )
    }

    /// Begin a transaction spanning any number of maps
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.inner.grid))
    }

    // ---- work ----

    /// Make `J` runnable on this node; every node must register the jobs
    /// it may be asked to execute
    pub fn register_job<J: ClusterJob>(&self) {
        self.inner.jobs.register::<J>();
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    pub async fn affinity_call<K, J>(
        &self,
        ctx: &RequestContext,
        cache: &str,
        key: &K,
        job: &J,
    ) -> Result<J::Output>
    where
        K: Serialize + ?Sized,
        J: ClusterJob,
    {
        self.inner.dispatcher.affinity_call(ctx, cache, key, job).await
    }

    pub async fn affinity_call_all<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        cache: &str,
        job: &J,
    ) -> Result<Vec<J::Output>> {
        self.inner.dispatcher.affinity_call_all(ctx, cache, job).await
    }

    /// Client for the scheduled executor singleton under `prefix`
    pub async fn scheduled_executor(&self, prefix: &str) -> Result<ScheduledExecutor> {
        ScheduledExecutor::connect(&self.inner.services, prefix).await
    }

    // ---- lifecycle ----

    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(
            Arc::clone(&listener),
            rx,
            self.inner.shutdown.clone(),
        ));
        self.inner.listeners.write().push(ListenerSlot {
            listener,
            events: tx,
        });
    }

    fn listeners(&self) -> Vec<Arc<dyn ClusterListener>> {
        self.inner
            .listeners
            .read()
            .iter()
            .map(|slot| Arc::clone(&slot.listener))
            .collect()
    }

    /// Leave the cluster
    ///
    /// Listeners hear about the shutdown first. Subsystems go next, in an
    /// order that lets each still reach other nodes while it cleans up,
    /// and the grid node closes last.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let node = self.local_id().clone();
        info!(%node, "Cluster node shutting down");

        for listener in self.listeners() {
            if tokio::time::timeout(SHUTDOWN_NOTIFY_TIMEOUT, listener.on_shutdown(self.clone()))
                .await
                .is_err()
            {
                warn!(%node, "Shutdown listener timed out");
            }
        }
        self.inner.shutdown.cancel();

        self.inner.locks.stop_watchdog().await;
        self.inner.transfers.close().await;
        self.inner.services.close().await;
        self.inner.executor.shutdown().await;
        self.inner.bus.close().await;
        self.inner.dispatcher.close().await;

        self.inner.grid.close().await?;
        info!(%node, "Cluster node stopped");
        Ok(())
    }
}

async fn membership_pump(
    cluster: Weak<ClusterInner>,
    mut events: broadcast::Receiver<MembershipChange>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => break,
            change = events.recv() => match change {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Membership pump lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let Some(inner) = cluster.upgrade() else { break };
        let cluster_handle = Cluster { inner };
        metrics::update_member_count(cluster_handle.inner.grid.members().len());

        let joined = matches!(change, MembershipChange::Joined(_));
        let node = change.node().clone();
        if joined {
            info!(node = %node.id, "Member joined");
        } else {
            warn!(node = %node.id, "Member left");
        }

        for slot in cluster_handle.inner.listeners.read().iter() {
            let event = MembershipEvent {
                cluster: cluster_handle.clone(),
                node: node.clone(),
            };
            let event = if joined {
                ListenerEvent::Joined(event)
            } else {
                ListenerEvent::Left(event)
            };
            if slot.events.send(event).is_err() {
                debug!(node = %node.id, "Listener queue closed");
            }
        }
    }
    debug!("Membership pump stopped");
}

/// Feed one listener its events in order, one callback at a time
async fn deliver(
    listener: Arc<dyn ClusterListener>,
    mut events: mpsc::UnboundedReceiver<ListenerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            ListenerEvent::Joined(event) => listener.on_member_joined(event).await,
            ListenerEvent::Left(event) => listener.on_member_left(event).await,
        }
    }
}
