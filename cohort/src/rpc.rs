//! Affinity RPC
//!
//! Ships a unit of work to a specific node, usually the one owning the
//! partition of a given cache key, and correlates the reply back to the
//! caller. Requests and responses share one ordered topic; each frame names
//! its recipient and every other node ignores it.
//!
//! Requests execute on the leveled executor at the caller's nesting level,
//! never on the pump task, so a handler that itself makes a call cannot
//! block delivery of the reply it waits for. Callers wait at most the
//! configured request timeout; the pending entry is evicted on every exit
//! path, and fails early when the recipient leaves the cluster.

use crate::config::RpcConfig;
use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::executor::LeveledExecutor;
use crate::grid::{Grid, MembershipChange, TopicMessage};
use crate::jobs::{decode_output, encode_job, ClusterJob, JobContext, JobRegistry};
use crate::metrics::{self, RpcTimer};
use crate::node::NodeId;
use crate::service::ServiceTable;
use crate::tasks::TaskRouter;
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Topic carrying affinity calls, distinct from the message bus topic
pub const AFFINITY_TOPIC: &str = "cohort.affinity";

/// What a request asks the recipient to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Work {
    /// Run a registered job
    Job { name: String, payload: Vec<u8> },
    /// Call a singleton service hosted by the recipient
    Service { service_id: String, payload: Vec<u8> },
    /// Stop the recipient's instance of a singleton service
    StopService { service_id: String },
}

impl Work {
    fn kind(&self) -> &'static str {
        match self {
            Work::Job { .. } => "job",
            Work::Service { .. } => "service",
            Work::StopService { .. } => "stop_service",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityCallRequest {
    pub id: Uuid,
    pub sender: NodeId,
    pub recipient: NodeId,
    pub context: RequestContext,
    pub work: Work,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityCallResponse {
    pub id: Uuid,
    /// The node that sent the request
    pub recipient: NodeId,
    pub result: std::result::Result<Vec<u8>, ClusterError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcFrame {
    Request(AffinityCallRequest),
    Response(AffinityCallResponse),
}

/// Bound on waiting for outgoing replies when the dispatcher closes
const REPLY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A caller waiting on `node`
struct PendingCall {
    node: NodeId,
    tx: oneshot::Sender<Result<Bytes>>,
}

struct DispatcherInner {
    grid: Arc<dyn Grid>,
    local: NodeId,
    executor: LeveledExecutor,
    jobs: JobRegistry,
    services: ServiceTable,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
    router: OnceLock<TaskRouter>,
    config: RpcConfig,
    replies: TaskTracker,
    shutdown: CancellationToken,
}

impl DispatcherInner {
    async fn send(&self, frame: &RpcFrame) -> Result<()> {
        let bytes = Bytes::from(bincode::serialize(frame)?);
        self.grid.publish(AFFINITY_TOPIC, bytes).await
    }

    fn complete(&self, response: AffinityCallResponse) {
        let waiter = self.pending.lock().remove(&response.id);
        match waiter {
            Some(call) => {
                let result = response.result.map(Bytes::from);
                if call.tx.send(result).is_err() {
                    debug!(id = %response.id, "Caller gone before response arrived");
                }
            }
            None => warn!(id = %response.id, "Dropping response for unknown request"),
        }
    }

    /// Fail every caller still waiting on `node`
    fn fail_pending_for(&self, node: &NodeId) {
        let failed: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, call)| &call.node == node)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        if failed.is_empty() {
            return;
        }
        warn!(%node, requests = failed.len(), "Failing requests to departed node");
        for call in failed {
            let _ = call.tx.send(Err(ClusterError::NodeStopping(format!(
                "{} left the cluster",
                node
            ))));
        }
    }
}

async fn execute(
    inner: Arc<DispatcherInner>,
    context: RequestContext,
    work: Work,
) -> Result<Bytes> {
    match work {
        Work::Job { name, payload } => {
            let ctx = JobContext::new(
                context,
                inner.local.clone(),
                inner.executor.clone(),
                inner.jobs.clone(),
                Some(AffinityDispatcher {
                    inner: Arc::clone(&inner),
                }),
            );
            inner.jobs.execute(&name, Bytes::from(payload), ctx).await
        }
        Work::Service {
            service_id,
            payload,
        } => {
            inner
                .services
                .call(&service_id, Bytes::from(payload), context)
                .await
        }
        Work::StopService { service_id } => {
            let stopped = inner.services.stop(&service_id).await;
            Ok(Bytes::from(bincode::serialize(&stopped)?))
        }
    }
}

/// Sends work to nodes and correlates the replies
#[derive(Clone)]
pub struct AffinityDispatcher {
    inner: Arc<DispatcherInner>,
}

impl AffinityDispatcher {
    pub fn start(
        grid: Arc<dyn Grid>,
        executor: LeveledExecutor,
        jobs: JobRegistry,
        services: ServiceTable,
        config: &RpcConfig,
    ) -> Result<Self> {
        let rx = grid.subscribe(AFFINITY_TOPIC)?;
        let membership = grid.membership_events();
        let inner = Arc::new(DispatcherInner {
            local: grid.local_node().id,
            grid,
            executor,
            jobs,
            services,
            pending: Mutex::new(HashMap::new()),
            router: OnceLock::new(),
            config: config.clone(),
            replies: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(pump(Arc::clone(&inner), rx, membership));
        Ok(Self { inner })
    }

    /// Route `submit_job` calls with `router`; the first router set wins
    pub(crate) fn set_router(&self, router: TaskRouter) {
        if self.inner.router.set(router).is_err() {
            debug!(node = %self.inner.local, "Task router already set");
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    /// Requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Send `work` to `node` and wait for the result
    pub async fn call_node(&self, ctx: &RequestContext, node: &NodeId, work: Work) -> Result<Bytes> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClusterError::NodeStopping("dispatcher is closed".into()));
        }

        let kind = work.kind();
        let timer = RpcTimer::new(kind);
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingCall {
                node: node.clone(),
                tx,
            },
        );
        let _entry = PendingEntry {
            inner: Arc::clone(&self.inner),
            id,
        };
        metrics::update_rpc_pending(self.pending_requests());

        // Registered first, so a departure after this check still fails the call
        if !self.inner.grid.members().iter().any(|m| &m.id == node) {
            let e = ClusterError::NodeStopping(format!("{} is not a cluster member", node));
            timer.error(e.error_type());
            return Err(e);
        }

        let request = AffinityCallRequest {
            id,
            sender: self.inner.local.clone(),
            recipient: node.clone(),
            context: ctx.clone(),
            work,
        };
        trace!(%id, recipient = %node, kind, "Sending affinity request");
        if let Err(e) = self.inner.send(&RpcFrame::Request(request)).await {
            timer.error(e.error_type());
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout();
        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::NodeStopping(
                "dispatcher closed while waiting for a reply".into(),
            )),
            Err(_) => Err(ClusterError::Timeout(format!(
                "no reply from {} for request {} within {:?}",
                node, id, timeout
            ))),
        };
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.error(e.error_type()),
        }
        result
    }

    /// Run `job` on `node`
    pub async fn call_job<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        node: &NodeId,
        job: &J,
    ) -> Result<J::Output> {
        let work = Work::Job {
            name: J::NAME.to_string(),
            payload: encode_job(job)?.to_vec(),
        };
        let raw = self.call_node(ctx, node, work).await?;
        decode_output::<J>(&raw)
    }

    /// Run `job` on a node picked by the task router
    pub(crate) async fn submit_job<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        job: &J,
        use_scheduler_group: bool,
    ) -> Result<J::Output> {
        let router = self.inner.router.get().ok_or_else(|| {
            ClusterError::NodeUnavailable("no task router on this node".into())
        })?;
        let target = router.pick(use_scheduler_group)?;
        debug!(job = J::NAME, %target, scheduler = use_scheduler_group, "Submitting task");
        self.call_job(ctx, &target, job).await
    }

    /// Run `job` on the node owning `key` in `cache`
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
        let key = bincode::serialize(key)?;
        let owner = self.inner.grid.partition_owner(cache, &key)?;
        self.call_job(ctx, &owner, job).await
    }

    /// Run `job` once on every node owning a partition of `cache`
    pub async fn affinity_call_all<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        cache: &str,
        job: &J,
    ) -> Result<Vec<J::Output>> {
        let owners = self.inner.grid.partition_owners(cache);
        if owners.is_empty() {
            return Err(ClusterError::NodeUnavailable(format!(
                "no node owns partitions of {}",
                cache
            )));
        }
        let payload = encode_job(job)?.to_vec();
        let calls = owners.iter().map(|owner| {
            let work = Work::Job {
                name: J::NAME.to_string(),
                payload: payload.clone(),
            };
            async move {
                let raw = self.call_node(ctx, owner, work).await?;
                decode_output::<J>(&raw)
            }
        });
        try_join_all(calls).await
    }

    /// Stop serving requests, flush outgoing replies and fail every
    /// waiting caller
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.replies.close();
        if tokio::time::timeout(REPLY_DRAIN_TIMEOUT, self.inner.replies.wait())
            .await
            .is_err()
        {
            warn!(node = %self.inner.local, "Affinity replies still unsent after dispatcher shutdown");
        }

        let waiters: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, call) in waiters {
            let _ = call
                .tx
                .send(Err(ClusterError::NodeStopping("dispatcher closed".into())));
        }
        metrics::update_rpc_pending(0);
    }
}

/// Evicts a pending request however the caller stops waiting
struct PendingEntry {
    inner: Arc<DispatcherInner>,
    id: Uuid,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        let remaining = {
            let mut pending = self.inner.pending.lock();
            pending.remove(&self.id);
            pending.len()
        };
        metrics::update_rpc_pending(remaining);
    }
}

async fn pump(
    inner: Arc<DispatcherInner>,
    mut rx: mpsc::UnboundedReceiver<TopicMessage>,
    membership: broadcast::Receiver<MembershipChange>,
) {
    let mut membership = Some(membership);
    loop {
        // Frames before departures: a reply sent just before its node left
        // still completes the call
        let message = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            departed = next_departure(&mut membership) => {
                if let Some(node) = departed {
                    inner.fail_pending_for(&node);
                }
                continue;
            }
        };

        let frame: RpcFrame = match bincode::deserialize(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Dropping undecodable affinity frame");
                continue;
            }
        };

        match frame {
            RpcFrame::Request(request) if request.recipient == inner.local => {
                handle_request(&inner, request);
            }
            RpcFrame::Response(response) if response.recipient == inner.local => {
                inner.complete(response);
            }
            _ => {}
        }
    }
    debug!(node = %inner.local, "Affinity dispatcher pump stopped");
}

/// Next node to leave; pends forever once the event stream is gone
async fn next_departure(
    events: &mut Option<broadcast::Receiver<MembershipChange>>,
) -> Option<NodeId> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(MembershipChange::Left(node)) => return Some(node.id),
            Ok(MembershipChange::Joined(_)) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Dispatcher missed membership events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    *events = None;
    None
}

fn handle_request(inner: &Arc<DispatcherInner>, request: AffinityCallRequest) {
    let AffinityCallRequest {
        id,
        sender,
        context,
        work,
        ..
    } = request;
    trace!(%id, %sender, kind = work.kind(), level = context.level(), "Executing affinity request");

    let level = context.level();
    let spawned = inner
        .executor
        .spawn(level, execute(Arc::clone(inner), context, work));

    // The reply goes out from outside the executor, so work cut off by a
    // shutdown still answers its caller
    let responder = Arc::clone(inner);
    inner.replies.spawn(async move {
        let result = match spawned {
            Ok(handle) => match handle.await {
                Ok(Err(ClusterError::Cancelled(_))) if responder.executor.is_shutdown() => {
                    Err(stopping(&responder.local))
                }
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(stopping(&responder.local)),
                Err(e) => Err(ClusterError::Internal(format!(
                    "affinity request {} panicked: {}",
                    id, e
                ))),
            },
            Err(e) => Err(e),
        };
        respond(&responder, id, sender, result).await;
    });
}

fn stopping(node: &NodeId) -> ClusterError {
    ClusterError::NodeStopping(format!("{} stopped before finishing the request", node))
}

async fn respond(inner: &DispatcherInner, id: Uuid, recipient: NodeId, result: Result<Bytes>) {
    let response = AffinityCallResponse {
        id,
        recipient: recipient.clone(),
        result: result.map(|b| b.to_vec()),
    };
    if let Err(e) = inner.send(&RpcFrame::Response(response)).await {
        if !e.is_node_stopping() {
            warn!(%id, %recipient, error = %e, "Failed to send affinity response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::grid::LocalFabric;
    use crate::node::Node;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};

    #[derive(Serialize, Deserialize)]
    struct WhereAmI;

    #[async_trait]
    impl ClusterJob for WhereAmI {
        const NAME: &'static str = "test.where_am_i";
        type Output = String;

        async fn run(self, ctx: JobContext) -> anyhow::Result<String> {
            Ok(ctx.local_node().to_string())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Sleepy;

    #[async_trait]
    impl ClusterJob for Sleepy {
        const NAME: &'static str = "test.sleepy";
        type Output = ();

        async fn run(self, _ctx: JobContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    struct Peer {
        dispatcher: AffinityDispatcher,
        grid: Arc<dyn Grid>,
        executor: LeveledExecutor,
    }

    fn peer(fabric: &LocalFabric, port: u16, timeout_ms: u64) -> Peer {
        let grid: Arc<dyn Grid> = fabric
            .join(Node::new(NodeId::new("127.0.0.1", port)))
            .unwrap();
        let jobs = JobRegistry::new();
        jobs.register::<WhereAmI>();
        jobs.register::<Sleepy>();
        let executor = LeveledExecutor::new(&ExecutorConfig::default());
        let dispatcher = AffinityDispatcher::start(
            Arc::clone(&grid),
            executor.clone(),
            jobs,
            ServiceTable::default(),
            &RpcConfig {
                request_timeout_ms: timeout_ms,
            },
        )
        .unwrap();
        Peer {
            dispatcher,
            grid,
            executor,
        }
    }

    fn dispatcher(fabric: &LocalFabric, port: u16, timeout_ms: u64) -> AffinityDispatcher {
        peer(fabric, port, timeout_ms).dispatcher
    }

    #[tokio::test]
    async fn test_call_runs_on_target_node() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 5_000);
        let b = dispatcher(&fabric, 2, 5_000);

        let ctx = RequestContext::new();
        let ran_on = a.call_job(&ctx, b.local_node(), &WhereAmI).await.unwrap();
        assert_eq!(ran_on, b.local_node().to_string());
        assert_eq!(a.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_call_all_hits_each_owner_once() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 5_000);
        let _b = dispatcher(&fabric, 2, 5_000);
        let _c = dispatcher(&fabric, 3, 5_000);

        let mut nodes = a
            .affinity_call_all(&RequestContext::new(), "data", &WhereAmI)
            .await
            .unwrap();
        nodes.sort();
        assert_eq!(
            nodes,
            vec!["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"]
        );
    }

    #[tokio::test]
    async fn test_unregistered_job_is_reported() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 5_000);
        let work = Work::Job {
            name: "missing".into(),
            payload: Vec::new(),
        };
        let err = a
            .call_node(&RequestContext::new(), &NodeId::new("127.0.0.1", 1), work)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::JobNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_request_timeout_evicts_pending() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 50);
        let b = dispatcher(&fabric, 2, 50);

        let err = a
            .call_job(&RequestContext::new(), b.local_node(), &Sleepy)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(a.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_call_to_unknown_node_fails_fast() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 10_000);
        let started = Instant::now();
        let err = a
            .call_job(&RequestContext::new(), &NodeId::new("10.0.0.9", 1), &WhereAmI)
            .await
            .unwrap_err();
        assert!(err.is_node_stopping(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.pending_requests(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callee_shutdown_answers_waiting_caller() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 10_000);
        let b = peer(&fabric, 2, 10_000);
        let target = b.dispatcher.local_node().clone();

        let started = Instant::now();
        let call = tokio::spawn(async move {
            a.call_job(&RequestContext::new(), &target, &Sleepy).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Same order as a node closing: work cut off first, then replies flushed
        b.executor.shutdown().await;
        b.dispatcher.close().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_node_stopping(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_departure_fails_waiting_caller() {
        let fabric = LocalFabric::new();
        let a = dispatcher(&fabric, 1, 10_000);
        let b = peer(&fabric, 2, 10_000);
        let target = b.dispatcher.local_node().clone();

        let caller = a.clone();
        let started = Instant::now();
        let call = tokio::spawn(async move {
            caller.call_job(&RequestContext::new(), &target, &Sleepy).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.pending_requests(), 1);

        b.grid.close().await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_node_stopping(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.pending_requests(), 0);
    }
}
