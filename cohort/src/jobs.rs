//! Units of work that can run on any node
//!
//! A job is a serializable value with an async body. Every node registers
//! the job types it can execute; a request names the job and carries its
//! encoded value, and the receiving node looks the name up, decodes and
//! runs it.

use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::executor::LeveledExecutor;
use crate::node::NodeId;
use crate::rpc::AffinityDispatcher;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Serializable unit of work
#[async_trait]
pub trait ClusterJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registry key; unique across job types
    const NAME: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(self, ctx: JobContext) -> anyhow::Result<Self::Output>;
}

/// What a running job can see of its surroundings
///
/// Jobs started by a cluster node can hand further work to other nodes;
/// that work always runs one nesting level deeper than the job itself.
#[derive(Clone)]
pub struct JobContext {
    request: RequestContext,
    local_node: NodeId,
    executor: LeveledExecutor,
    registry: JobRegistry,
    dispatcher: Option<AffinityDispatcher>,
}

impl JobContext {
    pub(crate) fn new(
        request: RequestContext,
        local_node: NodeId,
        executor: LeveledExecutor,
        registry: JobRegistry,
        dispatcher: Option<AffinityDispatcher>,
    ) -> Self {
        Self {
            request,
            local_node,
            executor,
            registry,
            dispatcher,
        }
    }

    fn dispatcher(&self) -> Result<&AffinityDispatcher> {
        self.dispatcher.as_ref().ok_or_else(|| {
            ClusterError::NodeUnavailable("job is not running on a cluster node".into())
        })
    }

    /// Context this job runs under
    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    /// Context for work this job submits and waits on
    pub fn child(&self) -> RequestContext {
        self.request.child()
    }

    /// Node executing the job
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn level(&self) -> u32 {
        self.request.level()
    }

    /// Run `job` on this node one level deeper and wait for it
    pub async fn submit_local<J: ClusterJob>(&self, job: J) -> Result<J::Output> {
        let ctx = JobContext {
            request: self.child(),
            ..self.clone()
        };
        let node = self.local_node.clone();
        let level = ctx.level();
        self.executor
            .run(level, async move {
                job.run(ctx)
                    .await
                    .map_err(|e| ClusterError::Remote {
                        node: node.to_string(),
                        message: format!("{:#}", e),
                    })
            })
            .await
    }

    /// Run `job` on a node of the chosen group and wait for it
    pub async fn submit<J: ClusterJob>(
        &self,
        job: &J,
        use_scheduler_group: bool,
    ) -> Result<J::Output> {
        self.dispatcher()?
            .submit_job(&self.child(), job, use_scheduler_group)
            .await
    }

    /// Run `job` on `node` and wait for it
    pub async fn call_job<J: ClusterJob>(&self, node: &NodeId, job: &J) -> Result<J::Output> {
        self.dispatcher()?.call_job(&self.child(), node, job).await
    }

    /// Run `job` on the owner of `key` in `cache`
    pub async fn affinity_call<K, J>(&self, cache: &str, key: &K, job: &J) -> Result<J::Output>
    where
        K: Serialize + ?Sized,
        J: ClusterJob,
    {
        self.dispatcher()?
            .affinity_call(&self.child(), cache, key, job)
            .await
    }

    /// Run `job` once on every partition owner of `cache`
    pub async fn affinity_call_all<J: ClusterJob>(
        &self,
        cache: &str,
        job: &J,
    ) -> Result<Vec<J::Output>> {
        self.dispatcher()?
            .affinity_call_all(&self.child(), cache, job)
            .await
    }
}

type ErasedJob = Arc<dyn Fn(Bytes, JobContext) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Job types this node knows how to run
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<&'static str, ErasedJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: ClusterJob>(&self) {
        let erased: ErasedJob = Arc::new(|payload: Bytes, ctx: JobContext| {
            async move {
                let job: J = bincode::deserialize(&payload)?;
                let node = ctx.local_node().to_string();
                let output = job.run(ctx).await.map_err(|e| ClusterError::Remote {
                    node,
                    message: format!("{:#}", e),
                })?;
                Ok(Bytes::from(bincode::serialize(&output)?))
            }
            .boxed()
        });
        if self.jobs.write().insert(J::NAME, erased).is_some() {
            debug!(job = J::NAME, "Replaced job registration");
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.jobs.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.read().keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Decode and run a job by name on the calling task
    pub async fn execute(&self, name: &str, payload: Bytes, ctx: JobContext) -> Result<Bytes> {
        let job = self.jobs.read().get(name).cloned();
        match job {
            Some(job) => job(payload, ctx).await,
            None => Err(ClusterError::JobNotRegistered(name.to_string())),
        }
    }
}

/// Encode a job for the wire
pub(crate) fn encode_job<J: ClusterJob>(job: &J) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(job)?))
}

pub(crate) fn decode_output<J: ClusterJob>(raw: &[u8]) -> Result<J::Output> {
    Ok(bincode::deserialize(raw)?)
}
