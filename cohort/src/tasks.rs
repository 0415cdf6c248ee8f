//! Cluster task submission
//!
//! Picks a node for a job and runs it there through the affinity
//! dispatcher. Targets rotate round-robin over the eligible group.

use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::grid::{CacheSettings, Grid};
use crate::jobs::ClusterJob;
use crate::node::{Node, NodeId};
use crate::registry::NodeRegistry;
use crate::rpc::AffinityDispatcher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cache whose partition owners receive `submit_all` work
pub const TASKS_CACHE: &str = "cohort.tasks";

/// Round-robin target selection, shared by the task manager and by jobs
/// submitting further jobs through the dispatcher
#[derive(Clone)]
pub(crate) struct TaskRouter {
    registry: Arc<NodeRegistry>,
    cloud_runner: bool,
    next: Arc<AtomicUsize>,
}

impl TaskRouter {
    pub(crate) fn new(registry: Arc<NodeRegistry>, cloud_runner: bool) -> Self {
        Self {
            registry,
            cloud_runner,
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// In cloud-runner mode there are no dedicated schedulers, so every
    /// non-client member qualifies for either group.
    pub(crate) fn candidates(&self, use_scheduler_group: bool) -> Vec<Node> {
        if self.cloud_runner {
            self.registry.members(false)
        } else if use_scheduler_group {
            self.registry.scheduler_nodes()
        } else {
            self.registry.server_nodes()
        }
    }

    pub(crate) fn pick(&self, use_scheduler_group: bool) -> Result<NodeId> {
        let candidates = self.candidates(use_scheduler_group);
        if candidates.is_empty() {
            let group = if use_scheduler_group { "scheduler" } else { "server" };
            return Err(ClusterError::NodeUnavailable(format!(
                "no {} node available for task submission",
                group
            )));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].id.clone())
    }
}

pub struct TaskManager {
    router: TaskRouter,
    dispatcher: AffinityDispatcher,
}

impl TaskManager {
    pub async fn new(
        grid: &Arc<dyn Grid>,
        registry: Arc<NodeRegistry>,
        dispatcher: AffinityDispatcher,
        cloud_runner: bool,
        settings: CacheSettings,
    ) -> Result<Self> {
        grid.create_cache(TASKS_CACHE, settings).await?;
        let router = TaskRouter::new(registry, cloud_runner);
        dispatcher.set_router(router.clone());
        Ok(Self { router, dispatcher })
    }

    /// Nodes eligible for a submission
    pub fn candidates(&self, use_scheduler_group: bool) -> Vec<Node> {
        self.router.candidates(use_scheduler_group)
    }

    /// Run `job` on one node of the chosen group and wait for its output
    ///
    /// The job runs one nesting level below `ctx`.
    pub async fn submit<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        job: &J,
        use_scheduler_group: bool,
    ) -> Result<J::Output> {
        let target = self.router.pick(use_scheduler_group)?;
        debug!(job = J::NAME, %target, scheduler = use_scheduler_group, "Submitting task");
        self.dispatcher.call_job(&ctx.child(), &target, job).await
    }

    /// Run `job` once on every partition owner and collect the outputs
    pub async fn submit_all<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        job: &J,
    ) -> Result<Vec<J::Output>> {
        self.dispatcher
            .affinity_call_all(&ctx.child(), TASKS_CACHE, job)
            .await
    }
}
