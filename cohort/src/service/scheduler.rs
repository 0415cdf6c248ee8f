//! Failover-safe scheduled execution
//!
//! The scheduler is a singleton service. Each command is written to a
//! replicated cache before it is armed locally, and one-shot commands are
//! deleted once they fire. A new instance replays whatever is left in the
//! cache, so after the host dies the schedule survives, though commands
//! restart their delay rather than keeping their original fire time.

use super::{ServiceContext, ServiceManager, ServiceProxy, SingletonService};
use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::grid::Grid;
use crate::jobs::{encode_job, ClusterJob, JobContext};
use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Replicated cache holding every pending command
pub const SCHEDULED_COMMANDS_CACHE: &str = "cohort.scheduled_commands";

/// Persisted description of a scheduled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub id: Uuid,
    pub job: String,
    pub payload: Vec<u8>,
    pub delay_ms: u64,
    /// Fixed rate; `None` for a one-shot
    pub period_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledCommand {
    pub fn is_periodic(&self) -> bool {
        self.period_ms.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleRequest {
    Schedule(ScheduledCommand),
    Cancel(Uuid),
    List,
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleResponse {
    Scheduled(Uuid),
    Cancelled(bool),
    Commands(Vec<ScheduledCommand>),
    Destroyed,
}

/// Singleton that owns the armed timers
#[derive(Default)]
pub struct ScheduledExecutorService {
    runtime: Mutex<Option<ServiceContext>>,
    timers: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl ScheduledExecutorService {
    pub fn new() -> Self {
        Self::default()
    }

    fn runtime(&self) -> anyhow::Result<ServiceContext> {
        self.runtime
            .lock()
            .clone()
            .context("scheduled executor used before start")
    }

    /// Arm a timer for `command` on this node
    fn arm(&self, ctx: &ServiceContext, command: ScheduledCommand) {
        let token = CancellationToken::new();
        if let Some(previous) = self.timers.lock().insert(command.id, token.clone()) {
            previous.cancel();
        }

        let timers = Arc::clone(&self.timers);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let id = command.id;
            let mut wait = Duration::from_millis(command.delay_ms);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }

                fire(&ctx, &command).await;

                match command.period_ms {
                    Some(period) => wait = Duration::from_millis(period.max(1)),
                    None => {
                        if let Err(e) = ctx
                            .grid
                            .cache_remove(SCHEDULED_COMMANDS_CACHE, id.as_bytes())
                            .await
                        {
                            warn!(command = %id, error = %e, "Failed to drop fired command");
                        }
                        timers.lock().remove(&id);
                        return;
                    }
                }
            }
        });
    }

    fn disarm_all(&self) -> usize {
        let timers: Vec<_> = self.timers.lock().drain().collect();
        for (_, token) in &timers {
            token.cancel();
        }
        timers.len()
    }
}

async fn fire(ctx: &ServiceContext, command: &ScheduledCommand) {
    let job_ctx = JobContext::new(
        RequestContext::new(),
        ctx.local_node.clone(),
        ctx.executor.clone(),
        ctx.jobs.clone(),
        Some(ctx.dispatcher.clone()),
    );
    let jobs = ctx.jobs.clone();
    let name = command.job.clone();
    let payload = Bytes::from(command.payload.clone());
    let result = ctx
        .executor
        .run(0, async move { jobs.execute(&name, payload, job_ctx).await })
        .await;
    match result {
        Ok(_) => debug!(command = %command.id, job = %command.job, "Scheduled command fired"),
        Err(e) => warn!(command = %command.id, job = %command.job, error = %e, "Scheduled command failed"),
    }
}

fn load_commands(entries: Vec<(Bytes, Bytes)>) -> Vec<ScheduledCommand> {
    entries
        .into_iter()
        .filter_map(|(_, raw)| match bincode::deserialize(&raw) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable scheduled command");
                None
            }
        })
        .collect()
}

#[async_trait]
impl SingletonService for ScheduledExecutorService {
    const NAME: &'static str = "cohort.scheduled_executor";

    type Request = ScheduleRequest;
    type Response = ScheduleResponse;

    async fn start(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        ctx.grid
            .create_cache(SCHEDULED_COMMANDS_CACHE, ctx.cache_settings)
            .await?;
        *self.runtime.lock() = Some(ctx.clone());

        let survivors = load_commands(ctx.grid.cache_entries(SCHEDULED_COMMANDS_CACHE).await?);
        for command in &survivors {
            self.arm(ctx, command.clone());
        }
        info!(
            node = %ctx.local_node,
            replayed = survivors.len(),
            "Scheduled executor started"
        );
        Ok(())
    }

    async fn handle(
        &self,
        request: ScheduleRequest,
        _ctx: RequestContext,
    ) -> anyhow::Result<ScheduleResponse> {
        let runtime = self.runtime()?;
        let grid: &Arc<dyn Grid> = &runtime.grid;

        match request {
            ScheduleRequest::Schedule(command) => {
                let id = command.id;
                // Persist first so a failover never loses an armed command
                grid.cache_put(
                    SCHEDULED_COMMANDS_CACHE,
                    Bytes::copy_from_slice(id.as_bytes()),
                    Bytes::from(bincode::serialize(&command)?),
                )
                .await?;
                debug!(command = %id, job = %command.job, periodic = command.is_periodic(), "Scheduled command");
                self.arm(&runtime, command);
                Ok(ScheduleResponse::Scheduled(id))
            }
            ScheduleRequest::Cancel(id) => {
                let armed = self.timers.lock().remove(&id);
                if let Some(token) = &armed {
                    token.cancel();
                }
                let stored = grid
                    .cache_remove(SCHEDULED_COMMANDS_CACHE, id.as_bytes())
                    .await?;
                Ok(ScheduleResponse::Cancelled(armed.is_some() || stored.is_some()))
            }
            ScheduleRequest::List => {
                let mut commands =
                    load_commands(grid.cache_entries(SCHEDULED_COMMANDS_CACHE).await?);
                commands.sort_by_key(|c| c.created_at);
                Ok(ScheduleResponse::Commands(commands))
            }
            ScheduleRequest::Destroy => {
                let cancelled = self.disarm_all();
                grid.destroy_cache(SCHEDULED_COMMANDS_CACHE).await?;
                grid.create_cache(SCHEDULED_COMMANDS_CACHE, runtime.cache_settings)
                    .await?;
                info!(cancelled, "Scheduled executor destroyed");
                Ok(ScheduleResponse::Destroyed)
            }
        }
    }

    async fn stop(&self) {
        // Timers go, persisted commands stay for the next instance
        let disarmed = self.disarm_all();
        debug!(disarmed, "Scheduled executor stopped");
    }
}

/// Client for the cluster's scheduled executor
#[derive(Clone)]
pub struct ScheduledExecutor {
    proxy: ServiceProxy<ScheduledExecutorService>,
}

impl ScheduledExecutor {
    /// Connect to (or deploy) the scheduler singleton under `prefix`
    pub async fn connect(services: &ServiceManager, prefix: &str) -> Result<Self> {
        let proxy = services
            .get_singleton_service(prefix, ScheduledExecutorService::new)
            .await?;
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &ServiceProxy<ScheduledExecutorService> {
        &self.proxy
    }

    /// Run `job` once after `delay`
    pub async fn schedule<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        job: &J,
        delay: Duration,
    ) -> Result<Uuid> {
        self.submit(ctx, job, delay, None).await
    }

    /// Run `job` after `delay`, then every `period`
    pub async fn schedule_at_fixed_rate<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        job: &J,
        delay: Duration,
        period: Duration,
    ) -> Result<Uuid> {
        self.submit(ctx, job, delay, Some(period)).await
    }

    async fn submit<J: ClusterJob>(
        &self,
        ctx: &RequestContext,
        job: &J,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<Uuid> {
        let command = ScheduledCommand {
            id: Uuid::new_v4(),
            job: J::NAME.to_string(),
            payload: encode_job(job)?.to_vec(),
            delay_ms: saturating_millis(delay),
            period_ms: period.map(saturating_millis),
            created_at: Utc::now(),
        };
        match self
            .proxy
            .call(ctx, &ScheduleRequest::Schedule(command))
            .await?
        {
            ScheduleResponse::Scheduled(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// `false` if no such command was pending
    pub async fn cancel(&self, ctx: &RequestContext, id: Uuid) -> Result<bool> {
        match self.proxy.call(ctx, &ScheduleRequest::Cancel(id)).await? {
            ScheduleResponse::Cancelled(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    /// Pending commands, oldest first
    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<ScheduledCommand>> {
        match self.proxy.call(ctx, &ScheduleRequest::List).await? {
            ScheduleResponse::Commands(commands) => Ok(commands),
            other => Err(unexpected(other)),
        }
    }

    /// Cancel everything and drop the persisted schedule
    pub async fn destroy(&self, ctx: &RequestContext) -> Result<()> {
        match self.proxy.call(ctx, &ScheduleRequest::Destroy).await? {
            ScheduleResponse::Destroyed => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Whole milliseconds, pinned at `u64::MAX` for absurdly long durations
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn unexpected(response: ScheduleResponse) -> ClusterError {
    ClusterError::Internal(format!("unexpected scheduler response: {:?}", response))
}
