//! Cluster singleton services
//!
//! A singleton service has exactly one live instance across the cluster.
//! The first node to ask for it claims it in the grid's service directory
//! and instantiates it; everyone else reaches it through a
//! [`ServiceProxy`], which calls locally or over affinity RPC depending on
//! where the instance lives. When the host leaves, the next call deploys a
//! fresh instance elsewhere.

mod scheduler;

pub use scheduler::{
    ScheduleRequest, ScheduleResponse, ScheduledCommand, ScheduledExecutor,
    ScheduledExecutorService, SCHEDULED_COMMANDS_CACHE,
};

use crate::context::RequestContext;
use crate::error::{ClusterError, Result};
use crate::executor::LeveledExecutor;
use crate::grid::{CacheSettings, Grid};
use crate::jobs::JobRegistry;
use crate::node::NodeId;
use crate::registry::NodeRegistry;
use crate::rpc::{AffinityDispatcher, Work};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A service with one live instance cluster-wide
#[async_trait]
pub trait SingletonService: Send + Sync + 'static {
    /// Type name; combined with a prefix to form the service id
    const NAME: &'static str;

    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Called once on the hosting node before the first request
    async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(
        &self,
        request: Self::Request,
        ctx: RequestContext,
    ) -> anyhow::Result<Self::Response>;

    /// Called when the instance is undeployed or its node shuts down
    async fn stop(&self) {}
}

/// Resources handed to a service instance on start
#[derive(Clone)]
pub struct ServiceContext {
    pub service_id: String,
    pub grid: Arc<dyn Grid>,
    pub local_node: NodeId,
    pub executor: LeveledExecutor,
    pub jobs: JobRegistry,
    /// Routes jobs the service hands to other nodes
    pub dispatcher: AffinityDispatcher,
    pub cache_settings: CacheSettings,
}

#[async_trait]
trait HostedService: Send + Sync {
    async fn call(&self, payload: Bytes, ctx: RequestContext) -> Result<Bytes>;
    async fn stop(&self);
}

struct Hosted<S> {
    service: S,
    node: NodeId,
}

#[async_trait]
impl<S: SingletonService> HostedService for Hosted<S> {
    async fn call(&self, payload: Bytes, ctx: RequestContext) -> Result<Bytes> {
        let request: S::Request = bincode::deserialize(&payload)?;
        let response = self
            .service
            .handle(request, ctx)
            .await
            .map_err(|e| ClusterError::Remote {
                node: self.node.to_string(),
                message: format!("{:#}", e),
            })?;
        Ok(Bytes::from(bincode::serialize(&response)?))
    }

    async fn stop(&self) {
        self.service.stop().await
    }
}

/// Service instances living on this node
#[derive(Clone, Default)]
pub struct ServiceTable {
    services: Arc<RwLock<HashMap<String, Arc<dyn HostedService>>>>,
}

impl ServiceTable {
    pub fn contains(&self, service_id: &str) -> bool {
        self.services.read().contains_key(service_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    fn insert(&self, service_id: &str, service: Arc<dyn HostedService>) {
        self.services.write().insert(service_id.to_string(), service);
    }

    fn remove(&self, service_id: &str) -> Option<Arc<dyn HostedService>> {
        self.services.write().remove(service_id)
    }

    /// Invoke a local instance with an encoded request
    pub(crate) async fn call(
        &self,
        service_id: &str,
        payload: Bytes,
        ctx: RequestContext,
    ) -> Result<Bytes> {
        let service = self.services.read().get(service_id).cloned();
        match service {
            Some(service) => service.call(payload, ctx).await,
            None => Err(ClusterError::ServiceNotDeployed(service_id.to_string())),
        }
    }

    /// Stop and drop a local instance; `false` if none was running
    pub(crate) async fn stop(&self, service_id: &str) -> bool {
        match self.remove(service_id) {
            Some(service) => {
                service.stop().await;
                true
            }
            None => false,
        }
    }
}

struct ManagerInner {
    grid: Arc<dyn Grid>,
    registry: Arc<NodeRegistry>,
    dispatcher: AffinityDispatcher,
    table: ServiceTable,
    executor: LeveledExecutor,
    cache_settings: CacheSettings,
    deploy: tokio::sync::Mutex<()>,
}

/// Deploys singleton services and hands out proxies to them
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<ManagerInner>,
}

impl ServiceManager {
    pub fn new(
        grid: Arc<dyn Grid>,
        registry: Arc<NodeRegistry>,
        dispatcher: AffinityDispatcher,
        table: ServiceTable,
        executor: LeveledExecutor,
        cache_settings: CacheSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                grid,
                registry,
                dispatcher,
                table,
                executor,
                cache_settings,
                deploy: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Service id for a service type under `prefix`
    pub fn service_id<S: SingletonService>(prefix: &str) -> String {
        format!("{}{}", prefix, S::NAME)
    }

    /// Proxy to the cluster's single instance of `S`, deploying it on this
    /// node if nobody hosts it yet
    pub async fn get_singleton_service<S, F>(
        &self,
        prefix: &str,
        factory: F,
    ) -> Result<ServiceProxy<S>>
    where
        S: SingletonService,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let proxy = ServiceProxy {
            manager: self.clone(),
            service_id: Self::service_id::<S>(prefix),
            factory: Arc::new(factory),
            _types: PhantomData,
        };
        proxy.ensure_deployed().await?;
        Ok(proxy)
    }

    /// Node currently hosting `service_id`, if any
    pub async fn service_host(&self, service_id: &str) -> Result<Option<NodeId>> {
        self.inner.grid.service_host(service_id).await
    }

    /// Services instantiated on this node
    pub fn local_services(&self) -> Vec<String> {
        self.inner.table.ids()
    }

    /// Remove `service_id` from the directory and stop its instance
    pub async fn undeploy(&self, service_id: &str) -> Result<bool> {
        let host = self.inner.grid.service_host(service_id).await?;
        let removed = self.inner.grid.service_undeploy(service_id).await?;

        match host {
            Some(host) if &host == self.inner.registry.local_id() => {
                self.inner.table.stop(service_id).await;
            }
            Some(host) => {
                let work = Work::StopService {
                    service_id: service_id.to_string(),
                };
                if let Err(e) = self
                    .inner
                    .dispatcher
                    .call_node(&RequestContext::new(), &host, work)
                    .await
                {
                    warn!(service = service_id, %host, error = %e, "Remote service stop failed");
                }
            }
            None => {}
        }
        info!(service = service_id, removed, "Undeployed singleton service");
        Ok(removed)
    }

    /// Stop every local instance and give up their directory entries
    pub async fn close(&self) {
        for service_id in self.inner.table.ids() {
            self.inner.table.stop(&service_id).await;
            let local = self.inner.registry.local_id();
            if let Err(e) = self.inner.grid.service_undeploy_if(&service_id, local).await {
                if !e.is_node_stopping() {
                    warn!(service = %service_id, error = %e, "Failed to release service on close");
                }
            }
            debug!(service = %service_id, "Stopped local service");
        }
    }

    async fn deploy<S: SingletonService>(
        &self,
        service_id: &str,
        factory: &(dyn Fn() -> S + Send + Sync),
    ) -> Result<NodeId> {
        let local = self.inner.registry.local_id().clone();
        if self.inner.registry.local_node().is_client() {
            return self
                .inner
                .grid
                .service_host(service_id)
                .await?
                .ok_or_else(|| ClusterError::ServiceNotDeployed(service_id.to_string()));
        }

        let _deploying = self.inner.deploy.lock().await;
        let host = self
            .inner
            .grid
            .service_deploy_if_absent(service_id, &local)
            .await?;
        if host != local || self.inner.table.contains(service_id) {
            return Ok(host);
        }

        let service = factory();
        let ctx = ServiceContext {
            service_id: service_id.to_string(),
            grid: Arc::clone(&self.inner.grid),
            local_node: local.clone(),
            executor: self.inner.executor.clone(),
            jobs: self.inner.dispatcher.jobs().clone(),
            dispatcher: self.inner.dispatcher.clone(),
            cache_settings: self.inner.cache_settings,
        };
        if let Err(e) = service.start(&ctx).await {
            // Give the claim back so another node can try
            if let Err(release) = self.inner.grid.service_undeploy_if(service_id, &local).await {
                warn!(
                    service = service_id,
                    error = %release,
                    "Failed to release service claim after start failure"
                );
            }
            return Err(ClusterError::Internal(format!(
                "service {} failed to start: {:#}",
                service_id, e
            )));
        }
        self.inner.table.insert(
            service_id,
            Arc::new(Hosted {
                service,
                node: local.clone(),
            }),
        );
        info!(service = service_id, node = %local, "Deployed singleton service");
        Ok(local)
    }
}

/// Location-transparent handle on a singleton service
pub struct ServiceProxy<S: SingletonService> {
    manager: ServiceManager,
    service_id: String,
    factory: Arc<dyn Fn() -> S + Send + Sync>,
    _types: PhantomData<fn() -> S>,
}

impl<S: SingletonService> Clone for ServiceProxy<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            service_id: self.service_id.clone(),
            factory: Arc::clone(&self.factory),
            _types: PhantomData,
        }
    }
}

impl<S: SingletonService> ServiceProxy<S> {
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Current host, deploying here when there is none or it left
    pub async fn ensure_deployed(&self) -> Result<NodeId> {
        let inner = &self.manager.inner;
        match inner.grid.service_host(&self.service_id).await? {
            Some(host) if inner.registry.is_member(&host) => Ok(host),
            Some(stale) => {
                warn!(service = %self.service_id, host = %stale, "Service host left the cluster, redeploying");
                // A racing node may already have redeployed; only clear the stale claim
                inner.grid.service_undeploy_if(&self.service_id, &stale).await?;
                self.manager.deploy(&self.service_id, self.factory.as_ref()).await
            }
            None => self.manager.deploy(&self.service_id, self.factory.as_ref()).await,
        }
    }

    pub async fn call(&self, ctx: &RequestContext, request: &S::Request) -> Result<S::Response> {
        let payload = Bytes::from(bincode::serialize(request)?);
        let host = self.ensure_deployed().await?;

        let raw = match self.call_host(ctx, &host, payload.clone()).await {
            Err(e) if is_host_gone(&e) => {
                warn!(service = %self.service_id, %host, error = %e, "Service host gone, redeploying once");
                self.manager
                    .inner
                    .grid
                    .service_undeploy_if(&self.service_id, &host)
                    .await?;
                let host = self.ensure_deployed().await?;
                self.call_host(ctx, &host, payload).await?
            }
            other => other?,
        };
        Ok(bincode::deserialize(&raw)?)
    }

    async fn call_host(&self, ctx: &RequestContext, host: &NodeId, payload: Bytes) -> Result<Bytes> {
        let inner = &self.manager.inner;
        if host == inner.registry.local_id() {
            inner.table.call(&self.service_id, payload, ctx.clone()).await
        } else {
            let work = Work::Service {
                service_id: self.service_id.clone(),
                payload: payload.to_vec(),
            };
            inner.dispatcher.call_node(ctx, host, work).await
        }
    }
}

fn is_host_gone(error: &ClusterError) -> bool {
    matches!(error, ClusterError::ServiceNotDeployed(_)) || error.is_node_stopping()
}
