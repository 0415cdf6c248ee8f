//! Multi-node tests through the cluster facade.
//!
//! Every node joins one in-process fabric, so the whole cluster lives in a
//! single test runtime: affinity routing, singleton failover and scheduler
//! replay all go through the same code paths a real grid would drive.

use anyhow::bail;
use async_trait::async_trait;
use cohort::service::{ServiceContext, ServiceManager};
use cohort::{
    Cluster, ClusterConfig, ClusterError, ClusterJob, Grid, JobContext, LocalFabric,
    MessageEvent, MessageListener, NodeId, RequestContext, SingletonService,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct WhereAmI;

#[async_trait]
impl ClusterJob for WhereAmI {
    const NAME: &'static str = "it.where_am_i";
    type Output = String;

    async fn run(self, ctx: JobContext) -> anyhow::Result<String> {
        Ok(ctx.local_node().to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct Explode {
    reason: String,
}

#[async_trait]
impl ClusterJob for Explode {
    const NAME: &'static str = "it.explode";
    type Output = ();

    async fn run(self, _ctx: JobContext) -> anyhow::Result<()> {
        bail!("exploded: {}", self.reason)
    }
}

/// Singleton keeping a running total in memory
#[derive(Default)]
struct Counter {
    total: AtomicU64,
}

#[async_trait]
impl SingletonService for Counter {
    const NAME: &'static str = "it.counter";
    type Request = u64;
    type Response = u64;

    async fn handle(&self, add: u64, _ctx: RequestContext) -> anyhow::Result<u64> {
        Ok(self.total.fetch_add(add, Ordering::SeqCst) + add)
    }
}

fn config(port: u16) -> ClusterConfig {
    let mut config = ClusterConfig {
        discovery_port: port,
        ..Default::default()
    };
    config.transfer.bind_addr = "127.0.0.1:0".into();
    config.rpc.request_timeout_ms = 2_000;
    config
}

async fn start_cluster(fabric: &LocalFabric, ports: &[u16]) -> Vec<Cluster> {
    let mut nodes = Vec::new();
    for port in ports {
        let node = Cluster::start_local(fabric, config(*port)).await.unwrap();
        node.register_job::<WhereAmI>();
        node.register_job::<Explode>();
        nodes.push(node);
    }
    nodes
}

async fn close_all(nodes: &[Cluster]) {
    for node in nodes {
        node.close().await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Affinity calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_affinity_call_runs_on_partition_owner() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2, 3]).await;
    let ctx = RequestContext::new();

    for key in ["order-1", "order-2", "order-77", "customer-9"] {
        let encoded = bincode::serialize(key).unwrap();
        let owner = nodes[0].grid().partition_owner("orders", &encoded).unwrap();
        for caller in &nodes {
            let ran_on = caller
                .affinity_call(&ctx, "orders", key, &WhereAmI)
                .await
                .unwrap();
            assert_eq!(ran_on, owner.to_string(), "key {key}");
        }
    }

    close_all(&nodes).await;
}

#[tokio::test]
async fn test_affinity_call_all_reaches_every_owner_once() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2, 3]).await;

    let mut ran_on = nodes[1]
        .affinity_call_all(&RequestContext::new(), "orders", &WhereAmI)
        .await
        .unwrap();
    ran_on.sort();
    assert_eq!(ran_on, vec!["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"]);

    close_all(&nodes).await;
}

#[tokio::test]
async fn test_remote_failure_is_wrapped_not_transport() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    let target = nodes[1].local_id().clone();

    let err = nodes[0]
        .dispatcher()
        .call_job(
            &RequestContext::new(),
            &target,
            &Explode {
                reason: "bad input".into(),
            },
        )
        .await
        .unwrap_err();
    match err {
        ClusterError::Remote { node, message } => {
            assert_eq!(node, target.to_string());
            assert!(message.contains("exploded: bad input"), "{message}");
        }
        other => panic!("expected remote error, got {other}"),
    }

    close_all(&nodes).await;
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_membership_and_master_follow_the_grid() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2, 3]).await;

    for node in &nodes {
        assert_eq!(node.registry().members(true).len(), 3);
    }
    assert!(nodes[0].registry().is_master());
    assert!(!nodes[1].registry().is_master());

    nodes[0].close().await.unwrap();
    assert_eq!(nodes[1].registry().members(true).len(), 2);
    assert!(nodes[1].registry().is_master());

    close_all(&nodes[1..]).await;
}

// ---------------------------------------------------------------------------
// Singleton services
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_singleton_has_one_instance() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2, 3]).await;
    let ctx = RequestContext::new();

    let mut proxies = Vec::new();
    for node in &nodes {
        proxies.push(
            node.services()
                .get_singleton_service("it.", Counter::default)
                .await
                .unwrap(),
        );
    }

    // Each call adds to the same in-memory total wherever it is made from
    let mut last = 0;
    for proxy in &proxies {
        last = proxy.call(&ctx, &5).await.unwrap();
    }
    assert_eq!(last, 15);

    let id = ServiceManager::service_id::<Counter>("it.");
    let hosts: usize = nodes
        .iter()
        .map(|n| n.services().local_services().iter().filter(|s| **s == id).count())
        .sum();
    assert_eq!(hosts, 1);

    close_all(&nodes).await;
}

#[tokio::test]
async fn test_singleton_redeploys_after_host_leaves() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    let ctx = RequestContext::new();

    let first = nodes[0]
        .services()
        .get_singleton_service("it.", Counter::default)
        .await
        .unwrap();
    assert_eq!(first.call(&ctx, &40).await.unwrap(), 40);

    let second = nodes[1]
        .services()
        .get_singleton_service("it.", Counter::default)
        .await
        .unwrap();
    assert_eq!(second.call(&ctx, &2).await.unwrap(), 42);

    nodes[0].close().await.unwrap();

    // In-memory state went with the old host; the service itself survives
    assert_eq!(second.call(&ctx, &1).await.unwrap(), 1);
    let host = nodes[1]
        .services()
        .service_host(second.service_id())
        .await
        .unwrap();
    assert_eq!(host.as_ref(), Some(nodes[1].local_id()));

    nodes[1].close().await.unwrap();
}

#[tokio::test]
async fn test_undeploy_stops_remote_instance() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;

    let proxy = nodes[0]
        .services()
        .get_singleton_service("it.", Counter::default)
        .await
        .unwrap();
    assert_eq!(nodes[0].services().local_services().len(), 1);

    assert!(nodes[1]
        .services()
        .undeploy(proxy.service_id())
        .await
        .unwrap());
    assert!(nodes[0].services().local_services().is_empty());
    assert_eq!(
        nodes[1].services().service_host(proxy.service_id()).await.unwrap(),
        None
    );

    close_all(&nodes).await;
}

/// Refuses to start while `fail` is set
struct Stubborn {
    fail: bool,
}

#[async_trait]
impl SingletonService for Stubborn {
    const NAME: &'static str = "it.stubborn";
    type Request = ();
    type Response = String;

    async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        if self.fail {
            bail!("backing store unreachable");
        }
        Ok(())
    }

    async fn handle(&self, _request: (), _ctx: RequestContext) -> anyhow::Result<String> {
        Ok("up".into())
    }
}

#[tokio::test]
async fn test_failed_start_releases_the_claim() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    let id = ServiceManager::service_id::<Stubborn>("it.");

    let err = nodes[0]
        .services()
        .get_singleton_service("it.", || Stubborn { fail: true })
        .await
        .err()
        .expect("start should fail");
    assert!(err.to_string().contains("backing store unreachable"), "{err}");
    assert_eq!(nodes[1].services().service_host(&id).await.unwrap(), None);

    // Nothing blocks the next attempt, here or on another node
    let proxy = nodes[1]
        .services()
        .get_singleton_service("it.", || Stubborn { fail: false })
        .await
        .unwrap();
    assert_eq!(proxy.call(&RequestContext::new(), &()).await.unwrap(), "up");
    assert_eq!(
        nodes[0].services().service_host(&id).await.unwrap().as_ref(),
        Some(nodes[1].local_id())
    );

    close_all(&nodes).await;
}

#[tokio::test]
async fn test_stale_claim_is_replaced_on_call() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    let id = ServiceManager::service_id::<Counter>("it.");

    // Directory still names a host that is no longer a member
    let gone = NodeId::new("10.9.9.9", 1);
    nodes[0]
        .grid()
        .service_deploy_if_absent(&id, &gone)
        .await
        .unwrap();

    let proxy = nodes[1]
        .services()
        .get_singleton_service("it.", Counter::default)
        .await
        .unwrap();
    assert_eq!(proxy.call(&RequestContext::new(), &7).await.unwrap(), 7);
    let host = nodes[0].services().service_host(&id).await.unwrap();
    assert_eq!(host.as_ref(), Some(nodes[1].local_id()));

    // A caller holding the old host must not evict the new one
    assert!(!nodes[0].grid().service_undeploy_if(&id, &gone).await.unwrap());
    assert_eq!(proxy.call(&RequestContext::new(), &1).await.unwrap(), 8);

    close_all(&nodes).await;
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

static HEARTBEATS: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct Heartbeat;

#[async_trait]
impl ClusterJob for Heartbeat {
    const NAME: &'static str = "it.heartbeat";
    type Output = ();

    async fn run(self, _ctx: JobContext) -> anyhow::Result<()> {
        HEARTBEATS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_scheduled_commands_survive_host_failover() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    for node in &nodes {
        node.register_job::<Heartbeat>();
    }
    let ctx = RequestContext::new();

    let scheduler = nodes[0].scheduled_executor("it.").await.unwrap();
    let periodic = scheduler
        .schedule_at_fixed_rate(&ctx, &Heartbeat, Duration::from_millis(100), Duration::from_millis(20))
        .await
        .unwrap();
    let once = scheduler
        .schedule(&ctx, &Heartbeat, Duration::from_secs(3_600))
        .await
        .unwrap();
    assert_eq!(scheduler.list(&ctx).await.unwrap().len(), 2);

    // Host goes away before anything fired
    nodes[0].close().await.unwrap();

    let survivor = nodes[1].scheduled_executor("it.").await.unwrap();
    let listed: Vec<_> = survivor
        .list(&ctx)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert!(listed.contains(&periodic));
    assert!(listed.contains(&once));

    let before = HEARTBEATS.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(HEARTBEATS.load(Ordering::SeqCst) > before);

    assert!(survivor.cancel(&ctx, periodic).await.unwrap());
    assert!(!survivor.cancel(&ctx, periodic).await.unwrap());
    survivor.destroy(&ctx).await.unwrap();
    assert!(survivor.list(&ctx).await.unwrap().is_empty());

    nodes[1].close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Tasks and messaging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_submit_spreads_over_server_nodes() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    let ctx = RequestContext::new();

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(nodes[0].tasks().submit(&ctx, &WhereAmI, false).await.unwrap());
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen, vec!["127.0.0.1:1", "127.0.0.1:2"]);

    close_all(&nodes).await;
}

/// Hands itself on to another node until `remaining` runs out, alternating
/// between routed submission and affinity routing, and reports the level of
/// the last hop
#[derive(Serialize, Deserialize)]
struct Chain {
    remaining: u32,
}

#[async_trait]
impl ClusterJob for Chain {
    const NAME: &'static str = "it.chain";
    type Output = u32;

    async fn run(self, ctx: JobContext) -> anyhow::Result<u32> {
        if self.remaining == 0 {
            return Ok(ctx.level());
        }
        let next = Chain {
            remaining: self.remaining - 1,
        };
        let level = if self.remaining % 2 == 0 {
            ctx.submit(&next, false).await?
        } else {
            ctx.affinity_call("chain", &self.remaining, &next).await?
        };
        Ok(level)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nested_jobs_deeper_than_pool_complete() {
    let fabric = LocalFabric::new();
    let mut nodes = Vec::new();
    for port in [1, 2, 3] {
        let mut config = config(port);
        config.executor.pool_size = 1;
        config.executor.max_levels = 8;
        let node = Cluster::start_local(&fabric, config).await.unwrap();
        node.register_job::<Chain>();
        nodes.push(node);
    }

    // Every hop waits on the next one, so with one worker per level the
    // chain only finishes if each hop gets a level of its own
    let runs = (0..3).map(|i| {
        let node = nodes[i].clone();
        async move {
            node.tasks()
                .submit(&RequestContext::new(), &Chain { remaining: 4 }, false)
                .await
        }
    });
    let levels = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(runs))
        .await
        .expect("nested jobs stalled");
    for level in levels {
        assert_eq!(level.unwrap(), 5);
    }

    close_all(&nodes).await;
}

#[derive(Debug, Serialize, Deserialize)]
enum PingPong {
    Ping(u32),
    Pong(u32),
}

struct Ponger {
    cluster: Cluster,
}

#[async_trait]
impl MessageListener for Ponger {
    async fn on_message(&self, event: MessageEvent) {
        if let Ok(PingPong::Ping(n)) = event.decode::<PingPong>() {
            let _ = self
                .cluster
                .bus()
                .send_message_to(&event.sender, &PingPong::Pong(n))
                .await;
        }
    }
}

#[tokio::test]
async fn test_exchange_messages_between_nodes() {
    let fabric = LocalFabric::new();
    let nodes = start_cluster(&fabric, &[1, 2]).await;
    nodes[1].bus().add_listener(Arc::new(Ponger {
        cluster: nodes[1].clone(),
    }));

    let reply = nodes[0]
        .bus()
        .exchange_messages(nodes[1].local_id(), &PingPong::Ping(7), |event| {
            matches!(event.decode::<PingPong>(), Ok(PingPong::Pong(7)))
        })
        .await
        .unwrap();
    assert_eq!(&reply.sender, nodes[1].local_id());
    assert!(matches!(reply.decode::<PingPong>().unwrap(), PingPong::Pong(7)));

    close_all(&nodes).await;
}
