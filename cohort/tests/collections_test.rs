//! Distributed collections checked against in-memory models.

use cohort::{
    CacheSettings, Cluster, ClusterConfig, DistributedMap, DistributedMultiMap, Grid,
    LocalFabric, Node, NodeId, RequestContext,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum MultiOp {
    Put(u8, u8),
    RemoveValue(u8, u8),
    Remove(u8),
}

fn multi_op() -> impl Strategy<Value = MultiOp> {
    // Small key and value spaces so operations collide often
    prop_oneof![
        4 => (0u8..4, 0u8..6).prop_map(|(k, v)| MultiOp::Put(k, v)),
        2 => (0u8..4, 0u8..6).prop_map(|(k, v)| MultiOp::RemoveValue(k, v)),
        1 => (0u8..4).prop_map(MultiOp::Remove),
    ]
}

fn grids(fabric: &LocalFabric, count: u16) -> Vec<Arc<dyn Grid>> {
    (1..=count)
        .map(|port| {
            let grid: Arc<dyn Grid> = fabric
                .join(Node::new(NodeId::new("127.0.0.1", port)))
                .unwrap();
            grid
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any sequence of multimap operations, issued round-robin from
    /// several nodes, leaves the same state as an ordered map of lists.
    #[test]
    fn multimap_matches_model(ops in prop::collection::vec(multi_op(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fabric = LocalFabric::new();
            let mut views = Vec::new();
            for grid in grids(&fabric, 3) {
                views.push(
                    DistributedMultiMap::<u8, u8>::open(grid, "tags", CacheSettings::default())
                        .await
                        .unwrap(),
                );
            }
            let mut model: BTreeMap<u8, Vec<u8>> = BTreeMap::new();

            for (i, op) in ops.iter().enumerate() {
                let view = &views[i % views.len()];
                match op {
                    MultiOp::Put(k, v) => {
                        view.put(*k, *v).await.unwrap();
                        model.entry(*k).or_default().push(*v);
                    }
                    MultiOp::RemoveValue(k, v) => {
                        let removed = view.remove_value(k, v).await.unwrap();
                        let expected = match model.get_mut(k) {
                            Some(list) => match list.iter().position(|x| x == v) {
                                Some(pos) => {
                                    list.remove(pos);
                                    if list.is_empty() {
                                        model.remove(k);
                                    }
                                    true
                                }
                                None => false,
                            },
                            None => false,
                        };
                        assert_eq!(removed, expected, "remove_value({k}, {v})");
                    }
                    MultiOp::Remove(k) => {
                        let removed = view.remove(k).await.unwrap();
                        assert_eq!(removed, model.remove(k).unwrap_or_default());
                    }
                }
            }

            let mut keys = views[0].keys().await.unwrap();
            keys.sort_unstable();
            assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
            for (k, values) in &model {
                assert_eq!(&views[1].get(k).await.unwrap(), values);
            }
        });
    }
}

#[tokio::test]
async fn test_map_semantics_across_nodes() {
    let fabric = LocalFabric::new();
    let grids = grids(&fabric, 2);
    let settings = CacheSettings::default();
    let mut views = Vec::new();
    for grid in &grids {
        let locks = cohort::LockService::new(Arc::clone(grid), &Default::default());
        views.push(
            DistributedMap::<String, String>::open(Arc::clone(grid), locks, "sessions", settings)
                .await
                .unwrap(),
        );
    }
    let (a, b) = (&views[0], &views[1]);
    let key = "s-1".to_string();

    assert_eq!(a.put(key.clone(), "alice".into()).await.unwrap(), None);
    assert_eq!(b.get(&key).await.unwrap().as_deref(), Some("alice"));

    // put_if_absent never overwrites
    assert_eq!(
        b.put_if_absent(key.clone(), "mallory".into()).await.unwrap().as_deref(),
        Some("alice")
    );
    assert_eq!(a.get(&key).await.unwrap().as_deref(), Some("alice"));

    assert!(!b.replace_if(key.clone(), &"bob".into(), "carol".into()).await.unwrap());
    assert!(b.replace_if(key.clone(), &"alice".into(), "carol".into()).await.unwrap());
    assert_eq!(a.get_or_default(&"nope".into(), "guest".into()).await.unwrap(), "guest");

    assert_eq!(a.remove(&key).await.unwrap().as_deref(), Some("carol"));
    assert_eq!(b.get(&key).await.unwrap(), None);
    assert!(b.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_transaction_commits_across_maps() {
    let fabric = LocalFabric::new();
    let mut config = ClusterConfig {
        discovery_port: 1,
        ..Default::default()
    };
    config.transfer.bind_addr = "127.0.0.1:0".into();
    let cluster = Cluster::start_local(&fabric, config).await.unwrap();

    let accounts = cluster.map::<String, i64>("accounts").await.unwrap();
    let ledger = cluster.map::<u64, String>("ledger").await.unwrap();
    accounts.put("alice".into(), 100).await.unwrap();
    accounts.put("bob".into(), 0).await.unwrap();

    let mut tx = cluster.transaction();
    tx.put(&accounts, &"alice".to_string(), &60)
        .unwrap()
        .put(&accounts, &"bob".to_string(), &40)
        .unwrap()
        .put(&ledger, &1, &"alice->bob 40".to_string())
        .unwrap();
    assert_eq!(tx.len(), 3);
    assert_eq!(accounts.get(&"bob".into()).await.unwrap(), Some(0));

    tx.commit().await.unwrap();
    assert_eq!(accounts.get(&"alice".into()).await.unwrap(), Some(60));
    assert_eq!(accounts.get(&"bob".into()).await.unwrap(), Some(40));
    assert_eq!(ledger.len().await.unwrap(), 1);

    // Per-key locks are scoped to the calling context
    let ctx = RequestContext::new();
    accounts.lock(&ctx, &"alice".to_string()).await.unwrap();
    let other = RequestContext::new();
    assert!(!accounts
        .try_lock(&other, &"alice".to_string(), std::time::Duration::from_millis(30))
        .await
        .unwrap());
    accounts.unlock(&ctx, &"alice".to_string()).await.unwrap();

    cluster.close().await.unwrap();
}
