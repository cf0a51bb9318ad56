// Lifecycle events driving load-balancer upstreams end to end

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodefleet_cluster::discovery::{
    CallbackIpResolver, IpResolutionChain, StaticIpResolver, Upstream, UpstreamSink,
    UpstreamWatcher, UpstreamWatcherConfig,
};
use nodefleet_cluster::pool::{NodeMetadata, NodeMetrics, NodePool, PoolConfig};
use nodefleet_cluster::{
    DeadNodeReaper, EventBus, LifecycleEvent, LifecycleEventKind, MemoryStore,
};
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<Vec<Upstream>>>,
}

impl RecordingSink {
    fn latest_ids(&self) -> Option<Vec<String>> {
        self.applied
            .lock()
            .last()
            .map(|list| list.iter().map(|u| u.node_id.clone()).collect())
    }
}

#[async_trait]
impl UpstreamSink for RecordingSink {
    async fn apply(&self, upstreams: &[Upstream]) -> anyhow::Result<()> {
        self.applied.lock().push(upstreams.to_vec());
        Ok(())
    }
}

async fn wait_for(sink: &RecordingSink, expected: &[&str]) {
    let expected: Vec<String> = expected.iter().map(|s| (*s).to_string()).collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while sink.latest_ids().as_ref() != Some(&expected) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "upstreams never became {expected:?}, last {:?}",
            sink.latest_ids()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_ip_chain_falls_back_to_static_table() {
    let primary = CallbackIpResolver::new("inventory", |_node_id| async { None });
    let fallback = StaticIpResolver::from_iter([("web1".to_string(), "10.0.1.10".to_string())]);
    let chain = IpResolutionChain::new()
        .with(Arc::new(primary))
        .with(Arc::new(fallback));

    assert_eq!(chain.resolve("web1").await.unwrap(), "10.0.1.10");
}

#[tokio::test]
async fn test_events_drive_upstream_changes() {
    let config = PoolConfig {
        heartbeat_ttl: Duration::from_millis(100),
        grace_period: Duration::ZERO,
        ..PoolConfig::default()
    };
    let pool = NodePool::new(Arc::new(MemoryStore::new()), config);
    let bus = EventBus::for_pool(&pool, "lb_events");
    for node_id in ["n1", "n2"] {
        pool.register(node_id, &NodeMetadata::new("dc1").with_ip(format!("10.0.0.{}", &node_id[1..])))
            .await
            .unwrap();
        pool.heartbeat(node_id, &NodeMetrics::default()).await.unwrap();
    }

    let sink = Arc::new(RecordingSink::default());
    let chain = IpResolutionChain::new().with(Arc::new(
        nodefleet_cluster::discovery::StoreIpResolver::new(pool.clone()),
    ));
    let watcher = Arc::new(UpstreamWatcher::new(
        pool.clone(),
        bus.clone(),
        chain,
        sink.clone(),
        UpstreamWatcherConfig {
            reconcile_interval: Duration::from_secs(3600),
            keep_last_known: true,
        },
    ));
    let handle = watcher.clone().start().await.unwrap();

    // Initial reconcile on the first tick
    wait_for(&sink, &["n1", "n2"]).await;
    assert_eq!(sink.applied.lock()[0][1].address, "10.0.0.2");

    pool.freeze("n2", "maintenance").await.unwrap();
    bus.publish_snapshot(
        &pool,
        LifecycleEvent::new(LifecycleEventKind::NodeFrozen, "n2").with_reason("maintenance"),
    )
    .await;
    wait_for(&sink, &["n1"]).await;

    // n1 stops heartbeating and the reaper announces its removal
    tokio::time::sleep(Duration::from_millis(250)).await;
    let reaper = DeadNodeReaper::new(pool.clone(), bus.clone(), Duration::from_secs(3600));
    let removed = reaper.run_once().await.unwrap();
    assert!(removed.contains(&"n1".to_string()));
    wait_for(&sink, &[]).await;

    watcher.shutdown();
    handle.await.unwrap();
}
