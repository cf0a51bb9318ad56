// Pool membership tests against the in-memory store
//
// Heartbeat expiry uses short real TTLs: status timestamps come from the
// wall clock, so paused tokio time would not move them.

use std::sync::Arc;
use std::time::Duration;

use nodefleet_cluster::pool::{
    Command, NodeLifecycle, NodeMetadata, NodeMetrics, NodePool, PoolConfig,
};
use nodefleet_cluster::MemoryStore;

const TTL: Duration = Duration::from_millis(100);
const PAST_TTL: Duration = Duration::from_millis(250);

fn pool() -> NodePool {
    let config = PoolConfig {
        heartbeat_ttl: TTL,
        grace_period: Duration::ZERO,
        ..PoolConfig::default()
    };
    NodePool::new(Arc::new(MemoryStore::new()), config)
}

async fn register_live(pool: &NodePool, node_id: &str) {
    pool.register(node_id, &NodeMetadata::new("dc1")).await.unwrap();
    let outcome = pool.heartbeat(node_id, &NodeMetrics::default()).await.unwrap();
    assert!(outcome.admitted);
}

#[tokio::test]
async fn test_register_and_heartbeat_makes_node_active() {
    let pool = pool();
    register_live(&pool, "n1").await;

    assert_eq!(pool.get_active_nodes().await.unwrap(), vec!["n1"]);
    let state = pool.get_node_status("n1").await.unwrap().unwrap();
    assert_eq!(state.lifecycle, NodeLifecycle::Active);
    assert_eq!(state.data_center, "dc1");
    assert!(state.heartbeat.is_some());
}

#[tokio::test]
async fn test_expired_heartbeat_leaves_active_set() {
    let pool = pool();
    register_live(&pool, "n1").await;

    tokio::time::sleep(PAST_TTL).await;

    assert!(pool.get_active_nodes().await.unwrap().is_empty());
    let state = pool.get_node_status("n1").await.unwrap().unwrap();
    assert_eq!(state.lifecycle, NodeLifecycle::Dead);
    // Still registered until cleanup runs
    assert_eq!(pool.get_all_nodes().await.unwrap(), vec!["n1"]);
}

#[tokio::test]
async fn test_freeze_overrides_heartbeat() {
    let pool = pool();
    register_live(&pool, "n1").await;

    pool.freeze("n1", "maintenance").await.unwrap();
    let outcome = pool.heartbeat("n1", &NodeMetrics::default()).await.unwrap();

    assert!(!outcome.admitted);
    assert!(pool.get_active_nodes().await.unwrap().is_empty());
    assert!(pool.is_frozen("n1").await.unwrap());
    let state = pool.get_node_status("n1").await.unwrap().unwrap();
    assert_eq!(state.lifecycle, NodeLifecycle::Frozen);
    assert_eq!(state.freeze_reason.as_deref(), Some("maintenance"));
}

#[tokio::test]
async fn test_unfreeze_admits_only_live_nodes() {
    let pool = pool();
    register_live(&pool, "live").await;
    register_live(&pool, "gone").await;
    pool.freeze("live", "maintenance").await.unwrap();
    pool.freeze("gone", "maintenance").await.unwrap();

    tokio::time::sleep(PAST_TTL).await;
    pool.heartbeat("live", &NodeMetrics::default()).await.unwrap();

    assert!(pool.unfreeze("live").await.unwrap());
    assert!(!pool.unfreeze("gone").await.unwrap());

    assert_eq!(pool.get_active_nodes().await.unwrap(), vec!["live"]);
    assert!(!pool.is_frozen("gone").await.unwrap());
    let state = pool.get_node_status("gone").await.unwrap().unwrap();
    assert_eq!(state.lifecycle, NodeLifecycle::Dead);
}

#[tokio::test]
async fn test_cleanup_is_idempotent_and_spares_live_nodes() {
    let pool = pool();
    register_live(&pool, "dead").await;
    tokio::time::sleep(PAST_TTL).await;
    register_live(&pool, "live").await;
    pool.enqueue_command("dead", &Command::new("status")).await.unwrap();

    assert_eq!(pool.cleanup_dead_nodes().await.unwrap(), vec!["dead"]);
    assert!(pool.cleanup_dead_nodes().await.unwrap().is_empty());

    assert_eq!(pool.get_all_nodes().await.unwrap(), vec!["live"]);
    assert!(pool.get_node_status("dead").await.unwrap().is_none());
    assert!(pool.dequeue_command("dead").await.unwrap().is_none());
    assert_eq!(pool.get_active_nodes().await.unwrap(), vec!["live"]);
}

#[tokio::test]
async fn test_cleanup_respects_grace_period() {
    let config = PoolConfig {
        heartbeat_ttl: TTL,
        grace_period: Duration::from_secs(3600),
        ..PoolConfig::default()
    };
    let pool = NodePool::new(Arc::new(MemoryStore::new()), config);
    register_live(&pool, "n1").await;
    tokio::time::sleep(PAST_TTL).await;

    assert!(pool.cleanup_dead_nodes().await.unwrap().is_empty());
    assert_eq!(pool.get_all_nodes().await.unwrap(), vec!["n1"]);
}

#[tokio::test]
async fn test_grace_period_counts_from_heartbeat_expiry() {
    let config = PoolConfig {
        heartbeat_ttl: Duration::from_millis(200),
        grace_period: Duration::from_millis(150),
        ..PoolConfig::default()
    };
    let pool = NodePool::new(Arc::new(MemoryStore::new()), config);
    register_live(&pool, "n1").await;

    // Expired 50ms ago, well inside the grace period
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(pool.cleanup_dead_nodes().await.unwrap().is_empty());
    assert_eq!(pool.get_all_nodes().await.unwrap(), vec!["n1"]);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pool.cleanup_dead_nodes().await.unwrap(), vec!["n1"]);
}

#[tokio::test]
async fn test_unacked_command_is_redelivered_first() {
    let pool = pool();
    register_live(&pool, "n1").await;
    let first = Command::new("restart");
    let second = Command::new("status");
    pool.enqueue_command("n1", &first).await.unwrap();
    pool.enqueue_command("n1", &second).await.unwrap();

    let delivery = pool.dequeue_command("n1").await.unwrap().unwrap();
    assert_eq!(delivery.command.command_id, first.command_id);
    let state = pool.get_node_status("n1").await.unwrap().unwrap();
    assert_eq!(state.pending_commands, 1);
    assert_eq!(state.in_flight_commands, 1);

    // Crash before ack
    assert_eq!(pool.requeue_in_flight("n1").await.unwrap(), 1);

    let redelivered = pool.dequeue_command("n1").await.unwrap().unwrap();
    assert_eq!(redelivered.command.command_id, first.command_id);
    assert!(pool.ack_command("n1", &redelivered).await.unwrap());

    let next = pool.dequeue_command("n1").await.unwrap().unwrap();
    assert_eq!(next.command.command_id, second.command_id);
}

#[tokio::test]
async fn test_data_center_filters() {
    let pool = pool();
    register_live(&pool, "a1").await;
    pool.register("b1", &NodeMetadata::new("dc2")).await.unwrap();
    pool.register("a2", &NodeMetadata::new("dc1")).await.unwrap();

    assert_eq!(pool.nodes_in_data_center("dc1").await.unwrap(), vec!["a1", "a2"]);
    assert_eq!(pool.active_nodes_in_data_center("dc1").await.unwrap(), vec!["a1"]);
    assert!(pool.active_nodes_in_data_center("dc2").await.unwrap().is_empty());
}
