//! Periodic dead-node cleanup
//!
//! Runs `cleanup_dead_nodes` on an interval and announces each removal on
//! the event bus. Several reapers may run against one store.

use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::NodePool;
use crate::error::Result;
use crate::events::{EventBus, LifecycleEvent, LifecycleEventKind};

pub struct DeadNodeReaper {
    pool: NodePool,
    bus: EventBus,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl DeadNodeReaper {
    #[must_use]
    pub fn new(pool: NodePool, bus: EventBus, interval: Duration) -> Self {
        Self {
            pool,
            bus,
            interval,
            cancel_token: CancellationToken::new(),
        }
    }

    /// One cleanup pass; returns the removed ids
    pub async fn run_once(&self) -> Result<Vec<String>> {
        let removed = self.pool.cleanup_dead_nodes().await?;
        for node_id in &removed {
            self.bus
                .publish_snapshot(
                    &self.pool,
                    LifecycleEvent::new(LifecycleEventKind::NodeRemoved, node_id.clone()),
                )
                .await;
        }
        Ok(removed)
    }

    /// Start the cleanup loop
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    /// Use `shutdown()` to stop the loop.
    pub fn start(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Dead node reaper shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        match self.run_once().await {
                            Ok(removed) if !removed.is_empty() => {
                                tracing::info!(count = removed.len(), nodes = ?removed, "Reaped dead nodes");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "Dead node cleanup failed");
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{NodeMetadata, PoolConfig};
    use crate::store::MemoryStore;
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_once_announces_removals() {
        let config = PoolConfig {
            heartbeat_ttl: Duration::from_millis(50),
            grace_period: Duration::ZERO,
            ..PoolConfig::default()
        };
        let pool = NodePool::new(Arc::new(MemoryStore::new()), config);
        let bus = EventBus::for_pool(&pool, "lb_events");
        let reaper = DeadNodeReaper::new(pool.clone(), bus.clone(), Duration::from_secs(30));

        pool.register("n1", &NodeMetadata::new("dc1")).await.unwrap();
        let mut events = bus.subscribe().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(reaper.run_once().await.unwrap(), vec!["n1"]);
        let event = events.next().await.unwrap();
        assert_eq!(event.kind, LifecycleEventKind::NodeRemoved);
        assert_eq!(event.node_id, "n1");

        assert!(reaper.run_once().await.unwrap().is_empty());
    }
}
