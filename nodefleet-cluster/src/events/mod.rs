//! Lifecycle events for load-balancer integrations
//!
//! Delivery is best effort: no persistence and no replay. Every event
//! carries a snapshot of the active set so a subscriber that missed earlier
//! events can rebuild its view from the latest one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pool::NodePool;
use crate::store::CoordinationStore;

/// Stream of parsed lifecycle events
pub type EventStream = BoxStream<'static, LifecycleEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    NodeRegistered,
    NodeFrozen,
    NodeUnfrozen,
    NodeRemoved,
}

impl std::fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NodeRegistered => "node_registered",
            Self::NodeFrozen => "node_frozen",
            Self::NodeUnfrozen => "node_unfrozen",
            Self::NodeRemoved => "node_removed",
        };
        f.write_str(name)
    }
}

/// Payload published on the lifecycle channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "event")]
    pub kind: LifecycleEventKind,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_center: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
    /// Active set at publish time
    #[serde(default)]
    pub active_nodes: Vec<String>,
}

impl LifecycleEvent {
    #[must_use]
    pub fn new(kind: LifecycleEventKind, node_id: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            timestamp: Utc::now(),
            reason: None,
            data_center: None,
            node_port: None,
            active_nodes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_data_center(mut self, data_center: impl Into<String>) -> Self {
        self.data_center = Some(data_center.into());
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.node_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_active_nodes(mut self, active_nodes: Vec<String>) -> Self {
        self.active_nodes = active_nodes;
        self
    }
}

/// Publish/subscribe handle for lifecycle events
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn CoordinationStore>,
    channel: String,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }

    /// Bus on `{prefix}:{name}` sharing the pool's store
    #[must_use]
    pub fn for_pool(pool: &NodePool, name: &str) -> Self {
        Self::new(pool.store().clone(), pool.keys().channel(name))
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the number of subscribers that received the event
    pub async fn publish(&self, event: &LifecycleEvent) -> Result<usize> {
        let payload = serde_json::to_string(event)?;
        let receivers = self.store.publish(&self.channel, &payload).await?;
        tracing::debug!(
            event = %event.kind,
            node_id = %event.node_id,
            receivers = receivers,
            "Published lifecycle event"
        );
        Ok(receivers)
    }

    /// Attach the pool's current active set and publish.
    ///
    /// Failures are logged and swallowed; the store state is already correct
    /// and subscribers reconcile periodically.
    pub async fn publish_snapshot(&self, pool: &NodePool, event: LifecycleEvent) {
        let event = match pool.get_active_nodes().await {
            Ok(active) => event.with_active_nodes(active),
            Err(e) => {
                tracing::warn!(error = %e, "Could not snapshot active nodes for event");
                event
            }
        };
        if let Err(e) = self.publish(&event).await {
            tracing::warn!(
                event = %event.kind,
                node_id = %event.node_id,
                error = %e,
                "Failed to publish lifecycle event"
            );
        }
    }

    /// Events published from now on. Malformed payloads are skipped.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let channel = self.channel.clone();
        let raw = self.store.subscribe(&self.channel).await?;
        let events = raw.filter_map(move |payload| {
            let parsed = match serde_json::from_str::<LifecycleEvent>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(
                        channel = %channel,
                        error = %e,
                        payload = %payload,
                        "Ignoring malformed lifecycle event"
                    );
                    None
                }
            };
            futures::future::ready(parsed)
        });
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{NodeMetadata, NodeMetrics, PoolConfig};
    use crate::store::MemoryStore;

    #[test]
    fn test_event_wire_format() {
        let event = LifecycleEvent::new(LifecycleEventKind::NodeFrozen, "n1")
            .with_reason("maintenance")
            .with_active_nodes(vec!["n2".into()]);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "node_frozen");
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["reason"], "maintenance");
        assert_eq!(json["active_nodes"][0], "n2");
        assert!(json.get("data_center").is_none());
    }

    #[tokio::test]
    async fn test_subscriber_receives_snapshot_and_skips_garbage() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let pool = NodePool::new(store.clone(), PoolConfig::default());
        let bus = EventBus::for_pool(&pool, "lb_events");

        pool.register("n1", &NodeMetadata::new("dc1")).await.unwrap();
        pool.heartbeat("n1", &NodeMetrics::default()).await.unwrap();

        let mut events = bus.subscribe().await.unwrap();
        store.publish(bus.channel(), "{not an event").await.unwrap();
        bus.publish_snapshot(
            &pool,
            LifecycleEvent::new(LifecycleEventKind::NodeRegistered, "n1"),
        )
        .await;

        let event = events.next().await.unwrap();
        assert_eq!(event.kind, LifecycleEventKind::NodeRegistered);
        assert_eq!(event.active_nodes, vec!["n1"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()), "nodefleet:lb_events");
        let receivers = bus
            .publish(&LifecycleEvent::new(LifecycleEventKind::NodeRemoved, "n1"))
            .await
            .unwrap();
        assert_eq!(receivers, 0);
    }
}
