//! Node pool: membership, liveness and command queues
//!
//! Sole writer of record for node state in the coordination store. Liveness
//! is carried by a TTL heartbeat key alone; DEAD is never written anywhere.
//! Steps that must not interleave with another writer (admission to the
//! active set, reaping) go through the store's guarded operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodefleet_core::Config;

use super::keys::KeySpace;
use super::models::{
    Command, CommandResult, Heartbeat, NodeLifecycle, NodeMetadata, NodeMetrics, NodeState,
};
use crate::error::Result;
use crate::store::{CoordinationStore, Guard, ListEnd, Removal};

/// Status hash field holding the last time the node showed signs of life
const LAST_SEEN_FIELD: &str = "last_seen";

/// Settings the pool needs, lifted out of the global configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub keys: KeySpace,
    pub heartbeat_ttl: Duration,
    /// How long a node must have been dead, counted from heartbeat expiry,
    /// before `cleanup_dead_nodes` erases it
    pub grace_period: Duration,
    pub result_ttl: Duration,
}

impl PoolConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            keys: KeySpace::new(config.redis.key_prefix.clone()),
            heartbeat_ttl: config.heartbeat_ttl(),
            grace_period: config.grace_period(),
            result_ttl: Duration::from_secs(config.commands.result_ttl_secs),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Outcome of a heartbeat renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// Whether the node is in the active set after the heartbeat
    pub admitted: bool,
}

/// A command moved into the processing list and not yet acknowledged
#[derive(Debug, Clone)]
pub struct DequeuedCommand {
    pub command: Command,
    raw: String,
}

/// Node membership and command queues over a `CoordinationStore`
#[derive(Clone)]
pub struct NodePool {
    store: Arc<dyn CoordinationStore>,
    config: PoolConfig,
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

impl NodePool {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, config: PoolConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn keys(&self) -> &KeySpace {
        &self.config.keys
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add a node to the registry and initialise its status hash.
    ///
    /// Idempotent: re-registration overwrites metadata and keeps the
    /// original `registered_at`.
    pub async fn register(&self, node_id: &str, metadata: &NodeMetadata) -> Result<()> {
        let keys = &self.config.keys;
        let status_key = keys.status(node_id);
        let now = timestamp();

        self.store.set_add(&keys.all_nodes(), node_id).await?;
        self.store
            .hash_set_if_absent(&status_key, "registered_at", &now)
            .await?;

        let mut fields = vec![
            ("data_center".to_string(), metadata.data_center.clone()),
            ("status".to_string(), "registered".to_string()),
            (LAST_SEEN_FIELD.to_string(), now),
        ];
        if let Some(port) = metadata.node_port {
            fields.push(("node_port".to_string(), port.to_string()));
        }
        self.store.hash_set(&status_key, &fields).await?;

        if let Some(ip) = &metadata.ip_address {
            self.register_ip(node_id, ip).await?;
        }

        tracing::info!(
            node_id = %node_id,
            data_center = %metadata.data_center,
            "Node registered"
        );
        Ok(())
    }

    /// Renew the heartbeat and refresh the durable status.
    ///
    /// The node is (re-)admitted to the active set unless it is frozen; the
    /// frozen check and the add run as one guarded store operation so a
    /// concurrent freeze cannot be overridden.
    pub async fn heartbeat(&self, node_id: &str, metrics: &NodeMetrics) -> Result<HeartbeatOutcome> {
        let keys = &self.config.keys;
        let status_key = keys.status(node_id);
        let data_center = self
            .store
            .hash_get(&status_key, "data_center")
            .await?
            .unwrap_or_default();

        let record = Heartbeat {
            node_id: node_id.to_string(),
            data_center,
            timestamp: Utc::now(),
            metrics: metrics.clone(),
        };
        let payload = serde_json::to_string(&record)?;
        self.store
            .set_with_ttl(&keys.heartbeat(node_id), &payload, self.config.heartbeat_ttl)
            .await?;

        let now = record.timestamp.to_rfc3339();
        let mut fields = metrics.status_fields();
        fields.push(("last_heartbeat".to_string(), now.clone()));
        fields.push((LAST_SEEN_FIELD.to_string(), now));
        self.store.hash_set(&status_key, &fields).await?;

        // A node reaped while partitioned rejoins the registry here
        self.store.set_add(&keys.all_nodes(), node_id).await?;

        let admitted = self
            .store
            .set_add_guarded(
                &keys.active_nodes(),
                node_id,
                &[Guard::NotMember {
                    set: keys.frozen_nodes(),
                    member: node_id.to_string(),
                }],
            )
            .await?;

        tracing::debug!(
            node_id = %node_id,
            cpu = metrics.cpu_percent,
            memory = metrics.memory_percent,
            admitted = admitted,
            "Heartbeat renewed"
        );
        Ok(HeartbeatOutcome { admitted })
    }

    /// Take a node out of the active set and record why.
    ///
    /// Registry membership and the heartbeat are left alone.
    pub async fn freeze(&self, node_id: &str, reason: &str) -> Result<()> {
        let keys = &self.config.keys;
        self.store.set_add(&keys.frozen_nodes(), node_id).await?;
        self.store.set_remove(&keys.active_nodes(), node_id).await?;
        self.store
            .hash_set(
                &keys.status(node_id),
                &[
                    ("frozen".to_string(), "true".to_string()),
                    ("freeze_reason".to_string(), reason.to_string()),
                    ("status".to_string(), "frozen".to_string()),
                    ("frozen_at".to_string(), timestamp()),
                ],
            )
            .await?;

        tracing::info!(node_id = %node_id, reason = %reason, "Node frozen");
        Ok(())
    }

    /// Clear the freeze and re-admit the node if its heartbeat is live.
    ///
    /// Returns whether the node was placed back into the active set. A dead
    /// node is unfrozen but stays out of the active set until it heartbeats.
    pub async fn unfreeze(&self, node_id: &str) -> Result<bool> {
        let keys = &self.config.keys;
        let status_key = keys.status(node_id);

        self.store.set_remove(&keys.frozen_nodes(), node_id).await?;
        self.store.hash_delete(&status_key, "freeze_reason").await?;
        self.store.hash_delete(&status_key, "frozen_at").await?;

        let admitted = self
            .store
            .set_add_guarded(
                &keys.active_nodes(),
                node_id,
                &[
                    Guard::KeyExists(keys.heartbeat(node_id)),
                    Guard::NotMember {
                        set: keys.frozen_nodes(),
                        member: node_id.to_string(),
                    },
                ],
            )
            .await?;

        let status = if admitted { "active" } else { "unfrozen" };
        self.store
            .hash_set(
                &status_key,
                &[
                    ("frozen".to_string(), "false".to_string()),
                    ("status".to_string(), status.to_string()),
                ],
            )
            .await?;

        tracing::info!(node_id = %node_id, admitted = admitted, "Node unfrozen");
        Ok(admitted)
    }

    pub async fn is_frozen(&self, node_id: &str) -> Result<bool> {
        self.store
            .set_contains(&self.config.keys.frozen_nodes(), node_id)
            .await
    }

    /// Routable nodes, sorted.
    ///
    /// Members whose heartbeat has expired are dropped from the result and
    /// removed from the active set, guarded on the heartbeat still being
    /// absent.
    pub async fn get_active_nodes(&self) -> Result<Vec<String>> {
        let keys = &self.config.keys;
        let active_key = keys.active_nodes();
        let mut live = Vec::new();

        for node_id in self.store.set_members(&active_key).await? {
            let hb_key = keys.heartbeat(&node_id);
            if self.store.exists(&hb_key).await? {
                live.push(node_id);
                continue;
            }
            let removed = self
                .store
                .delete_guarded(
                    &[Guard::KeyAbsent(hb_key)],
                    &[],
                    &[Removal::SetMember {
                        set: active_key.clone(),
                        member: node_id.clone(),
                    }],
                )
                .await?;
            if removed {
                tracing::debug!(node_id = %node_id, "Dropped expired node from active set");
            }
        }

        live.sort();
        Ok(live)
    }

    /// Every registered node, sorted
    pub async fn get_all_nodes(&self) -> Result<Vec<String>> {
        let mut nodes = self.store.set_members(&self.config.keys.all_nodes()).await?;
        nodes.sort();
        Ok(nodes)
    }

    pub async fn nodes_in_data_center(&self, data_center: &str) -> Result<Vec<String>> {
        let nodes = self.get_all_nodes().await?;
        self.filter_data_center(nodes, data_center).await
    }

    pub async fn active_nodes_in_data_center(&self, data_center: &str) -> Result<Vec<String>> {
        let nodes = self.get_active_nodes().await?;
        self.filter_data_center(nodes, data_center).await
    }

    async fn filter_data_center(&self, nodes: Vec<String>, data_center: &str) -> Result<Vec<String>> {
        let mut matching = Vec::with_capacity(nodes.len());
        for node_id in nodes {
            let dc = self
                .store
                .hash_get(&self.config.keys.status(&node_id), "data_center")
                .await?;
            if dc.as_deref() == Some(data_center) {
                matching.push(node_id);
            }
        }
        Ok(matching)
    }

    /// Merged status of one node, `None` if the node is unknown
    pub async fn get_node_status(&self, node_id: &str) -> Result<Option<NodeState>> {
        let keys = &self.config.keys;
        let registered = self.store.set_contains(&keys.all_nodes(), node_id).await?;
        let status = self.store.hash_get_all(&keys.status(node_id)).await?;
        let raw_heartbeat = self.store.get(&keys.heartbeat(node_id)).await?;

        if !registered && status.is_empty() && raw_heartbeat.is_none() {
            return Ok(None);
        }

        let heartbeat_live = raw_heartbeat.is_some();
        let heartbeat = raw_heartbeat.and_then(|raw| {
            serde_json::from_str::<Heartbeat>(&raw)
                .map_err(|e| {
                    tracing::warn!(node_id = %node_id, error = %e, "Malformed heartbeat record");
                })
                .ok()
        });
        let frozen = self.is_frozen(node_id).await?;
        let lifecycle = NodeLifecycle::derive(heartbeat_live, frozen);

        let data_center = status
            .get("data_center")
            .cloned()
            .or_else(|| heartbeat.as_ref().map(|hb| hb.data_center.clone()))
            .unwrap_or_default();
        let freeze_reason = if frozen {
            status.get("freeze_reason").cloned()
        } else {
            None
        };
        let registered_at = status.get("registered_at").and_then(|ts| parse_timestamp(ts));

        Ok(Some(NodeState {
            node_id: node_id.to_string(),
            data_center,
            registered_at,
            lifecycle,
            heartbeat,
            freeze_reason,
            pending_commands: self.store.list_len(&keys.commands(node_id)).await?,
            in_flight_commands: self.store.list_len(&keys.processing(node_id)).await?,
            ip_address: self.get_node_ip(node_id).await?,
            status,
        }))
    }

    /// Record an operator-visible status string plus extra fields
    pub async fn update_status(
        &self,
        node_id: &str,
        status: &str,
        details: &HashMap<String, String>,
    ) -> Result<()> {
        let mut fields: Vec<(String, String)> = details
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push(("status".to_string(), status.to_string()));
        fields.push(("status_updated_at".to_string(), timestamp()));
        self.store
            .hash_set(&self.config.keys.status(node_id), &fields)
            .await
    }

    pub async fn register_ip(&self, node_id: &str, ip: &str) -> Result<()> {
        self.store
            .hash_set(
                &self.config.keys.node_ips(),
                &[(node_id.to_string(), ip.to_string())],
            )
            .await?;
        tracing::debug!(node_id = %node_id, ip = %ip, "Registered node address");
        Ok(())
    }

    pub async fn get_node_ip(&self, node_id: &str) -> Result<Option<String>> {
        self.store
            .hash_get(&self.config.keys.node_ips(), node_id)
            .await
    }

    /// Erase nodes whose heartbeat expired more than the grace period ago,
    /// that is nodes silent for `heartbeat_ttl + grace_period` since their
    /// last `last_seen`. Returns the removed ids.
    ///
    /// Each deletion is guarded on the heartbeat still being absent and
    /// `last_seen` being unchanged since the scan, so a node that comes back
    /// mid-cleanup keeps its keys. Running it twice, or from several
    /// controllers at once, is safe.
    pub async fn cleanup_dead_nodes(&self) -> Result<Vec<String>> {
        let keys = &self.config.keys;
        // The heartbeat key lapses heartbeat_ttl after last_seen
        let grace = chrono::Duration::from_std(self.config.heartbeat_ttl + self.config.grace_period)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut removed = Vec::new();

        for node_id in self.get_all_nodes().await? {
            let hb_key = keys.heartbeat(&node_id);
            if self.store.exists(&hb_key).await? {
                continue;
            }

            let status_key = keys.status(&node_id);
            let last_seen = self.store.hash_get(&status_key, LAST_SEEN_FIELD).await?;
            if let Some(seen) = last_seen.as_deref().and_then(parse_timestamp) {
                if now.signed_duration_since(seen) < grace {
                    continue;
                }
            }

            let guards = [
                Guard::KeyAbsent(hb_key),
                Guard::FieldEquals {
                    hash: status_key.clone(),
                    field: LAST_SEEN_FIELD.to_string(),
                    value: last_seen,
                },
            ];
            let doomed = [
                status_key,
                keys.commands(&node_id),
                keys.processing(&node_id),
            ];
            let removals = [
                Removal::SetMember {
                    set: keys.all_nodes(),
                    member: node_id.clone(),
                },
                Removal::SetMember {
                    set: keys.active_nodes(),
                    member: node_id.clone(),
                },
                Removal::SetMember {
                    set: keys.frozen_nodes(),
                    member: node_id.clone(),
                },
                Removal::HashField {
                    hash: keys.node_ips(),
                    field: node_id.clone(),
                },
            ];

            if self.store.delete_guarded(&guards, &doomed, &removals).await? {
                tracing::info!(node_id = %node_id, "Removed dead node");
                removed.push(node_id);
            } else {
                tracing::debug!(node_id = %node_id, "Node changed during cleanup, skipped");
            }
        }

        Ok(removed)
    }

    // Command queue

    /// Append a command to the node's queue, returns the queue length
    pub async fn enqueue_command(&self, node_id: &str, command: &Command) -> Result<usize> {
        let payload = serde_json::to_string(command)?;
        self.store
            .list_push(&self.config.keys.commands(node_id), &payload)
            .await
    }

    /// Move the oldest pending command into the processing list.
    ///
    /// Payloads that do not parse are dropped with a warning.
    pub async fn dequeue_command(&self, node_id: &str) -> Result<Option<DequeuedCommand>> {
        let keys = &self.config.keys;
        let queue = keys.commands(node_id);
        let processing = keys.processing(node_id);

        loop {
            let Some(raw) = self
                .store
                .list_move(&queue, &processing, ListEnd::Head, ListEnd::Tail)
                .await?
            else {
                return Ok(None);
            };

            match serde_json::from_str::<Command>(&raw) {
                Ok(command) => return Ok(Some(DequeuedCommand { command, raw })),
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Dropping malformed command");
                    self.store.list_remove(&processing, &raw).await?;
                }
            }
        }
    }

    /// Remove a handled command from the processing list
    pub async fn ack_command(&self, node_id: &str, delivery: &DequeuedCommand) -> Result<bool> {
        self.store
            .list_remove(&self.config.keys.processing(node_id), &delivery.raw)
            .await
    }

    /// Put unacknowledged commands back at the front of the queue, oldest
    /// first. Returns how many were requeued.
    pub async fn requeue_in_flight(&self, node_id: &str) -> Result<usize> {
        let keys = &self.config.keys;
        let queue = keys.commands(node_id);
        let processing = keys.processing(node_id);
        let mut requeued = 0;

        while self
            .store
            .list_move(&processing, &queue, ListEnd::Tail, ListEnd::Head)
            .await?
            .is_some()
        {
            requeued += 1;
        }

        if requeued > 0 {
            tracing::info!(node_id = %node_id, count = requeued, "Requeued in-flight commands");
        }
        Ok(requeued)
    }

    /// Publish a result under its command id and note it on the node status
    pub async fn store_result(&self, result: &CommandResult) -> Result<()> {
        let keys = &self.config.keys;
        let payload = serde_json::to_string(result)?;
        self.store
            .set_with_ttl(
                &keys.command_result(&result.command_id),
                &payload,
                self.config.result_ttl,
            )
            .await?;

        let status = serde_json::to_value(result.status)?;
        self.store
            .hash_set(
                &keys.status(&result.node_id),
                &[
                    ("last_command".to_string(), result.command_type.clone()),
                    (
                        "last_command_status".to_string(),
                        status.as_str().unwrap_or_default().to_string(),
                    ),
                ],
            )
            .await
    }

    pub async fn command_result(&self, command_id: &str) -> Result<Option<CommandResult>> {
        let raw = self
            .store
            .get(&self.config.keys.command_result(command_id))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
