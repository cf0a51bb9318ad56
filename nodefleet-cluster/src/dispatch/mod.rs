//! Controller-side command dispatch
//!
//! Enqueues commands into node queues and collects results. Nothing here is
//! atomic across nodes: a broadcast that reaches some nodes and not others
//! is a normal outcome and is reported, not raised.

use std::time::Duration;

use nodefleet_core::Config;
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};

use crate::error::Result;
use crate::pool::{Command, CommandResult, CommandStatus, NodePool};

/// Command type sent to each node by `rolling_update`
pub const UPDATE_COMMAND: &str = "update";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub result_poll_interval: Duration,
    pub rolling_update_timeout: Duration,
}

impl DispatcherConfig {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            result_poll_interval: Duration::from_millis(config.dispatcher.result_poll_interval_ms),
            rolling_update_timeout: Duration::from_secs(
                config.dispatcher.rolling_update_timeout_secs,
            ),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Command type and parameters; every send mints a fresh command id
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command_type: String,
    pub payload: Map<String, Value>,
}

impl CommandRequest {
    #[must_use]
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    fn to_command(&self) -> Command {
        Command::new(self.command_type.clone()).with_payload(self.payload.clone())
    }
}

/// Result of `send_command_and_wait`
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(CommandResult),
    /// No result within the timeout; the command may still run later
    NoResult { command_id: String },
}

impl DispatchOutcome {
    #[must_use]
    pub fn command_id(&self) -> &str {
        match self {
            Self::Completed(result) => &result.command_id,
            Self::NoResult { command_id } => command_id,
        }
    }

    #[must_use]
    pub const fn result(&self) -> Option<&CommandResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::NoResult { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    /// Node id to command id
    pub sent: Vec<(String, String)>,
    /// Node id to error message
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollingStep {
    Completed(CommandResult),
    NoResult { command_id: String },
    SendFailed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollingUpdateReport {
    /// Per node, in rollout order
    pub steps: Vec<(String, RollingStep)>,
    /// Node whose failure stopped the rollout
    pub halted_at: Option<String>,
    /// Nodes never reached because of a halt
    pub skipped: Vec<String>,
}

impl RollingUpdateReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.halted_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    pool: NodePool,
    config: DispatcherConfig,
}

impl CommandDispatcher {
    #[must_use]
    pub const fn new(pool: NodePool, config: DispatcherConfig) -> Self {
        Self { pool, config }
    }

    /// Append a command to one node's queue and return its id.
    ///
    /// Unknown node ids are accepted; the command waits for a node that may
    /// never arrive, and a caller waiting on it gets `NoResult`.
    pub async fn send_command(&self, node_id: &str, request: &CommandRequest) -> Result<String> {
        if self.pool.get_node_status(node_id).await?.is_none() {
            tracing::warn!(node_id = %node_id, "Sending command to an unregistered node");
        }
        let command = request.to_command();
        let depth = self.pool.enqueue_command(node_id, &command).await?;
        tracing::info!(
            node_id = %node_id,
            command_id = %command.command_id,
            command_type = %command.command_type,
            queue_depth = depth,
            "Command enqueued"
        );
        Ok(command.command_id)
    }

    pub async fn get_result(&self, command_id: &str) -> Result<Option<CommandResult>> {
        self.pool.command_result(command_id).await
    }

    /// Send, then poll for the result until `wait` elapses
    pub async fn send_command_and_wait(
        &self,
        node_id: &str,
        request: &CommandRequest,
        wait: Duration,
    ) -> Result<DispatchOutcome> {
        let command_id = self.send_command(node_id, request).await?;
        self.wait_for_result(command_id, wait).await
    }

    async fn wait_for_result(&self, command_id: String, wait: Duration) -> Result<DispatchOutcome> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(result) = self.get_result(&command_id).await? {
                return Ok(DispatchOutcome::Completed(result));
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(command_id = %command_id, "No result before timeout");
                return Ok(DispatchOutcome::NoResult { command_id });
            }
            sleep(self.config.result_poll_interval.min(deadline - now)).await;
        }
    }

    /// Send the same request to each node independently
    pub async fn broadcast(&self, node_ids: &[String], request: &CommandRequest) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for node_id in node_ids {
            match self.send_command(node_id, request).await {
                Ok(command_id) => report.sent.push((node_id.clone(), command_id)),
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Broadcast delivery failed");
                    report.failed.push((node_id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Broadcast to every registered node of one data center
    pub async fn broadcast_to_data_center(
        &self,
        data_center: &str,
        request: &CommandRequest,
    ) -> Result<BroadcastReport> {
        let nodes = self.pool.nodes_in_data_center(data_center).await?;
        Ok(self.broadcast(&nodes, request).await)
    }

    /// Update the active nodes of a data center one at a time.
    ///
    /// Each node gets an `update` command and up to the rolling update
    /// timeout to report. A failed result stops the rollout; a missing
    /// result is recorded and the rollout moves on.
    pub async fn rolling_update(
        &self,
        data_center: &str,
        per_node_delay: Duration,
    ) -> Result<RollingUpdateReport> {
        let nodes = self.pool.active_nodes_in_data_center(data_center).await?;
        let request = CommandRequest::new(UPDATE_COMMAND);
        let mut report = RollingUpdateReport::default();

        tracing::info!(data_center = %data_center, nodes = nodes.len(), "Starting rolling update");

        for (idx, node_id) in nodes.iter().enumerate() {
            if idx > 0 && !per_node_delay.is_zero() {
                sleep(per_node_delay).await;
            }

            let step = match self
                .send_command_and_wait(node_id, &request, self.config.rolling_update_timeout)
                .await
            {
                Ok(DispatchOutcome::Completed(result)) => RollingStep::Completed(result),
                Ok(DispatchOutcome::NoResult { command_id }) => {
                    tracing::warn!(node_id = %node_id, command_id = %command_id, "Update gave no result, continuing");
                    RollingStep::NoResult { command_id }
                }
                Err(e) => RollingStep::SendFailed {
                    error: e.to_string(),
                },
            };

            let halt = matches!(
                &step,
                RollingStep::Completed(result) if result.status != CommandStatus::Succeeded
            ) || matches!(step, RollingStep::SendFailed { .. });
            report.steps.push((node_id.clone(), step));

            if halt {
                tracing::error!(node_id = %node_id, "Rolling update halted");
                report.halted_at = Some(node_id.clone());
                report.skipped = nodes[idx + 1..].to_vec();
                break;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{NodeMetadata, PoolConfig};
    use crate::store::{CoordinationStore, MemoryStore};
    use std::sync::Arc;

    fn dispatcher() -> (NodePool, CommandDispatcher) {
        let pool = NodePool::new(Arc::new(MemoryStore::new()), PoolConfig::default());
        let config = DispatcherConfig {
            result_poll_interval: Duration::from_millis(10),
            rolling_update_timeout: Duration::from_millis(50),
        };
        (pool.clone(), CommandDispatcher::new(pool, config))
    }

    #[tokio::test]
    async fn test_unknown_node_is_enqueued_and_times_out() {
        let (pool, dispatcher) = dispatcher();
        let outcome = dispatcher
            .send_command_and_wait("ghost", &CommandRequest::new("exec"), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::NoResult { .. }));
        assert!(pool.dequeue_command("ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_broadcast_reports_partial_delivery() {
        let (pool, dispatcher) = dispatcher();
        pool.register("n1", &NodeMetadata::new("dc1")).await.unwrap();
        // A queue key holding the wrong type makes the push fail
        CoordinationStore::set_with_ttl(
            pool.store().as_ref(),
            &pool.keys().commands("broken"),
            "x",
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let report = dispatcher
            .broadcast(
                &["n1".into(), "ghost".into(), "broken".into()],
                &CommandRequest::new("status"),
            )
            .await;
        let sent: Vec<&str> = report.sent.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(sent, vec!["n1", "ghost"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(pool.get_node_status("n1").await.unwrap().unwrap().pending_commands, 1);
    }

    #[tokio::test]
    async fn test_wait_returns_no_result_on_timeout() {
        let (pool, dispatcher) = dispatcher();
        pool.register("n1", &NodeMetadata::new("dc1")).await.unwrap();

        let outcome = dispatcher
            .send_command_and_wait("n1", &CommandRequest::new("status"), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::NoResult { .. }));
        assert!(outcome.result().is_none());
    }
}
