//! Node and command records shared by the pool, the agent and the dispatcher

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Length of generated command ids
const COMMAND_ID_LEN: usize = 16;

/// Observed lifecycle of a node
///
/// Never persisted. Computed from heartbeat liveness and frozen-set
/// membership each time a node is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeLifecycle {
    Active,
    Frozen,
    Dead,
}

impl NodeLifecycle {
    #[must_use]
    pub const fn derive(heartbeat_live: bool, frozen: bool) -> Self {
        match (heartbeat_live, frozen) {
            (false, _) => Self::Dead,
            (true, true) => Self::Frozen,
            (true, false) => Self::Active,
        }
    }
}

impl std::fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Frozen => write!(f, "FROZEN"),
            Self::Dead => write!(f, "DEAD"),
        }
    }
}

/// Metrics snapshot reported with every heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f32>,
    /// Health check name to result
    #[serde(default)]
    pub health: BTreeMap<String, bool>,
}

impl NodeMetrics {
    /// Flatten into status hash fields
    #[must_use]
    pub fn status_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("cpu_percent".to_string(), format!("{:.1}", self.cpu_percent)),
            (
                "memory_percent".to_string(),
                format!("{:.1}", self.memory_percent),
            ),
        ];
        if let Some(disk) = self.disk_percent {
            fields.push(("disk_percent".to_string(), format!("{disk:.1}")));
        }
        for (name, healthy) in &self.health {
            fields.push((format!("health.{name}"), healthy.to_string()));
        }
        fields
    }

    /// Names of failing health checks, sorted by name
    #[must_use]
    pub fn failing_checks(&self) -> Vec<&str> {
        self.health
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Ephemeral liveness record stored under the TTL key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    #[serde(default)]
    pub data_center: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: NodeMetrics,
}

/// Registration metadata supplied by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub data_center: String,
    pub ip_address: Option<String>,
    pub node_port: Option<u16>,
}

impl NodeMetadata {
    #[must_use]
    pub fn new(data_center: impl Into<String>) -> Self {
        Self {
            data_center: data_center.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.node_port = Some(port);
        self
    }
}

/// Merged view of one node as reported by `NodePool::get_node_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub data_center: String,
    pub registered_at: Option<DateTime<Utc>>,
    pub lifecycle: NodeLifecycle,
    pub heartbeat: Option<Heartbeat>,
    pub freeze_reason: Option<String>,
    pub status: HashMap<String, String>,
    pub pending_commands: usize,
    pub in_flight_commands: usize,
    pub ip_address: Option<String>,
}

impl NodeState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle == NodeLifecycle::Active
    }
}

/// Administrative instruction queued for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl Command {
    #[must_use]
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_id: nanoid::nanoid!(COMMAND_ID_LEN),
            command_type: command_type.into(),
            payload: Map::new(),
            enqueued_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// String payload parameter
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Outcome class of an executed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
    /// Rejected by the exec allow-list; nothing ran
    Denied,
    /// No handler registered for the command type
    Unsupported,
}

/// Result written back by the agent under the command id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    #[must_use]
    pub fn new(command: &Command, node_id: &str, status: CommandStatus) -> Self {
        Self {
            command_id: command.command_id.clone(),
            node_id: node_id.to_string(),
            command_type: command.command_type.clone(),
            status,
            output: Map::new(),
            error: None,
            completed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: Map<String, Value>) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Succeeded
    }
}
