use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix (`NODEFLEET__HEARTBEAT__TTL_SECS`, etc.)
pub const ENV_PREFIX: &str = "NODEFLEET";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub node: NodeConfig,
    pub heartbeat: HeartbeatConfig,
    pub commands: CommandsConfig,
    pub cleanup: CleanupConfig,
    pub dispatcher: DispatcherConfig,
    pub events: EventsConfig,
    pub startup: StartupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub operation_timeout_secs: u64,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            operation_timeout_secs: 5,
            key_prefix: "nodefleet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cluster-wide unique node identifier, defaults to the hostname
    pub node_id: String,
    pub data_center: String,
    /// Port the application listens on, announced to load balancers
    pub node_port: u16,
    /// Working directory for `exec` and `deploy_file` commands
    pub app_dir: String,
    /// Address to self-register; auto-detected when unset
    pub advertise_ip: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let node_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            node_id,
            data_center: "default".to_string(),
            node_port: 8000,
            app_dir: "/opt/app".to_string(),
            advertise_ip: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub ttl_secs: u64,
    /// CPU usage percentage above which the node freezes itself
    pub cpu_threshold: f32,
    /// Memory usage percentage above which the node freezes itself
    pub memory_threshold: f32,
    /// A health check still running after this long counts as failed
    pub check_timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            ttl_secs: 30,
            cpu_threshold: 90.0,
            memory_threshold: 85.0,
            check_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub poll_interval_secs: u64,
    /// Maximum commands drained per poll tick
    pub batch_size: usize,
    /// Executables the built-in `exec` command may run (exact or prefix match)
    pub allowed_exec_prefixes: Vec<String>,
    pub exec_timeout_secs: u64,
    pub result_ttl_secs: u64,
    /// How long shutdown waits for an in-flight handler before abandoning it
    pub shutdown_grace_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 10,
            allowed_exec_prefixes: ["docker", "systemctl", "ls", "cat", "grep", "ps", "netstat"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            exec_timeout_secs: 30,
            result_ttl_secs: 3600,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Time a node's heartbeat must have been expired before it is reaped
    pub grace_period_secs: u64,
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 60,
            interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub result_poll_interval_ms: u64,
    pub rolling_update_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            result_poll_interval_ms: 250,
            rolling_update_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Channel name below the key prefix
    pub channel: String,
    /// Upstream watcher reconciliation period
    pub reconcile_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel: "lb_events".to_string(),
            reconcile_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            min_delay_ms: 500,
            max_delay_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Double underscore keeps snake_case field names intact
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("commands.allowed_exec_prefixes")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check invariants that serde cannot express.
    ///
    /// Returns every violation found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.redis.url.is_empty() {
            errors.push("redis.url cannot be empty".to_string());
        }
        if self.redis.key_prefix.is_empty() {
            errors.push("redis.key_prefix cannot be empty".to_string());
        }
        if self.redis.operation_timeout_secs == 0 {
            errors.push("redis.operation_timeout_secs must be positive".to_string());
        }
        if self.node.node_id.is_empty() {
            errors.push("node.node_id cannot be empty".to_string());
        }
        if self.heartbeat.interval_secs == 0 {
            errors.push("heartbeat.interval_secs must be positive".to_string());
        }
        if self.heartbeat.ttl_secs == 0 {
            errors.push("heartbeat.ttl_secs must be positive".to_string());
        } else if self.heartbeat.ttl_secs <= self.heartbeat.interval_secs {
            errors.push(format!(
                "heartbeat.ttl_secs ({}) must exceed heartbeat.interval_secs ({})",
                self.heartbeat.ttl_secs, self.heartbeat.interval_secs
            ));
        }
        if !(0.0..=100.0).contains(&self.heartbeat.cpu_threshold) {
            errors.push("heartbeat.cpu_threshold must be between 0 and 100".to_string());
        }
        if !(0.0..=100.0).contains(&self.heartbeat.memory_threshold) {
            errors.push("heartbeat.memory_threshold must be between 0 and 100".to_string());
        }
        if self.heartbeat.check_timeout_secs == 0 {
            errors.push("heartbeat.check_timeout_secs must be positive".to_string());
        }
        if self.commands.poll_interval_secs == 0 {
            errors.push("commands.poll_interval_secs must be positive".to_string());
        }
        if self.commands.batch_size == 0 {
            errors.push("commands.batch_size must be positive".to_string());
        }
        if self.cleanup.interval_secs == 0 {
            errors.push("cleanup.interval_secs must be positive".to_string());
        }
        if self.dispatcher.result_poll_interval_ms == 0 {
            errors.push("dispatcher.result_poll_interval_ms must be positive".to_string());
        }
        if self.events.channel.is_empty() {
            errors.push("events.channel cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    #[must_use]
    pub const fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat.ttl_secs)
    }

    #[must_use]
    pub const fn redis_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.redis.operation_timeout_secs)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.cleanup.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert!(!config.node.node_id.is_empty());
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(30));
        assert_eq!(config.redis.key_prefix, "nodefleet");
        assert!(config
            .commands
            .allowed_exec_prefixes
            .contains(&"docker".to_string()));
    }

    #[test]
    fn test_validate_reports_every_error() {
        let mut config = Config::default();
        config.node.node_id = String::new();
        config.heartbeat.ttl_secs = 5;
        config.heartbeat.interval_secs = 10;
        config.heartbeat.cpu_threshold = 120.0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("node_id")));
        assert!(errors.iter().any(|e| e.contains("must exceed")));
        assert!(errors.iter().any(|e| e.contains("cpu_threshold")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodefleet.toml");
        std::fs::write(
            &path,
            r#"
[node]
node_id = "web-01"
data_center = "us-east-1"

[heartbeat]
ttl_secs = 45
"#,
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.node.node_id, "web-01");
        assert_eq!(config.node.data_center, "us-east-1");
        assert_eq!(config.heartbeat.ttl_secs, 45);
        // Untouched sections keep their defaults
        assert_eq!(config.heartbeat.interval_secs, 10);
        assert_eq!(config.commands.poll_interval_secs, 5);
    }
}
