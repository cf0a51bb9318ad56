//! Per-node runtime
//!
//! Registers the node, then runs two independent duty cycles until
//! cancelled: a heartbeat cycle (metrics, health checks, self-freeze) and a
//! command cycle (reliable dequeue, dispatch, result, acknowledge). A slow
//! command handler never delays a heartbeat.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use nodefleet_core::resilience::{retry_with_backoff, RetryPolicy};
use nodefleet_core::Config;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::builtins::{deploy_file, ExecPolicy};
use super::handlers::{CommandHandler, CommandPlugin, HandlerRegistry};
use super::health::{run_checks, HealthCheck};
use super::metrics::{threshold_breaches, MetricsProbe, SysinfoProbe};
use crate::discovery::detect_local_ip;
use crate::error::{Error, Result};
use crate::events::{EventBus, LifecycleEvent, LifecycleEventKind};
use crate::pool::{
    Command, CommandResult, CommandStatus, HeartbeatOutcome, NodeMetadata, NodeMetrics, NodePool,
};

/// Agent settings, lifted out of the global configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub data_center: String,
    pub node_port: u16,
    pub app_dir: PathBuf,
    /// Registered address; auto-detected when unset
    pub advertise_ip: Option<String>,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    /// Per health check time limit
    pub check_timeout: Duration,
    pub allowed_exec_prefixes: Vec<String>,
    pub exec_timeout: Duration,
    /// How long an in-flight handler may run after shutdown is requested
    pub shutdown_grace: Duration,
    pub startup_retry: RetryPolicy,
    pub events_channel: String,
}

impl AgentConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: config.node.node_id.clone(),
            data_center: config.node.data_center.clone(),
            node_port: config.node.node_port,
            app_dir: PathBuf::from(&config.node.app_dir),
            advertise_ip: config.node.advertise_ip.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            poll_interval: Duration::from_secs(config.commands.poll_interval_secs),
            batch_size: config.commands.batch_size,
            cpu_threshold: config.heartbeat.cpu_threshold,
            memory_threshold: config.heartbeat.memory_threshold,
            check_timeout: Duration::from_secs(config.heartbeat.check_timeout_secs),
            allowed_exec_prefixes: config.commands.allowed_exec_prefixes.clone(),
            exec_timeout: Duration::from_secs(config.commands.exec_timeout_secs),
            shutdown_grace: Duration::from_secs(config.commands.shutdown_grace_secs),
            startup_retry: RetryPolicy::from(&config.startup),
            events_channel: config.events.channel.clone(),
        }
    }
}

/// What one heartbeat cycle did
#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub outcome: HeartbeatOutcome,
    /// Failed checks and breached thresholds, empty when healthy
    pub failures: Vec<String>,
    /// Whether this cycle froze the node
    pub froze: bool,
}

pub struct NodeAgentBuilder {
    pool: NodePool,
    config: AgentConfig,
    checks: Vec<Arc<dyn HealthCheck>>,
    handlers: Vec<(String, Arc<dyn CommandHandler>)>,
    plugins: Vec<Arc<dyn CommandPlugin>>,
    probe: Option<Box<dyn MetricsProbe>>,
}

impl NodeAgentBuilder {
    #[must_use]
    pub fn new(pool: NodePool, config: AgentConfig) -> Self {
        Self {
            pool,
            config,
            checks: Vec::new(),
            handlers: Vec::new(),
            plugins: Vec::new(),
            probe: None,
        }
    }

    /// Checks run in the order they are added
    #[must_use]
    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn handler(mut self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.push((command_type.into(), handler));
        self
    }

    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn CommandPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    #[must_use]
    pub fn metrics_probe(mut self, probe: Box<dyn MetricsProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Fails with `Error::Configuration` when a handler or plugin claims a
    /// built-in or duplicate command type
    pub fn build(self) -> Result<NodeAgent> {
        let mut registry = HandlerRegistry::new();
        for (command_type, handler) in self.handlers {
            registry.register(command_type, handler)?;
        }
        for plugin in &self.plugins {
            registry.register_plugin(plugin.as_ref())?;
        }

        let bus = EventBus::for_pool(&self.pool, &self.config.events_channel);
        let exec = ExecPolicy::new(
            self.config.allowed_exec_prefixes.clone(),
            self.config.app_dir.clone(),
            self.config.exec_timeout,
        );
        let probe = self
            .probe
            .unwrap_or_else(|| Box::new(SysinfoProbe::new()));

        Ok(NodeAgent {
            inner: Arc::new(AgentInner {
                pool: self.pool,
                bus,
                config: self.config,
                checks: self.checks,
                handlers: registry,
                exec,
                probe: Mutex::new(probe),
                frozen: AtomicBool::new(false),
                transition: tokio::sync::Mutex::new(()),
                cancel_token: CancellationToken::new(),
            }),
        })
    }
}

struct AgentInner {
    pool: NodePool,
    bus: EventBus,
    config: AgentConfig,
    checks: Vec<Arc<dyn HealthCheck>>,
    handlers: HandlerRegistry,
    exec: ExecPolicy,
    probe: Mutex<Box<dyn MetricsProbe>>,
    /// Last known frozen state, refreshed by transitions and heartbeats
    frozen: AtomicBool,
    /// Serializes freeze/unfreeze of this node
    transition: tokio::sync::Mutex<()>,
    cancel_token: CancellationToken,
}

/// Runtime for one node
#[derive(Clone)]
pub struct NodeAgent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("node_id", &self.inner.config.node_id)
            .field("frozen", &self.is_frozen())
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}

/// Running duty cycles of a started agent
pub struct AgentHandle {
    agent: NodeAgent,
    heartbeat: JoinHandle<()>,
    commands: JoinHandle<()>,
}

impl AgentHandle {
    #[must_use]
    pub const fn agent(&self) -> &NodeAgent {
        &self.agent
    }

    /// Stop both cycles and record `status=stopped`.
    ///
    /// Membership is left to heartbeat expiry and the reaper.
    pub async fn shutdown(self) {
        self.agent.shutdown();
        if let Err(e) = self.heartbeat.await {
            tracing::error!(error = %e, "Heartbeat task ended abnormally");
        }
        if let Err(e) = self.commands.await {
            tracing::error!(error = %e, "Command task ended abnormally");
        }

        let inner = &self.agent.inner;
        if let Err(e) = inner
            .pool
            .update_status(&inner.config.node_id, "stopped", &HashMap::new())
            .await
        {
            tracing::warn!(error = %e, "Failed to record stopped status");
        }
        tracing::info!(node_id = %inner.config.node_id, "Node agent stopped");
    }
}

fn output_succeeded(output: &Map<String, Value>) -> bool {
    output.get("success").and_then(Value::as_bool) != Some(false)
}

impl NodeAgent {
    #[must_use]
    pub fn builder(pool: NodePool, config: AgentConfig) -> NodeAgentBuilder {
        NodeAgentBuilder::new(pool, config)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pool(&self) -> &NodePool {
        &self.inner.pool
    }

    /// Register, restore persisted state, send the first heartbeat and
    /// spawn the duty cycles.
    ///
    /// Registration is retried with backoff; when retries run out the
    /// error is returned and nothing is spawned.
    pub async fn start(&self) -> Result<AgentHandle> {
        let config = &self.inner.config;
        retry_with_backoff(
            &config.startup_retry,
            "register node",
            || self.register(),
            Error::is_retryable,
        )
        .await?;

        let pool = &self.inner.pool;
        let frozen = pool.is_frozen(&config.node_id).await?;
        self.inner.frozen.store(frozen, Ordering::SeqCst);
        if frozen {
            tracing::warn!(node_id = %config.node_id, "Starting frozen, waiting for an unfreeze command");
        }
        pool.requeue_in_flight(&config.node_id).await?;

        // The registration snapshot must already count this node as active
        if let Err(e) = self.heartbeat_once().await {
            tracing::error!(node_id = %config.node_id, error = %e, "Initial heartbeat failed");
        }

        self.inner
            .bus
            .publish_snapshot(
                pool,
                LifecycleEvent::new(LifecycleEventKind::NodeRegistered, config.node_id.clone())
                    .with_data_center(config.data_center.clone())
                    .with_port(config.node_port),
            )
            .await;

        let heartbeat = self.spawn_heartbeat_cycle();
        let commands = self.spawn_command_cycle();
        tracing::info!(
            node_id = %config.node_id,
            data_center = %config.data_center,
            frozen = frozen,
            "Node agent started"
        );

        Ok(AgentHandle {
            agent: self.clone(),
            heartbeat,
            commands,
        })
    }

    /// Ask both duty cycles to stop
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    async fn register(&self) -> Result<()> {
        let config = &self.inner.config;
        let ip = match &config.advertise_ip {
            Some(ip) => Some(ip.clone()),
            None => detect_local_ip().await,
        };

        let mut metadata =
            NodeMetadata::new(config.data_center.clone()).with_port(config.node_port);
        if let Some(ip) = ip {
            metadata = metadata.with_ip(ip);
        }
        self.inner.pool.register(&config.node_id, &metadata).await
    }

    fn spawn_heartbeat_cycle(&self) -> JoinHandle<()> {
        let agent = self.clone();
        let cancel_token = self.inner.cancel_token.clone();
        let period = self.inner.config.heartbeat_interval;
        // start() already sent the first heartbeat
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Heartbeat cycle shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        if let Err(e) = agent.heartbeat_once().await {
                            tracing::error!(node_id = %agent.node_id(), error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_command_cycle(&self) -> JoinHandle<()> {
        let agent = self.clone();
        let cancel_token = self.inner.cancel_token.clone();
        let grace = self.inner.config.shutdown_grace;
        let mut timer = interval(self.inner.config.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Command cycle shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        let poll = agent.poll_commands_once();
                        tokio::pin!(poll);
                        tokio::select! {
                            result = &mut poll => {
                                if let Err(e) = result {
                                    tracing::error!(node_id = %agent.node_id(), error = %e, "Command poll failed");
                                }
                            }
                            () = cancel_token.cancelled() => {
                                // The unacknowledged command stays in the processing list
                                if timeout(grace, &mut poll).await.is_err() {
                                    tracing::warn!(
                                        node_id = %agent.node_id(),
                                        "Abandoned in-flight command at shutdown, it will be redelivered"
                                    );
                                }
                                tracing::info!("Command cycle shutting down");
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    /// One heartbeat cycle: sample, check, renew, self-freeze if needed
    pub async fn heartbeat_once(&self) -> Result<HeartbeatReport> {
        let config = &self.inner.config;
        let usage = self.inner.probe.lock().sample();
        let checks = run_checks(&self.inner.checks, self.inner.config.check_timeout).await;

        let mut failures: Vec<String> = checks
            .iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(name, _)| format!("health check '{name}' failed"))
            .collect();
        failures.extend(threshold_breaches(
            &usage,
            config.cpu_threshold,
            config.memory_threshold,
        ));

        let metrics = NodeMetrics {
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            disk_percent: usage.disk_percent,
            health: checks.into_iter().collect(),
        };
        let outcome = self.inner.pool.heartbeat(&config.node_id, &metrics).await?;
        self.inner.frozen.store(!outcome.admitted, Ordering::SeqCst);

        let froze = if outcome.admitted && !failures.is_empty() {
            self.freeze(&failures.join("; ")).await?
        } else {
            false
        };

        Ok(HeartbeatReport {
            outcome,
            failures,
            froze,
        })
    }

    /// Take this node out of rotation. Returns false if it was already frozen.
    pub async fn freeze(&self, reason: &str) -> Result<bool> {
        let inner = &self.inner;
        let node_id = &inner.config.node_id;
        let _transition = inner.transition.lock().await;

        if inner.pool.is_frozen(node_id).await? {
            inner.frozen.store(true, Ordering::SeqCst);
            return Ok(false);
        }
        inner.pool.freeze(node_id, reason).await?;
        inner.frozen.store(true, Ordering::SeqCst);
        tracing::warn!(node_id = %node_id, reason = %reason, "Node froze itself");

        inner
            .bus
            .publish_snapshot(
                &inner.pool,
                LifecycleEvent::new(LifecycleEventKind::NodeFrozen, node_id.clone())
                    .with_reason(reason)
                    .with_data_center(inner.config.data_center.clone())
                    .with_port(inner.config.node_port),
            )
            .await;
        Ok(true)
    }

    /// Return this node to rotation. Returns false if it was not frozen.
    pub async fn unfreeze(&self) -> Result<bool> {
        let inner = &self.inner;
        let node_id = &inner.config.node_id;
        let _transition = inner.transition.lock().await;

        if !inner.pool.is_frozen(node_id).await? {
            inner.frozen.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        let admitted = inner.pool.unfreeze(node_id).await?;
        inner.frozen.store(false, Ordering::SeqCst);
        tracing::info!(node_id = %node_id, admitted = admitted, "Node unfrozen");

        inner
            .bus
            .publish_snapshot(
                &inner.pool,
                LifecycleEvent::new(LifecycleEventKind::NodeUnfrozen, node_id.clone())
                    .with_data_center(inner.config.data_center.clone())
                    .with_port(inner.config.node_port),
            )
            .await;
        Ok(true)
    }

    /// Drain up to `batch_size` commands. Returns how many were handled.
    pub async fn poll_commands_once(&self) -> Result<usize> {
        let inner = &self.inner;
        let node_id = &inner.config.node_id;
        let mut handled = 0;

        while handled < inner.config.batch_size && !inner.cancel_token.is_cancelled() {
            let Some(delivery) = inner.pool.dequeue_command(node_id).await? else {
                break;
            };
            let command = &delivery.command;
            tracing::info!(
                node_id = %node_id,
                command_id = %command.command_id,
                command_type = %command.command_type,
                "Executing command"
            );

            let result = self.execute(command).await;
            tracing::info!(
                command_id = %result.command_id,
                status = ?result.status,
                "Command finished"
            );
            inner.pool.store_result(&result).await?;
            inner.pool.ack_command(node_id, &delivery).await?;
            handled += 1;
        }

        Ok(handled)
    }

    async fn execute(&self, command: &Command) -> CommandResult {
        let node_id = self.node_id();
        let outcome = match command.command_type.as_str() {
            "freeze" => self.handle_freeze(command).await,
            "unfreeze" => self.handle_unfreeze().await,
            "exec" => {
                let line = command.param_str("command").unwrap_or_default();
                if !self.inner.exec.is_allowed(line) {
                    tracing::warn!(
                        command_id = %command.command_id,
                        command = %line,
                        "Rejected exec outside the allow-list"
                    );
                    return CommandResult::new(command, node_id, CommandStatus::Denied)
                        .with_error(format!("'{line}' is not permitted by the exec allow-list"));
                }
                self.inner.exec.run(line).await
            }
            "deploy_file" => self.handle_deploy(command).await,
            "health_check" => self.handle_health_check().await,
            other => {
                let Some(handler) = self.inner.handlers.get(other) else {
                    return CommandResult::new(command, node_id, CommandStatus::Unsupported)
                        .with_error(format!("no handler registered for '{other}'"));
                };
                AssertUnwindSafe(handler.handle(command))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(command_type = %other, "Command handler panicked");
                        Err(anyhow::anyhow!("handler for '{other}' panicked"))
                    })
            }
        };

        match outcome {
            Ok(output) if output_succeeded(&output) => {
                CommandResult::new(command, node_id, CommandStatus::Succeeded).with_output(output)
            }
            Ok(output) => {
                CommandResult::new(command, node_id, CommandStatus::Failed).with_output(output)
            }
            Err(e) => CommandResult::new(command, node_id, CommandStatus::Failed)
                .with_error(format!("{e:#}")),
        }
    }

    async fn handle_freeze(&self, command: &Command) -> anyhow::Result<Map<String, Value>> {
        let reason = command.param_str("reason").unwrap_or("freeze command");
        let changed = self.freeze(reason).await?;
        let mut output = Map::new();
        output.insert("frozen".into(), Value::Bool(true));
        output.insert("changed".into(), Value::Bool(changed));
        Ok(output)
    }

    async fn handle_unfreeze(&self) -> anyhow::Result<Map<String, Value>> {
        let changed = self.unfreeze().await?;
        let mut output = Map::new();
        output.insert("frozen".into(), Value::Bool(false));
        output.insert("changed".into(), Value::Bool(changed));
        Ok(output)
    }

    async fn handle_deploy(&self, command: &Command) -> anyhow::Result<Map<String, Value>> {
        let path = command
            .param_str("path")
            .ok_or_else(|| anyhow::anyhow!("deploy_file requires 'path'"))?;
        let content = command
            .param_str("content")
            .ok_or_else(|| anyhow::anyhow!("deploy_file requires 'content'"))?;
        deploy_file(&self.inner.config.app_dir, path, content).await
    }

    async fn handle_health_check(&self) -> anyhow::Result<Map<String, Value>> {
        let checks = run_checks(&self.inner.checks, self.inner.config.check_timeout).await;
        let failing: Vec<String> = checks
            .iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(name, _)| format!("health check '{name}' failed"))
            .collect();
        let healthy = failing.is_empty();

        if !healthy && !self.is_frozen() {
            self.freeze(&failing.join("; ")).await?;
        }

        let mut output = Map::new();
        output.insert("healthy".into(), Value::Bool(healthy));
        output.insert("frozen".into(), Value::Bool(self.is_frozen()));
        output.insert(
            "checks".into(),
            Value::Object(
                checks
                    .into_iter()
                    .map(|(name, ok)| (name, Value::Bool(ok)))
                    .collect(),
            ),
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::metrics::{MockMetricsProbe, ResourceUsage};
    use crate::pool::PoolConfig;
    use crate::store::MemoryStore;

    fn agent_with_probe(probe: MockMetricsProbe) -> NodeAgent {
        let pool = NodePool::new(Arc::new(MemoryStore::new()), PoolConfig::default());
        let mut config = AgentConfig::from_config(&Config::default());
        config.node_id = "n1".into();
        config.advertise_ip = Some("10.0.0.1".into());
        NodeAgent::builder(pool, config)
            .metrics_probe(Box::new(probe))
            .build()
            .unwrap()
    }

    fn usage(cpu: f32, memory: f32) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_percent: None,
        }
    }

    #[tokio::test]
    async fn test_cpu_breach_freezes_node() {
        let mut probe = MockMetricsProbe::new();
        probe.expect_sample().times(1).return_const(usage(97.5, 20.0));
        let agent = agent_with_probe(probe);
        agent.register().await.unwrap();

        let report = agent.heartbeat_once().await.unwrap();
        assert!(report.froze);
        assert!(report.failures[0].contains("cpu"));
        assert!(agent.is_frozen());
        assert!(agent.pool().get_active_nodes().await.unwrap().is_empty());

        let state = agent.pool().get_node_status("n1").await.unwrap().unwrap();
        assert!(state.freeze_reason.unwrap().contains("cpu 97.5%"));
    }

    #[tokio::test]
    async fn test_passing_heartbeat_does_not_unfreeze() {
        let mut probe = MockMetricsProbe::new();
        probe.expect_sample().return_const(usage(10.0, 20.0));
        let agent = agent_with_probe(probe);
        agent.register().await.unwrap();

        assert!(agent.freeze("maintenance").await.unwrap());
        assert!(!agent.freeze("again").await.unwrap());

        let report = agent.heartbeat_once().await.unwrap();
        assert!(!report.outcome.admitted);
        assert!(!report.froze);
        assert!(agent.is_frozen());

        assert!(agent.unfreeze().await.unwrap());
        assert_eq!(agent.pool().get_active_nodes().await.unwrap(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_unknown_command_is_unsupported() {
        let agent = agent_with_probe(MockMetricsProbe::new());
        let result = agent.execute(&Command::new("teleport")).await;
        assert_eq!(result.status, CommandStatus::Unsupported);
    }

    #[test]
    fn test_builtin_override_fails_build() {
        let pool = NodePool::new(Arc::new(MemoryStore::new()), PoolConfig::default());
        let config = AgentConfig::from_config(&Config::default());
        let handler = crate::agent::handler_fn(|_cmd: Command| async { Ok(Map::new()) });
        let err = NodeAgent::builder(pool, config)
            .handler("freeze", handler)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    struct BackupPlugin(&'static str);

    impl CommandPlugin for BackupPlugin {
        fn name(&self) -> &str {
            "backup"
        }

        fn handlers(&self) -> Vec<(String, Arc<dyn CommandHandler>)> {
            let handler = crate::agent::handler_fn(|_cmd: Command| async { Ok(Map::new()) });
            vec![(self.0.to_string(), handler)]
        }
    }

    #[test]
    fn test_plugin_handlers_are_registered_on_build() {
        let pool = NodePool::new(Arc::new(MemoryStore::new()), PoolConfig::default());
        let config = AgentConfig::from_config(&Config::default());
        let agent = NodeAgent::builder(pool.clone(), config.clone())
            .plugin(Arc::new(BackupPlugin("backup")))
            .build()
            .unwrap();
        assert_eq!(agent.inner.handlers.types(), vec!["backup"]);

        let err = NodeAgent::builder(pool, config)
            .plugin(Arc::new(BackupPlugin("exec")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
