//! `docker compose` service management plugin
//!
//! Provides `start`, `stop`, `restart`, `pull`, `update`, `logs` and `status`
//! command types for nodes whose application runs under Compose.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::builtins::run_process;
use super::handlers::{CommandHandler, CommandPlugin};
use crate::pool::Command;

const COMPOSE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_LOG_TAIL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComposeAction {
    Start,
    Stop,
    Restart,
    Pull,
    Update,
    Logs,
    Status,
}

impl ComposeAction {
    const ALL: [Self; 7] = [
        Self::Start,
        Self::Stop,
        Self::Restart,
        Self::Pull,
        Self::Update,
        Self::Logs,
        Self::Status,
    ];

    const fn command_type(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Pull => "pull",
            Self::Update => "update",
            Self::Logs => "logs",
            Self::Status => "status",
        }
    }
}

#[derive(Debug, Clone)]
struct Compose {
    app_dir: PathBuf,
    compose_file: String,
}

impl Compose {
    fn argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = vec![
            "docker".to_string(),
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.clone(),
        ];
        argv.extend_from_slice(args);
        argv
    }

    async fn run(&self, args: &[String]) -> Map<String, Value> {
        match run_process(&self.argv(args), &self.app_dir, COMPOSE_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                let mut output = Map::new();
                output.insert("stdout".into(), Value::String(String::new()));
                output.insert("stderr".into(), Value::String(format!("{e:#}")));
                output.insert("exit_code".into(), Value::from(-1));
                output.insert("success".into(), Value::Bool(false));
                output
            }
        }
    }
}

fn services(command: &Command) -> Vec<String> {
    command
        .payload
        .get("services")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_string()).collect()
}

fn step(name: &str, output: &Map<String, Value>) -> Value {
    serde_json::json!({
        "step": name,
        "success": output.get("success").cloned().unwrap_or(Value::Bool(false)),
        "output": output.get("stdout").cloned().unwrap_or_default(),
        "error": output.get("stderr").cloned().unwrap_or_default(),
    })
}

fn succeeded(output: &Map<String, Value>) -> bool {
    output.get("success").and_then(Value::as_bool).unwrap_or(false)
}

struct ComposeHandler {
    compose: Arc<Compose>,
    action: ComposeAction,
}

impl ComposeHandler {
    async fn update(&self, command: &Command) -> Map<String, Value> {
        let mut steps = Vec::new();
        let mut pull_args = strings(&["pull"]);
        pull_args.extend(services(command));

        let pull = self.compose.run(&pull_args).await;
        steps.push(step("pull", &pull));
        if !succeeded(&pull) {
            let mut output = Map::new();
            output.insert("success".into(), Value::Bool(false));
            output.insert("message".into(), "Update failed during pull".into());
            output.insert("steps".into(), Value::Array(steps));
            return output;
        }

        let recreate = self
            .compose
            .run(&strings(&["up", "-d", "--force-recreate"]))
            .await;
        steps.push(step("recreate", &recreate));

        if let Some(wait) = command.payload.get("wait_seconds").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_secs(wait)).await;
            let status = self.compose.run(&strings(&["ps"])).await;
            steps.push(step("status_check", &status));
        }

        let mut output = Map::new();
        output.insert("success".into(), Value::Bool(succeeded(&recreate)));
        output.insert("message".into(), "Update completed".into());
        output.insert("steps".into(), Value::Array(steps));
        output
    }
}

#[async_trait]
impl CommandHandler for ComposeHandler {
    async fn handle(&self, command: &Command) -> anyhow::Result<Map<String, Value>> {
        let services = services(command);
        let args = match self.action {
            ComposeAction::Update => return Ok(self.update(command).await),
            ComposeAction::Start => [strings(&["up", "-d"]), services].concat(),
            ComposeAction::Stop if services.is_empty() => strings(&["down"]),
            ComposeAction::Stop => [strings(&["stop"]), services].concat(),
            ComposeAction::Restart => [strings(&["restart"]), services].concat(),
            ComposeAction::Pull => [strings(&["pull"]), services].concat(),
            ComposeAction::Logs => {
                let tail = command
                    .payload
                    .get("tail")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_LOG_TAIL);
                [strings(&["logs", "--tail"]), vec![tail.to_string()], services].concat()
            }
            ComposeAction::Status => strings(&["ps"]),
        };

        tracing::info!(action = self.action.command_type(), args = ?args, "Running docker compose");
        let mut output = self.compose.run(&args).await;
        output.insert(
            "message".into(),
            Value::String(format!("{} command executed", self.action.command_type())),
        );
        Ok(output)
    }
}

/// Compose-backed service management handlers
#[derive(Debug, Clone)]
pub struct DockerComposePlugin {
    compose: Arc<Compose>,
}

impl DockerComposePlugin {
    #[must_use]
    pub fn new(app_dir: impl Into<PathBuf>, compose_file: impl Into<String>) -> Self {
        Self {
            compose: Arc::new(Compose {
                app_dir: app_dir.into(),
                compose_file: compose_file.into(),
            }),
        }
    }
}

impl CommandPlugin for DockerComposePlugin {
    fn name(&self) -> &str {
        "docker-compose"
    }

    fn handlers(&self) -> Vec<(String, Arc<dyn CommandHandler>)> {
        ComposeAction::ALL
            .iter()
            .map(|&action| {
                let handler: Arc<dyn CommandHandler> = Arc::new(ComposeHandler {
                    compose: self.compose.clone(),
                    action,
                });
                (action.command_type().to_string(), handler)
            })
            .collect()
    }
}
