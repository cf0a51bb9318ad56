//! Node agent runtime, built-in commands and extension points

pub mod builtins;
pub mod compose;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod node_agent;

pub use builtins::ExecPolicy;
pub use compose::DockerComposePlugin;
pub use handlers::{handler_fn, CommandHandler, CommandPlugin, HandlerRegistry, BUILTIN_COMMANDS};
pub use health::{health_check_fn, HealthCheck, TcpHealthCheck};
pub use metrics::{MetricsProbe, ResourceUsage, SysinfoProbe};
pub use node_agent::{AgentConfig, AgentHandle, HeartbeatReport, NodeAgent, NodeAgentBuilder};
