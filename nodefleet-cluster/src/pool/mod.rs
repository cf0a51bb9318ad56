//! Node membership, liveness and command queues

pub mod keys;
pub mod models;
pub mod node_pool;
pub mod reaper;

pub use keys::KeySpace;
pub use models::{
    Command, CommandResult, CommandStatus, Heartbeat, NodeLifecycle, NodeMetadata, NodeMetrics,
    NodeState,
};
pub use node_pool::{DequeuedCommand, HeartbeatOutcome, NodePool, PoolConfig};
pub use reaper::DeadNodeReaper;
