pub mod agent;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod pool;
pub mod store;

pub use error::{Error, Result};
pub use agent::{AgentConfig, AgentHandle, NodeAgent, NodeAgentBuilder};
pub use discovery::{IpResolutionChain, IpResolver, UpstreamWatcher};
pub use dispatch::{CommandDispatcher, CommandRequest, DispatchOutcome, DispatcherConfig};
pub use events::{EventBus, LifecycleEvent, LifecycleEventKind};
pub use pool::{DeadNodeReaper, NodePool, PoolConfig};
pub use store::{CoordinationStore, MemoryStore, RedisStore};
