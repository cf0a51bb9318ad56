//! Load-balancer upstream maintenance
//!
//! Follows lifecycle events and a periodic full reconcile, resolves every
//! active node to an address and hands the sorted list to a sink. The sink
//! is only called when the active set actually changed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::ip_resolver::IpResolutionChain;
use crate::error::Result;
use crate::events::EventBus;
use crate::pool::NodePool;

/// One routable backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub node_id: String,
    pub address: String,
    /// Resolution failed and the last known address was reused
    pub stale: bool,
}

/// Receives the full upstream list whenever it changes
#[async_trait]
pub trait UpstreamSink: Send + Sync {
    async fn apply(&self, upstreams: &[Upstream]) -> anyhow::Result<()>;
}

/// Sink that only logs the list
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl UpstreamSink for LoggingSink {
    async fn apply(&self, upstreams: &[Upstream]) -> anyhow::Result<()> {
        let servers: Vec<String> = upstreams
            .iter()
            .map(|u| format!("{}={}", u.node_id, u.address))
            .collect();
        tracing::info!(count = upstreams.len(), servers = ?servers, "Upstreams updated");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamWatcherConfig {
    pub reconcile_interval: Duration,
    /// Keep routing to the last known address when resolution fails
    pub keep_last_known: bool,
}

impl Default for UpstreamWatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            keep_last_known: true,
        }
    }
}

#[derive(Debug, Default)]
struct WatcherState {
    applied: Option<Vec<String>>,
    last_known: HashMap<String, String>,
}

pub struct UpstreamWatcher {
    pool: NodePool,
    bus: EventBus,
    chain: IpResolutionChain,
    sink: Arc<dyn UpstreamSink>,
    config: UpstreamWatcherConfig,
    state: Mutex<WatcherState>,
    cancel_token: CancellationToken,
}

impl UpstreamWatcher {
    #[must_use]
    pub fn new(
        pool: NodePool,
        bus: EventBus,
        chain: IpResolutionChain,
        sink: Arc<dyn UpstreamSink>,
        config: UpstreamWatcherConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            chain,
            sink,
            config,
            state: Mutex::new(WatcherState::default()),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Rebuild the upstream list if the active set changed.
    ///
    /// `snapshot` is the active set carried by an event; `None` reads it from
    /// the pool and also forgets last known addresses of nodes that left the
    /// pool. Returns whether the sink was called successfully.
    pub async fn reconcile(&self, snapshot: Option<Vec<String>>) -> Result<bool> {
        let (mut active, members) = match snapshot {
            Some(active) => (active, None),
            None => (
                self.pool.get_active_nodes().await?,
                Some(self.pool.get_all_nodes().await?),
            ),
        };
        active.sort();
        active.dedup();

        let mut state = self.state.lock().await;
        if let Some(members) = members {
            let before = state.last_known.len();
            state.last_known.retain(|node_id, _| members.contains(node_id));
            let forgotten = before - state.last_known.len();
            if forgotten > 0 {
                tracing::debug!(forgotten = forgotten, "Forgot addresses of removed nodes");
            }
        }
        if state.applied.as_ref() == Some(&active) {
            return Ok(false);
        }

        let mut upstreams = Vec::with_capacity(active.len());
        for node_id in &active {
            match self.chain.resolve(node_id).await {
                Ok(address) => {
                    state.last_known.insert(node_id.clone(), address.clone());
                    upstreams.push(Upstream {
                        node_id: node_id.clone(),
                        address,
                        stale: false,
                    });
                }
                Err(e) => match state.last_known.get(node_id) {
                    Some(address) if self.config.keep_last_known => {
                        tracing::warn!(node_id = %node_id, address = %address, "Resolution failed, keeping last known address");
                        upstreams.push(Upstream {
                            node_id: node_id.clone(),
                            address: address.clone(),
                            stale: true,
                        });
                    }
                    _ => {
                        tracing::warn!(node_id = %node_id, error = %e, "Dropping unresolvable node from upstreams");
                    }
                },
            }
        }

        if let Err(e) = self.sink.apply(&upstreams).await {
            tracing::error!(error = %e, "Upstream sink failed, will retry on next change or reconcile");
            return Ok(false);
        }
        state.applied = Some(active);
        Ok(true)
    }

    /// Subscribe and start the watch loop
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    /// Use `shutdown()` to stop the loop.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let mut events = self.bus.subscribe().await?;
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.config.reconcile_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            let mut subscribed = true;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Upstream watcher shutting down");
                        return;
                    }
                    event = events.next(), if subscribed => {
                        let Some(event) = event else {
                            tracing::warn!("Event stream ended, relying on periodic reconcile");
                            subscribed = false;
                            continue;
                        };
                        tracing::debug!(event = %event.kind, node_id = %event.node_id, "Lifecycle event received");
                        if let Err(e) = self.reconcile(Some(event.active_nodes)).await {
                            tracing::error!(error = %e, "Reconcile after event failed");
                        }
                    }
                    _ = timer.tick() => {
                        if let Err(e) = self.reconcile(None).await {
                            tracing::error!(error = %e, "Periodic reconcile failed");
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
