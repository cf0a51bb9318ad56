//! Node id to routable address resolution
//!
//! Resolvers are tried in order and the first non-empty answer wins, so a
//! dynamic primary can sit in front of a static emergency table.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::pool::NodePool;

/// One resolution strategy. `None` means "no answer", never an error.
#[async_trait]
pub trait IpResolver: Send + Sync {
    fn name(&self) -> &str;
    async fn resolve(&self, node_id: &str) -> Option<String>;
}

/// Address the node registered for itself
#[derive(Debug, Clone)]
pub struct StoreIpResolver {
    pool: NodePool,
}

impl StoreIpResolver {
    #[must_use]
    pub const fn new(pool: NodePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IpResolver for StoreIpResolver {
    fn name(&self) -> &str {
        "store"
    }

    async fn resolve(&self, node_id: &str) -> Option<String> {
        match self.pool.get_node_ip(node_id).await {
            Ok(ip) => ip.filter(|ip| !ip.is_empty()),
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Self-registered address lookup failed");
                None
            }
        }
    }
}

/// `{node_id}{suffix}` through the system resolver
#[derive(Debug, Clone, Default)]
pub struct DnsIpResolver {
    domain_suffix: String,
}

impl DnsIpResolver {
    #[must_use]
    pub fn new(domain_suffix: impl Into<String>) -> Self {
        Self {
            domain_suffix: domain_suffix.into(),
        }
    }
}

#[async_trait]
impl IpResolver for DnsIpResolver {
    fn name(&self) -> &str {
        "dns"
    }

    async fn resolve(&self, node_id: &str) -> Option<String> {
        let hostname = format!("{node_id}{}", self.domain_suffix);
        // lookup_host needs a port; it is discarded
        let mut addrs = match tokio::net::lookup_host((hostname.as_str(), 0)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(hostname = %hostname, error = %e, "DNS lookup failed");
                return None;
            }
        };
        addrs.next().map(|addr| addr.ip().to_string())
    }
}

/// Fixed node id to address table
#[derive(Debug, Clone, Default)]
pub struct StaticIpResolver {
    mapping: HashMap<String, String>,
}

impl StaticIpResolver {
    #[must_use]
    pub const fn new(mapping: HashMap<String, String>) -> Self {
        Self { mapping }
    }
}

impl FromIterator<(String, String)> for StaticIpResolver {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[async_trait]
impl IpResolver for StaticIpResolver {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve(&self, node_id: &str) -> Option<String> {
        self.mapping.get(node_id).cloned()
    }
}

type ResolveFn = dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync;

/// Integrator-supplied async callback
pub struct CallbackIpResolver {
    name: String,
    callback: Box<ResolveFn>,
}

impl std::fmt::Debug for CallbackIpResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackIpResolver")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CallbackIpResolver {
    pub fn new<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(move |node_id| Box::pin(callback(node_id))),
        }
    }
}

#[async_trait]
impl IpResolver for CallbackIpResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, node_id: &str) -> Option<String> {
        (self.callback)(node_id.to_string()).await
    }
}

/// This machine's outbound address, whatever the node id
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalIpResolver;

#[async_trait]
impl IpResolver for LocalIpResolver {
    fn name(&self) -> &str {
        "local"
    }

    async fn resolve(&self, _node_id: &str) -> Option<String> {
        detect_local_ip().await
    }
}

/// Outbound IPv4 address of this host.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// source address it would route from.
pub async fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}

/// Ordered list of resolvers
#[derive(Clone, Default)]
pub struct IpResolutionChain {
    resolvers: Vec<Arc<dyn IpResolver>>,
}

impl std::fmt::Debug for IpResolutionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.resolvers.iter().map(|r| r.name()).collect();
        f.debug_struct("IpResolutionChain")
            .field("resolvers", &names)
            .finish()
    }
}

impl IpResolutionChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, resolver: Arc<dyn IpResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// First non-empty answer, or `Error::Unresolved`
    pub async fn resolve(&self, node_id: &str) -> Result<String> {
        for resolver in &self.resolvers {
            if let Some(ip) = resolver.resolve(node_id).await {
                let ip = ip.trim().to_string();
                if ip.is_empty() {
                    continue;
                }
                if ip.parse::<IpAddr>().is_err() {
                    tracing::debug!(resolver = resolver.name(), node_id = %node_id, address = %ip, "Resolved to a hostname");
                }
                return Ok(ip);
            }
        }
        Err(Error::Unresolved(format!(
            "no resolver produced an address for '{node_id}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{NodeMetadata, PoolConfig};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_chain_falls_back_in_order() {
        let primary = CallbackIpResolver::new("primary", |_node_id| async { None });
        let fallback: StaticIpResolver = [("n1".to_string(), "10.0.1.10".to_string())]
            .into_iter()
            .collect();
        let chain = IpResolutionChain::new()
            .with(Arc::new(primary))
            .with(Arc::new(fallback));

        assert_eq!(chain.resolve("n1").await.unwrap(), "10.0.1.10");
        assert!(matches!(
            chain.resolve("n2").await.unwrap_err(),
            Error::Unresolved(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_answers_are_skipped() {
        let blank = CallbackIpResolver::new("blank", |_node_id| async { Some("  ".to_string()) });
        let echo = CallbackIpResolver::new("echo", |node_id: String| async move {
            Some(format!("{node_id}.internal"))
        });
        let chain = IpResolutionChain::new()
            .with(Arc::new(blank))
            .with(Arc::new(echo));
        assert_eq!(chain.resolve("web1").await.unwrap(), "web1.internal");
    }

    #[tokio::test]
    async fn test_store_resolver_reads_self_registration() {
        let pool = NodePool::new(Arc::new(MemoryStore::new()), PoolConfig::default());
        pool.register("n1", &NodeMetadata::new("dc1").with_ip("192.168.1.7"))
            .await
            .unwrap();

        let resolver = StoreIpResolver::new(pool);
        assert_eq!(resolver.resolve("n1").await.as_deref(), Some("192.168.1.7"));
        assert_eq!(resolver.resolve("n2").await, None);
    }

    #[tokio::test]
    async fn test_dns_resolver_localhost() {
        let resolver = DnsIpResolver::new("");
        let ip = resolver.resolve("localhost").await.unwrap();
        assert!(ip.parse::<IpAddr>().unwrap().is_loopback());
    }
}
