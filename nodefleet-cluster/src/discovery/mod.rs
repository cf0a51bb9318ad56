//! Address resolution and load-balancer upstream tracking

pub mod ip_resolver;
pub mod upstream;

pub use ip_resolver::{
    detect_local_ip, CallbackIpResolver, DnsIpResolver, IpResolutionChain, IpResolver,
    LocalIpResolver, StaticIpResolver, StoreIpResolver,
};
pub use upstream::{LoggingSink, Upstream, UpstreamSink, UpstreamWatcher, UpstreamWatcherConfig};
