use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nodefleet_cluster::agent::{AgentConfig, DockerComposePlugin, TcpHealthCheck};
use nodefleet_cluster::discovery::{
    DnsIpResolver, IpResolutionChain, LoggingSink, StaticIpResolver, StoreIpResolver,
    UpstreamWatcher, UpstreamWatcherConfig,
};
use nodefleet_cluster::{
    CoordinationStore, DeadNodeReaper, EventBus, NodeAgent, NodePool, PoolConfig, RedisStore,
};
use nodefleet_core::resilience::{retry_with_backoff, RetryPolicy};
use nodefleet_core::{logging, Config};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "nodefleet")]
#[command(about = "Redis-coordinated node pool management", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "NODEFLEET_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the node agent on this machine
    Agent {
        /// Enable Docker Compose service commands for this compose file
        #[arg(long)]
        compose: Option<String>,

        /// TCP health check as name=host:port, repeatable
        #[arg(long = "tcp-check", value_parser = parse_pair)]
        tcp_checks: Vec<(String, String)>,
    },
    /// Periodically remove dead nodes from the pool
    Reaper,
    /// Follow lifecycle events and maintain the load-balancer upstream list
    Watch {
        /// Resolve `{node_id}{suffix}` through DNS before the static table
        #[arg(long)]
        dns_suffix: Option<String>,

        /// Static fallback address as node=ip, repeatable
        #[arg(long = "static", value_parser = parse_pair)]
        static_ips: Vec<(String, String)>,

        /// Drop nodes whose address cannot be resolved
        #[arg(long)]
        no_keep_last_known: bool,
    },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        eprintln!("Configuration validation failed:");
        for e in &errors {
            eprintln!("  - {e}");
        }
        bail!("invalid configuration ({} errors)", errors.len());
    }

    logging::init_logging(&config.logging)?;

    info!("Starting nodefleet...");
    info!(
        "Node ID: {}, data center: {}",
        config.node.node_id, config.node.data_center
    );

    let store = connect_store(&config).await?;
    let pool = NodePool::new(store, PoolConfig::from_config(&config));
    let bus = EventBus::for_pool(&pool, &config.events.channel);

    match args.command {
        Mode::Agent {
            compose,
            tcp_checks,
        } => run_agent(&config, pool, compose, tcp_checks).await,
        Mode::Reaper => run_reaper(&config, pool, bus).await,
        Mode::Watch {
            dns_suffix,
            static_ips,
            no_keep_last_known,
        } => run_watcher(&config, pool, bus, dns_suffix, static_ips, !no_keep_last_known).await,
    }
}

async fn connect_store(config: &Config) -> Result<Arc<dyn CoordinationStore>> {
    let policy = RetryPolicy::from(&config.startup);
    let timeout = config.redis_operation_timeout();
    let store = retry_with_backoff(
        &policy,
        "connect to redis",
        || RedisStore::connect(config.redis_url(), timeout),
        nodefleet_cluster::Error::is_retryable,
    )
    .await
    .context("Failed to connect to Redis")?;
    info!("Connected to Redis");
    Ok(Arc::new(store))
}

async fn run_agent(
    config: &Config,
    pool: NodePool,
    compose: Option<String>,
    tcp_checks: Vec<(String, String)>,
) -> Result<()> {
    let agent_config = AgentConfig::from_config(config);
    let mut builder = NodeAgent::builder(pool, agent_config.clone());
    if let Some(compose_file) = compose {
        builder = builder.plugin(Arc::new(DockerComposePlugin::new(
            agent_config.app_dir.clone(),
            compose_file,
        )));
    }
    for (name, address) in tcp_checks {
        builder = builder.health_check(Arc::new(TcpHealthCheck::new(name, address)));
    }

    let agent = builder.build()?;
    let handle = agent.start().await?;

    shutdown_signal().await;
    info!("Shutting down node agent...");
    handle.shutdown().await;
    Ok(())
}

async fn run_reaper(config: &Config, pool: NodePool, bus: EventBus) -> Result<()> {
    let interval = Duration::from_secs(config.cleanup.interval_secs);
    let reaper = Arc::new(DeadNodeReaper::new(pool, bus, interval));
    let handle = reaper.clone().start();

    shutdown_signal().await;
    reaper.shutdown();
    if let Err(e) = handle.await {
        error!("Reaper task ended abnormally: {}", e);
    }
    Ok(())
}

async fn run_watcher(
    config: &Config,
    pool: NodePool,
    bus: EventBus,
    dns_suffix: Option<String>,
    static_ips: Vec<(String, String)>,
    keep_last_known: bool,
) -> Result<()> {
    let mut chain = IpResolutionChain::new().with(Arc::new(StoreIpResolver::new(pool.clone())));
    if let Some(suffix) = dns_suffix {
        chain = chain.with(Arc::new(DnsIpResolver::new(suffix)));
    }
    if !static_ips.is_empty() {
        let table: HashMap<String, String> = static_ips.into_iter().collect();
        chain = chain.with(Arc::new(StaticIpResolver::new(table)));
    }

    let watcher = Arc::new(UpstreamWatcher::new(
        pool,
        bus,
        chain,
        Arc::new(LoggingSink),
        UpstreamWatcherConfig {
            reconcile_interval: Duration::from_secs(config.events.reconcile_interval_secs),
            keep_last_known,
        },
    ));
    let handle = watcher.clone().start().await?;

    shutdown_signal().await;
    watcher.shutdown();
    if let Err(e) = handle.await {
        error!("Upstream watcher task ended abnormally: {}", e);
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("web=127.0.0.1:8000").unwrap(),
            ("web".to_string(), "127.0.0.1:8000".to_string())
        );
        assert_eq!(parse_pair("cmd=a=b").unwrap().1, "a=b");
        assert!(parse_pair("=x").is_err());
        assert!(parse_pair("novalue").is_err());
    }

    #[test]
    fn test_args_parse_watch() {
        let args = Args::try_parse_from([
            "nodefleet",
            "watch",
            "--static",
            "n1=10.0.1.10",
            "--no-keep-last-known",
        ])
        .unwrap();
        match args.command {
            Mode::Watch {
                static_ips,
                no_keep_last_known,
                dns_suffix,
            } => {
                assert_eq!(static_ips, vec![("n1".to_string(), "10.0.1.10".to_string())]);
                assert!(no_keep_last_known);
                assert!(dns_suffix.is_none());
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
