//! Pluggable health checks
//!
//! A check that errors, panics or runs past its time limit counts as failed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> anyhow::Result<bool>;
}

struct FnHealthCheck<F> {
    name: String,
    check: F,
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<bool> {
        (self.check)().await
    }
}

/// Wrap an async closure as a named health check
pub fn health_check_fn<F, Fut>(name: impl Into<String>, check: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(FnHealthCheck {
        name: name.into(),
        check,
    })
}

/// Healthy when a TCP connection to `address` succeeds within the timeout
#[derive(Debug, Clone)]
pub struct TcpHealthCheck {
    name: String,
    address: String,
    connect_timeout: Duration,
}

impl TcpHealthCheck {
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for TcpHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<bool> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) => {
                tracing::debug!(address = %self.address, error = %e, "TCP health probe failed");
                Ok(false)
            }
            Err(_) => {
                tracing::debug!(address = %self.address, "TCP health probe timed out");
                Ok(false)
            }
        }
    }
}

/// Run every check in order, isolating errors and panics per check.
///
/// Each check gets at most `limit`; a hung check is dropped and reported
/// unhealthy.
pub async fn run_checks(checks: &[Arc<dyn HealthCheck>], limit: Duration) -> Vec<(String, bool)> {
    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        let name = check.name().to_string();
        let healthy = match timeout(limit, AssertUnwindSafe(check.check()).catch_unwind()).await {
            Ok(Ok(Ok(healthy))) => healthy,
            Ok(Ok(Err(e))) => {
                tracing::warn!(check = %name, error = %e, "Health check errored");
                false
            }
            Ok(Err(_)) => {
                tracing::error!(check = %name, "Health check panicked");
                false
            }
            Err(_) => {
                tracing::warn!(check = %name, limit = ?limit, "Health check timed out");
                false
            }
        };
        results.push((name, healthy));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_errors_and_panics_count_as_failures() {
        let checks = vec![
            health_check_fn("ok", || async { Ok(true) }),
            health_check_fn("err", || async { Err(anyhow::anyhow!("db down")) }),
            health_check_fn("panics", || async {
                let probes: Vec<bool> = Vec::new();
                Ok(probes[0])
            }),
            health_check_fn("unhealthy", || async { Ok(false) }),
        ];

        let results = run_checks(&checks, Duration::from_secs(5)).await;
        assert_eq!(
            results,
            vec![
                ("ok".to_string(), true),
                ("err".to_string(), false),
                ("panics".to_string(), false),
                ("unhealthy".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_hung_check_times_out_as_failure() {
        let checks = vec![
            health_check_fn("hangs", || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(true)
            }),
            health_check_fn("ok", || async { Ok(true) }),
        ];

        let started = tokio::time::Instant::now();
        let results = run_checks(&checks, Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            results,
            vec![("hangs".to_string(), false), ("ok".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_tcp_health_check() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let up = TcpHealthCheck::new("app", address);
        assert!(up.check().await.unwrap());

        let down = TcpHealthCheck::new("db", "127.0.0.1:1").with_timeout(Duration::from_millis(200));
        assert!(!down.check().await.unwrap());
    }
}
