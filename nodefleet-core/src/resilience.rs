//! Retry helpers for calls to the coordination store
//!
//! Backoff schedules come from the `backon` crate. Callers decide which
//! errors are transient; nothing here retries on its own.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::StartupConfig;

/// Bounded exponential retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StartupConfig::default())
    }
}

impl From<&StartupConfig> for RetryPolicy {
    fn from(config: &StartupConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
            .build()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut delays = policy.delays();
    let mut attempt = 1usize;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                let Some(delay) = delays.next() else {
                    tracing::error!(
                        operation = operation,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                };
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    retry_in = ?delay,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
