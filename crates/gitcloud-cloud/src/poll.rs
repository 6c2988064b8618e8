//! Readiness polling with exponential backoff and cancellation support
//!
//! Every cloud create is asynchronous: the provider acknowledges the request and
//! the resource becomes usable later. [`wait_until_ready`] turns that into a
//! single awaitable step bounded by a time budget.

use crate::error::{PollError, PollErrorKind, ProviderError};
use crate::resource::ResourceKind;
use backon::{BackoffBuilder, ExponentialBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Schedule and budget for one readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// First delay between describe calls
    pub base_interval: Duration,
    /// Cap for exponential growth
    pub max_interval: Duration,
    /// Total budget, including time spent inside describe calls
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(20),
            timeout,
        }
    }

    pub fn with_base_interval(mut self, base_interval: Duration) -> Self {
        self.base_interval = base_interval;
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }
}

/// Per-kind polling budgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Network, subnets and security groups
    pub network_timeout: Duration,
    pub compute_timeout: Duration,
    pub database_timeout: Duration,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(120),
            compute_timeout: Duration::from_secs(300),
            database_timeout: Duration::from_secs(900),
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(20),
        }
    }
}

impl PollSettings {
    pub fn for_kind(&self, kind: ResourceKind) -> PollConfig {
        let timeout = match kind {
            ResourceKind::ComputeInstance => self.compute_timeout,
            ResourceKind::ManagedDatabase => self.database_timeout,
            _ => self.network_timeout,
        };
        PollConfig::new(timeout)
            .with_base_interval(self.base_interval)
            .with_max_interval(self.max_interval)
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

/// Jittered exponential delays between describe calls. Unbounded; the
/// deadline ends the loop.
fn poll_delays(config: &PollConfig) -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(config.base_interval)
        .with_max_delay(config.max_interval)
        .with_factor(2.0)
        .without_max_times()
        .with_jitter()
        .build()
}

/// Poll `describe` until `is_ready` holds, `is_failed` holds, or the budget runs out.
///
/// Transient describe errors are retried on the same schedule and count against
/// the same budget; permanent ones end the wait immediately.
pub async fn wait_until_ready<S, F, Fut, R, X>(
    resource_id: &str,
    mut describe: F,
    is_ready: R,
    is_failed: X,
    config: &PollConfig,
    cancel: Option<&CancellationToken>,
) -> Result<S, PollError>
where
    S: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, ProviderError>>,
    R: Fn(&S) -> bool,
    X: Fn(&S) -> bool,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut attempts = 0u32;
    let mut last_status: Option<String> = None;

    let fail = |kind: PollErrorKind| PollError {
        resource_id: resource_id.to_string(),
        kind,
    };

    let mut delays = poll_delays(config);

    loop {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            return Err(fail(PollErrorKind::Cancelled));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(fail(PollErrorKind::Timeout {
                elapsed: start.elapsed(),
                attempts,
                last_status,
            }));
        }

        attempts += 1;
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(remaining, describe()) => outcome,
            _ = cancelled(cancel) => return Err(fail(PollErrorKind::Cancelled)),
        };

        match outcome {
            Err(_) => {
                warn!(resource_id, attempts, "Describe call outlived the polling budget");
                return Err(fail(PollErrorKind::Timeout {
                    elapsed: start.elapsed(),
                    attempts,
                    last_status,
                }));
            }
            Ok(Ok(status)) => {
                if is_failed(&status) {
                    warn!(resource_id, status = %status, "Resource entered a failed state");
                    return Err(fail(PollErrorKind::RemoteFailure {
                        status: status.to_string(),
                    }));
                }
                if is_ready(&status) {
                    debug!(resource_id, attempts, "Resource ready");
                    return Ok(status);
                }
                last_status = Some(status.to_string());
            }
            Ok(Err(e)) if e.is_transient() => {
                debug!(resource_id, attempts, error = %e, "Transient describe error, retrying");
            }
            Ok(Err(e)) => {
                warn!(resource_id, error = %e, "Describe failed");
                return Err(fail(PollErrorKind::Provider(e)));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let delay = delays
            .next()
            .unwrap_or(config.max_interval)
            .min(remaining);
        debug!(
            resource_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            status = last_status.as_deref().unwrap_or("unknown"),
            "Resource not ready, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(cancel) => return Err(fail(PollErrorKind::Cancelled)),
        }
    }
}
