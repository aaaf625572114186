//! Retry as a value.
//!
//! A [`RetryPolicy`] describes attempts, backoff and per-attempt timeout;
//! [`call_with_policy`] runs any async operation under it. The extraction
//! client, the registries and the embedder all share this one loop, so
//! "transient" means the same thing everywhere: [`RetryableError::is_retryable`].
//!
//! Backoff is `base_delay * multiplier^(attempt-1)`, capped at `max_delay`,
//! plus up to `jitter` of random spread. With the defaults (500 ms, ×2,
//! 3 attempts) a failing call waits 500 ms then 1 s before giving up.

use crate::error::{ModelError, RegistryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded exponential backoff with a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
    /// Deadline for a single attempt; expiry counts as a transient failure.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
            timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            jitter: Duration::ZERO,
            timeout,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = self.jitter.as_millis() as u64;
        if spread == 0 {
            delay
        } else {
            delay + Duration::from_millis(fastrand::u64(0..=spread))
        }
    }
}

/// Errors that know whether another attempt could help.
pub trait RetryableError: Sized {
    fn is_retryable(&self) -> bool;

    /// The error to report when an attempt exceeds the policy timeout.
    fn timed_out(elapsed: Duration) -> Self;

    /// Server-requested wait (HTTP `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for ModelError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::Transient { .. } | ModelError::RateLimited { .. } | ModelError::Timeout { .. }
        )
    }

    fn timed_out(elapsed: Duration) -> Self {
        ModelError::Timeout { elapsed }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl RetryableError for RegistryError {
    fn is_retryable(&self) -> bool {
        !matches!(self, RegistryError::BadResponse { .. })
    }

    fn timed_out(elapsed: Duration) -> Self {
        RegistryError::Unavailable {
            registry: "registry",
            detail: format!("timed out after {}ms", elapsed.as_millis()),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RegistryError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// The last error once the policy gave up, and how many attempts were made.
#[derive(Debug, Clone)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
///
/// Non-retryable errors are returned immediately.
pub async fn call_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    E: RetryableError + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut server_wait: Option<Duration> = None;

    loop {
        attempt += 1;
        if attempt > 1 {
            let backoff = policy.jittered(policy.delay_for_attempt(attempt));
            let wait = server_wait.map_or(backoff, |w| w.min(policy.max_delay).max(backoff));
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt - 1,
                max_attempts - 1,
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(policy.timeout, op(attempt)).await {
            Ok(r) => r,
            Err(_) => Err(E::timed_out(started.elapsed())),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{}: succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(Exhausted { error, attempts: attempt });
                }
                debug!("{}: attempt {} failed: {}", label, attempt, error);
                server_wait = error.retry_after();
            }
        }
    }
}
