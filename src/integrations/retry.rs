//! Retry with exponential backoff for research and agent calls
//!
//! Transient failures are retried up to a small ceiling, after which the
//! failure is definitive. The cancellable variant stops waiting as soon as
//! the drop's cancellation token fires.

use crate::{GtmError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Backoff before the first retry
    #[serde(with = "millis")]
    pub initial_backoff: Duration,

    /// Upper bound for any single backoff
    #[serde(with = "millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_research()
    }
}

impl RetryConfig {
    /// Research engine calls: two retries at 1s and 2s
    pub fn for_research() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Agent calls, which are usually rate limited rather than flaky
    pub fn for_agent() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Millisecond backoff, for tests and local fakes
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Calculate backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let secs = if self.jitter {
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(secs)
    }

    fn next_delay(&self, decision: RetryDecision, attempt: u32) -> Duration {
        match decision {
            RetryDecision::RetryAfter(d) => d.min(self.max_backoff),
            _ => self.backoff_duration(attempt),
        }
    }
}

/// Pseudo-random jitter in [0, 1) from the clock's sub-second nanos
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry after a specific duration (e.g., from Retry-After header)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Execute an async operation with retry logic
///
/// Returns the first success, or the last error once retries are exhausted
/// or a permanent error is seen.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let decision = e.retry_decision();
        if decision == RetryDecision::NoRetry {
            debug!(operation = operation_name, attempt, error = %e, "Permanent failure");
            return Err(e);
        }
        if attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                error = %e,
                "Giving up after retries"
            );
            return Err(e);
        }

        let backoff = config.next_delay(decision, attempt);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = config.max_retries + 1,
            backoff_secs = backoff.as_secs_f64(),
            error = %e,
            "Retrying after error"
        );

        sleep(backoff).await;
        attempt += 1;
    }
}

/// Like [`with_retry`], but checks `cancel` before every attempt and while
/// backing off. A cancelled token yields [`GtmError::CancellationRequested`].
///
/// An attempt already in flight is not interrupted.
pub async fn with_retry_cancellable<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(GtmError::CancellationRequested);
        }

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let decision = e.retry_decision();
        if decision == RetryDecision::NoRetry || attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                error = %e,
                "Operation failed"
            );
            return Err(e);
        }

        let backoff = config.next_delay(decision, attempt);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            backoff_secs = backoff.as_secs_f64(),
            error = %e,
            "Retrying after error"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(GtmError::CancellationRequested),
            _ = sleep(backoff) => {}
        }
        attempt += 1;
    }
}
