/*!
 * Retry logic with exponential backoff
 *
 * Used for idempotent HTTP calls: part PUTs and broker, SciCat and Globus
 * RPCs. Only errors classified as transient by
 * [`IngestorError::is_transient`] are retried; the wait between attempts is
 * cut short by task cancellation.
 */

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{IngestorError, Result};

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    ExponentialWithJitter,
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Near-instant retries, for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.saturating_pow(retry.saturating_sub(1));
                self.initial_delay.saturating_mul(multiplier)
            }
        };

        let capped_delay = base_delay.min(self.max_delay);

        if matches!(self.backoff, BackoffStrategy::ExponentialWithJitter) && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            let jitter_amount = capped_delay.as_secs_f64() * jitter;
            capped_delay + Duration::from_secs_f64(jitter_amount)
        } else {
            capped_delay
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out
///
/// Returns [`IngestorError::Cancelled`] as soon as `cancel` fires between
/// attempts. The last error is returned when all attempts fail.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(IngestorError::Cancelled);
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() || retry >= policy.max_retries {
            return Err(err);
        }

        retry += 1;
        let delay = policy.calculate_delay(retry);
        warn!(
            operation = what,
            retry,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(IngestorError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T, Fut>(cancel: &CancellationToken, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IngestorError::Cancelled),
        result = fut => result,
    }
}
