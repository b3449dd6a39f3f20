//! Bounded exponential backoff around remote calls.
//!
//! Every listing and mutating call the engine makes goes through
//! [`with_retry`]. Only faults the store classifies as transient (network,
//! rate limiting, remote unavailability) are retried; anything else surfaces
//! on the first attempt. Each call starts from attempt one, so an exhausted
//! operation never eats into the budget of the next.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Randomize each delay within its upper half
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits; handy for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::rng().random_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            delay
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    /// The fault is not retryable and was returned as-is
    #[error("{operation} failed: {source}")]
    Failed {
        operation: String,
        #[source]
        source: StoreError,
    },
    /// Every attempt hit a transient fault
    #[error("{operation} gave up after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl RetryError {
    /// The underlying store fault (the last one, when exhausted).
    pub fn store_error(&self) -> &StoreError {
        match self {
            RetryError::Failed { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn is_fatal(&self) -> bool {
        self.store_error().is_fatal()
    }
}

/// Run `op` under `policy`, retrying transient faults with backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(RetryError::Failed {
                operation: operation.to_string(),
                source: err,
            });
        }

        if attempt >= max_attempts {
            tracing::error!(
                operation,
                attempts = attempt,
                error = %err,
                "retries exhausted"
            );
            return Err(RetryError::Exhausted {
                operation: operation.to_string(),
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.backoff(attempt);
        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
