//! Retry backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// Delays are deterministic: no jitter is applied, so every node computes
/// the same `next_retry_at` for the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a record is moved to the dead-letter queue
    pub max_retry_count: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_retry_count: u32, delay: Duration) -> Self {
        Self {
            max_retry_count,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retry_count: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retry_count,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows attempt `retry_count` (1-indexed).
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u128.checked_shl(retry_count - 1).unwrap_or(u128::MAX);
                base_ms.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(u128::from(retry_count)),
        };

        Duration::from_millis(delay_ms.min(max_ms).min(u128::from(u64::MAX)) as u64)
    }

    pub fn next_retry_time(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(retry_count)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retry_count
    }
}
