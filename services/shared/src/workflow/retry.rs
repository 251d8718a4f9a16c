use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy applied to activity executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial retry interval
    pub initial_interval: Duration,

    /// Maximum retry interval
    pub max_interval: Duration,

    /// Backoff coefficient (multiplier for each retry)
    pub backoff_coefficient: f64,

    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential_backoff(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }

    /// Policy for downstream provider API calls: 3s initial delay, doubling.
    pub fn provider_calls() -> Self {
        Self {
            initial_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(120),
            backoff_coefficient: 2.0,
            max_attempts: 4,
        }
    }

    /// Delay before the given retry attempt (attempt 0 is the first try).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_secs(0);
        }

        let base_delay = self.initial_interval.as_millis() as f64;
        let backoff_multiplier = self.backoff_coefficient.powi(attempt as i32 - 1);
        let delay = Duration::from_millis((base_delay * backoff_multiplier) as u64);
        std::cmp::min(delay, self.max_interval)
    }
}
