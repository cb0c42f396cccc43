//! Retry logic and reconnect backoff

use super::TetherError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt. Never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        let delay = Duration::from_millis(capped_ms as u64);

        if self.jitter {
            // Up to 20% jitter, still capped
            let jitter_range = delay.as_millis() as u64 / 5;
            let jitter = fastrand::u64(0..=jitter_range);
            (delay + Duration::from_millis(jitter)).min(self.max_delay)
        } else {
            delay
        }
    }

    /// Check if an error should be retried. Permanent errors never are.
    pub fn should_retry(&self, error: &TetherError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        !error.is_permanent() && error.is_retriable()
    }
}

/// Retry a future operation according to the retry policy
pub async fn retry_async<F, Fut, T>(mut operation: F, policy: &RetryPolicy) -> Result<T, TetherError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TetherError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.should_retry(&error, attempt) {
                    if error.is_permanent() {
                        warn!("Operation failed permanently, not retrying: {}", error);
                    } else {
                        warn!("Operation failed and will not be retried: {}", error);
                    }
                    return Err(error);
                }

                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt, policy.max_attempts, delay, error
                );
                sleep(delay).await;
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
