//! Bounded exponential backoff for adapter calls.
//!
//! Retries happen at the adapter boundary only: a transient failure never
//! restarts the saga, and a failure that survives the retry budget
//! escalates to compensation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AdapterError;

/// Retry configuration for one adapter call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Multiplier applied per retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay before a given retry (1-based: the delay taken
    /// after attempt `retry` failed).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi((retry - 1) as i32);
        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }
}

/// Runs `operation`, retrying transient failures with bounded backoff.
///
/// Non-transient errors and the last transient error after the budget is
/// exhausted are returned to the caller unchanged.
///
/// # Errors
///
/// Whatever `operation` last returned.
pub fn with_retries<T>(
    config: &RetryConfig,
    op_name: &str,
    mut operation: impl FnMut() -> Result<T, AdapterError>,
) -> Result<T, AdapterError> {
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = config.delay_for_retry(attempt);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend failure, backing off"
                );
                std::thread::sleep(delay);
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}
