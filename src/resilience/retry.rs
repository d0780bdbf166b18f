//! Retry policy with capped exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for failed provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each delay (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry` (0-indexed)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }

    /// Delay before retry number `retry`, with jitter applied
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        base.mul_f64(factor)
    }

    /// Check if another retry is allowed after `retries_done` retries
    pub fn should_retry(&self, retries_done: u32, max_retries: u32) -> bool {
        retries_done < max_retries
    }
}
