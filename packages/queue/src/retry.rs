// ABOUTME: Exponential backoff between retry attempts
// ABOUTME: Delay doubles per attempt and is capped

use runhub_config::QueueConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base: config.backoff_base,
            factor: 2,
            max: config.backoff_max,
        }
    }

    /// Delay before the next attempt after `attempt` failed (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self
            .factor
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
