//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * 2^(attempt - 1)`, capped.
    Exponential,
}

/// Backoff configuration for failed tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,

    /// Delay for the first retry.
    pub base_delay: Duration,

    /// Ceiling for exponential growth.
    pub max_delay: Duration,

    /// Apply ±10% jitter to the computed delay. Off by default; adapters
    /// that fan many workers onto one queue switch it on to avoid
    /// thundering-herd redelivery.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts already
    /// made (1-indexed).
    ///
    /// Exponential growth saturates instead of overflowing: with a large
    /// enough attempt number the multiplier pins to `u32::MAX` and the cap
    /// takes over.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Exponential => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay
                    .checked_mul(multiplier)
                    .unwrap_or(self.max_delay)
            }
        };
        let capped = raw.min(self.max_delay);
        if self.jitter { jittered(capped) } else { capped }
    }
}

/// ±10% uniform jitter.
fn jittered(delay: Duration) -> Duration {
    let factor = 0.9 + 0.2 * rand::random::<f64>();
    delay.mul_f64(factor)
}
