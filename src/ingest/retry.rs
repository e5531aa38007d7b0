// src/ingest/retry.rs
use std::time::Duration;

use rand::Rng;

/// Fixed-attempt retry with exponential backoff and jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

pub trait BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before jitter is applied.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        // Uniform in [nominal * (1 - jitter), nominal]
        let factor = rand::rng().random_range((1.0 - jitter)..=1.0);
        nominal.mul_f64(factor)
    }
}
