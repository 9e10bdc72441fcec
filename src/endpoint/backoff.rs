//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Chooses how long to wait before reconnect attempt `attempt` (0-based).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with a cap and symmetric jitter.
///
/// `delay(n) = min(initial * multiplier^n, max) * (1 ± jitter)`, clamped to
/// `max` after jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction in `[0, 1)`; `0.0` disables jitter.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        // Cap the exponent; anything past 2^32 is already far beyond `max`.
        let exponent = attempt.min(32) as i32;
        let base = (self.initial.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max.as_secs_f64());

        let jitter_factor = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };

        std::cmp::min(Duration::from_secs_f64(base * jitter_factor), self.max)
    }
}

/// Fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl BackoffPolicy for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}
