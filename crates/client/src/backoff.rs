// Exponential backoff shared by reconnection and per-action retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction in [0, 1] of each delay that may be randomly shaved off.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for a 0-based attempt: `min(base · 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31); // cap exponent to avoid overflow
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    /// `delay(attempt)` reduced by a random share of at most `jitter`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let shave = rng.gen_range(0.0..=jitter);
        delay.mul_f64(1.0 - shave)
    }

    /// Whether `failures` consecutive failures exhaust the policy.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
