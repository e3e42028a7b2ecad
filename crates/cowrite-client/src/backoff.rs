//! Reconnect backoff: exponential with full jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Upper bound of the next delay: `min(cap, base * 2^attempt)`
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32 << self.attempt.min(20);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Draw the next delay uniformly from `[0, ceiling]`
    pub fn next_delay(&mut self) -> Duration {
        let unit: f64 = rand::thread_rng().gen();
        self.next_delay_with(unit)
    }

    /// Like [`next_delay`](Self::next_delay) with the random draw supplied
    pub fn next_delay_with(&mut self, unit: f64) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        ceiling.mul_f64(unit.clamp(0.0, 1.0))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10))
    }
}
