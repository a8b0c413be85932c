//! Retry policy: decides between another attempt and terminal failure.

use std::time::Duration;

use rand::Rng;

/// What to do with a record whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-push after `delay` with the incremented failure count.
    Retry { retries: u32, delay: Duration },

    /// Give up: the record becomes `failed`.
    MarkFailed { retries: u32 },
}

/// Retry policy for failed attempts.
///
/// `delay = base_delay * multiplier^retries`, where `retries` is the count
/// *after* the failure being handled. With the defaults (1s, 2.0, 3 retries)
/// the re-pushes land after 2s, 4s and 8s, and the fourth failure is terminal.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,

    pub base_delay: Duration,

    pub multiplier: f64,

    /// Extra random delay, as a fraction of the computed delay (0.0 = off).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Backoff before the re-push that follows failure number `retries`.
    pub fn next_delay(&self, retries: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let mut delay_secs = base_secs * self.multiplier.powi(retries as i32);
        if self.jitter > 0.0 {
            delay_secs += delay_secs * rand::thread_rng().gen_range(0.0..self.jitter);
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// `retries` is the record's failure count before this failure.
    pub fn decide(&self, retries: u32) -> Decision {
        if retries < self.max_retries {
            let retries = retries + 1;
            Decision::Retry {
                retries,
                delay: self.next_delay(retries),
            }
        } else {
            Decision::MarkFailed { retries }
        }
    }
}
