//! Retry and backoff policy.
//!
//! Attempt numbering is 1-based: `delay_for_attempt(1)` is the wait before
//! the first retry. Delays grow exponentially from `initial_delay` and are
//! capped at `max_delay` before jitter is applied.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomisation applied to each computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Exact delays. Used by tests.
    None,
    /// Uniform in `[delay/2, delay]`: keeps a floor while spreading clients out.
    #[default]
    Equal,
}

impl Jitter {
    /// Apply this jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Equal => {
                let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                if ms < 2 {
                    return delay;
                }
                let half = ms / 2;
                Duration::from_millis(rand::thread_rng().gen_range(half..=ms))
            }
        }
    }
}

/// Bounded exponential retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Randomisation of each delay
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: Jitter::Equal,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with the given bounds.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Reconnect policy: retries forever, base 1s, cap 30s.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Jitter::Equal,
        }
    }

    /// No retry at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Override the jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay before retry number `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        if !capped.is_finite() || capped < 0.0 {
            return self.max_delay;
        }
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt`, jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.base_delay(attempt))
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
