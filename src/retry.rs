//! Retry policy and per-sequence attempt tracking.
//!
//! One policy value is shared by configuration, but every retry sequence
//! (each connect cycle, each in-flight command) owns its own
//! [`RetrySchedule`] so attempt counters are never shared across callers.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

/// Exponential backoff policy with jitter.
///
/// `delay(attempt) = min(max_delay, base_delay * multiplier^attempt)`
/// scaled by a factor uniformly drawn from `1 ± jitter_ratio`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the computed delay, in `0.0..1.0`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Validate the policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::JitterOutOfRange(self.jitter_ratio));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::MultiplierTooSmall(self.backoff_multiplier));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` completed tries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay for the given attempt number, with jitter sampled
    /// from the thread-local RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_for_with_jitter(attempt, jitter)
    }

    /// Deterministic variant of [`delay_for`](Self::delay_for).
    ///
    /// `jitter` is the pre-sampled unit factor in `-1.0..=1.0`; the final
    /// delay is scaled by `1.0 + jitter * jitter_ratio`.
    pub fn delay_for_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let raw_ms = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max_delay.as_secs_f64() * 1000.0);

        let scale = 1.0 + jitter.clamp(-1.0, 1.0) * self.jitter_ratio;
        Duration::from_secs_f64((capped_ms * scale).max(0.0) / 1000.0)
    }

    /// Smallest delay the policy can produce for an attempt.
    pub fn min_delay_for(&self, attempt: u32) -> Duration {
        self.delay_for_with_jitter(attempt, -1.0)
    }

    /// Largest delay the policy can produce for an attempt.
    pub fn max_delay_for(&self, attempt: u32) -> Duration {
        self.delay_for_with_jitter(attempt, 1.0)
    }
}

/// Attempt counter for one retry sequence.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetrySchedule {
    /// Start a fresh sequence under the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consume one attempt.
    ///
    /// Returns the backoff delay to wait before the next try, or `None`
    /// once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.should_retry(self.attempt) {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Reset the counter, e.g. after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Whether the budget is exhausted.
    pub fn is_exhausted(&self) -> bool {
        !self.policy.should_retry(self.attempt)
    }
}
