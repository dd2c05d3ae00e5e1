//! Bounded retry with exponential backoff for gateway and recorder calls.
//!
//! Nothing here sleeps. Callers record when the next attempt is due and try
//! again on the first tick at or after that time, so a failing executor never
//! stalls the loop that drives the others.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy, durations in milliseconds so it maps straight onto settings files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Randomisation factor, 0.2 = ±20%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, used where timing must be reproducible
    pub fn fixed(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: backoff_ms,
            max_backoff_ms: backoff_ms,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// True once `failures` consecutive failures used up the budget
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Delay before the attempt following failure number `failures` (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);
        Duration::from_millis(apply_jitter(capped, self.jitter).min(self.max_backoff_ms as f64) as u64)
    }
}

fn apply_jitter(backoff_ms: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 || backoff_ms <= 0.0 {
        return backoff_ms;
    }
    let spread = backoff_ms * jitter;
    let low = (backoff_ms - spread).max(0.0);
    rand::thread_rng().gen_range(low..=backoff_ms + spread)
}
