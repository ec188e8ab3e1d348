//! Submission retry policy: capped exponential backoff with jitter.
//!
//! Backoff state (attempt count, next-eligible time) is data on the order
//! entity, not call-stack recursion — see [`crate::Order::submit_attempts`]
//! and [`crate::Order::next_attempt_at`]. This module only computes delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff parameters for broker submission retries.
///
/// `jitter_ms = 0` makes the schedule fully deterministic (tests rely on
/// this); any positive value adds uniform random jitter up to that bound so
/// a fleet of workers does not retry in lockstep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total submission attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, capped at `max_delay_ms`, plus jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// `true` if another attempt is permitted after `attempts` tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
