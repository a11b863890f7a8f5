//! Delays between retry attempts.

use std::time::Duration;

use rand::Rng;

/// Bounds for a retry loop: how often, and how long between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
    };

    /// A policy that never sleeps, for deterministic tests.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The delay before the attempt following attempt number `attempt`
/// (1-based), without jitter: base doubled per attempt, capped at
/// `max_delay`.
pub(super) fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    policy
        .base_delay
        .saturating_mul(1 << exponent)
        .min(policy.max_delay)
}

/// Full jitter, a uniform draw over (0, delay].
pub(super) fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }

    Duration::from_millis(rand::rng().random_range(1..=delay.as_millis() as u64))
}
