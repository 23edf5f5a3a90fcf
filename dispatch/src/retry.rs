//! Retry policy consulted by the scheduler and the external bridges.
//!
//! A single value object replaces scattered ad-hoc retry loops: the
//! scheduler asks it whether an item has attempts left, and bridges use the
//! backoff schedule for transient external failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base delay for the exponential backoff schedule in milliseconds.
const BACKOFF_BASE_MS: u64 = 100;

/// Cap on a single backoff delay.
const BACKOFF_MAX_MS: u64 = 30_000;

/// Backoff shape applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// Fixed delay in milliseconds.
    Fixed(u64),
    /// Exponential doubling from `BACKOFF_BASE_MS`, capped.
    Exponential,
}

/// Bounded-retry policy for work items and external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum dispatch attempts before an item is forced to Failed.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Whether another attempt is allowed after `attempt` completed tries.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether `attempt` completed tries means the item is out of budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        !self.allows(attempt)
    }

    /// Delay to wait before the given 1-indexed attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(ms) => Duration::from_millis(ms),
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                let ms = BACKOFF_BASE_MS.saturating_mul(1 << shift).min(BACKOFF_MAX_MS);
                Duration::from_millis(ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(policy.exhausted(3));
        assert!(policy.exhausted(7));
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Backoff::Exponential);
        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
        // Far past the cap
        assert_eq!(policy.delay_before(30), Duration::from_millis(30_000));
    }

    #[test]
    fn test_fixed_and_none_backoff() {
        assert_eq!(
            RetryPolicy::new(1, Backoff::Fixed(250)).delay_before(5),
            Duration::from_millis(250)
        );
        assert_eq!(
            RetryPolicy::new(1, Backoff::None).delay_before(5),
            Duration::ZERO
        );
    }
}
