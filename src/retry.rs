//! Exponential-backoff retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 16;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Base delay for the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Whether to add up to 25% jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            use_jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before retry number `attempt` (1-based).
    ///
    /// The n-th retry waits `base × 2^(n-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        if self.use_jitter {
            let jitter = base.mul_f64(0.25 * rand::random::<f64>());
            (base + jitter).min(self.max_delay)
        } else {
            base
        }
    }

    /// Check if another retry should be attempted after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_respects_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(600),
            use_jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(12));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(24));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 32,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            use_jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
        // Large attempt numbers must not overflow.
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(600),
            use_jitter: true,
        };
        for _ in 0..32 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(5));
        }
    }
}
