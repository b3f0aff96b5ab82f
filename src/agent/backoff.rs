//! Pure retry decisions for connecting and twin sync
//!
//! No I/O and no sleeping here: callers ask for a [`RetryDecision`] and act
//! on it, which keeps the schedule testable without a runtime.

use crate::config::{ReconnectSection, TwinSection};
use std::time::Duration;

/// Exponential backoff bounded by attempt count and maximum delay
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Connect and reconnect schedule
    pub fn reconnect(section: &ReconnectSection) -> Self {
        Self::new(
            section.max_attempts,
            Duration::from_millis(section.initial_delay_ms),
            Duration::from_millis(section.max_delay_ms),
        )
    }

    /// Twin sync schedule; delays are capped at eight times the base delay
    pub fn twin(section: &TwinSection) -> Self {
        let initial = Duration::from_millis(section.retry_delay_ms);
        Self::new(section.max_attempts, initial, initial.saturating_mul(8))
    }

    /// Delay before `attempt` (1-based). The first attempt is immediate.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Decide whether another attempt follows `failed_attempts` failures
    pub fn next_attempt(&self, failed_attempts: u32, shutdown_requested: bool) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::AbortShutdownRequested;
        }
        if failed_attempts >= self.max_attempts {
            return RetryDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = failed_attempts + 1;
        RetryDecision::Proceed {
            attempt,
            delay: self.delay_before(attempt),
        }
    }
}

/// Result of asking the policy for the next attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(5, Duration::from_millis(500), Duration::from_millis(3000))
    }

    #[test]
    fn test_first_attempt_is_immediate() {
        assert_eq!(
            policy().next_attempt(0, false),
            RetryDecision::Proceed {
                attempt: 1,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy();
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay_before(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_max_attempts_exceeded() {
        assert_eq!(
            policy().next_attempt(5, false),
            RetryDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_shutdown_wins() {
        assert_eq!(
            policy().next_attempt(0, true),
            RetryDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_large_attempt_numbers_do_not_overflow() {
        let policy = BackoffPolicy::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_before(200), Duration::from_secs(30));
    }

    #[test]
    fn test_policies_from_config() {
        let reconnect = BackoffPolicy::reconnect(&ReconnectSection::default());
        assert_eq!(reconnect.max_attempts, 10);
        assert_eq!(reconnect.delay_before(2), Duration::from_millis(500));
        assert_eq!(reconnect.max_delay, Duration::from_secs(30));

        let twin = BackoffPolicy::twin(&TwinSection::default());
        assert_eq!(twin.max_attempts, 3);
        assert_eq!(twin.delay_before(3), Duration::from_secs(2));
    }
}
