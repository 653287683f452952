//! Backoff and attempt counting for reconnection.
//!
//! [`ReconnectPolicy`] is a pure function of [`BackoffState`] and a
//! [`ReconnectConfig`]; it never sleeps or touches a socket. The
//! connection driver asks it for the next delay after every transport
//! loss and stops retrying once it reports exhaustion.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Attempt bookkeeping for one connection.
///
/// Reset to `attempt = 0` on every successful open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Reconnect attempts scheduled since the last successful open
    pub attempt: u32,
    /// Delay used for the most recently scheduled attempt
    pub last_delay: Duration,
}

impl BackoffState {
    /// Clear attempt counting after a successful open or a manual reconnect.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Capped exponential backoff with an optional attempt limit.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    /// Create a policy from configuration
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Get the underlying configuration
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    ///
    /// `min(base * decay^attempt, max)`, optionally with full jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.base_delay.as_millis() as f64
            * self.config.decay_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.config.max_delay.as_millis() as f64);

        if self.config.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    /// Whether another reconnect attempt is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.config.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    /// Schedule the next attempt, or `None` once the policy is exhausted.
    pub fn next_delay(&self, state: &mut BackoffState) -> Option<Duration> {
        if !self.should_retry(state.attempt) {
            return None;
        }
        let delay = self.delay(state.attempt);
        state.attempt += 1;
        state.last_delay = delay;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential() -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig::default())
    }

    #[test]
    fn test_observed_delay_sequence() {
        let policy = exponential();
        assert_eq!(policy.delay(0), Duration::from_millis(3000));
        assert_eq!(policy.delay(1), Duration::from_millis(4500));
        assert_eq!(policy.delay(2), Duration::from_millis(6750));
    }

    #[test]
    fn test_delays_monotonic_and_capped() {
        let policy = exponential();
        let max = policy.config().max_delay;
        let max_attempts = policy.config().max_attempts.unwrap_or(10);

        for attempt in 0..max_attempts {
            assert!(policy.delay(attempt) <= max);
            if attempt + 1 < max_attempts {
                assert!(policy.delay(attempt + 1) >= policy.delay(attempt));
            }
        }
        assert_eq!(policy.delay(50), max);
    }

    #[test]
    fn test_should_retry_respects_limit() {
        let policy = exponential();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_flat_policy_never_exhausts() {
        let policy = ReconnectPolicy::new(ReconnectConfig::flat(Duration::from_secs(3)));
        for attempt in [0, 1, 10, 1_000, u32::MAX - 1] {
            assert!(policy.should_retry(attempt));
            assert_eq!(policy.delay(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_next_delay_counts_attempts() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        });
        let mut state = BackoffState::default();

        assert_eq!(policy.next_delay(&mut state), Some(Duration::from_millis(3000)));
        assert_eq!(policy.next_delay(&mut state), Some(Duration::from_millis(4500)));
        assert_eq!(state.attempt, 2);
        assert_eq!(state.last_delay, Duration::from_millis(4500));
        assert_eq!(policy.next_delay(&mut state), None);

        state.reset();
        assert_eq!(state, BackoffState::default());
        assert!(policy.next_delay(&mut state).is_some());
    }

    #[test]
    fn test_jitter_stays_below_cap() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            jitter: true,
            ..ReconnectConfig::default()
        });

        for attempt in 0..5 {
            let delay = policy.delay(attempt);
            let max_expected =
                Duration::from_millis((3000.0 * 1.5_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }
}
