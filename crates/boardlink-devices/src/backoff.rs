/*!
 * Exponential reconnection backoff.
 */
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Random extra delay of at most this much
    pub jitter: Duration,
    /// Consecutive failures before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(3200),
            jitter: Duration::ZERO,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for `attempt` without jitter: `min(initial * 2^attempt, max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether `failures` consecutive failures exhaust the policy
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Stateful delay sequence for one device
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Start a sequence at attempt zero
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Next delay; never shorter than the previous one nor above `max_delay`
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.policy.base_delay(self.attempt);
        if !self.policy.jitter.is_zero() {
            let jitter_ms = self.policy.jitter.as_millis() as u64;
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }
        let delay = delay.max(self.last).min(self.policy.max_delay);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the initial delay, after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// The policy driving this sequence
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(delays: &[Duration]) -> Vec<u128> {
        delays.iter().map(Duration::as_millis).collect()
    }

    #[test]
    fn test_doubling_sequence_caps_and_resets() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let delays: Vec<Duration> = (0..7).map(|_| backoff.next_delay()).collect();
        assert_eq!(millis(&delays), vec![100, 200, 400, 800, 1600, 3200, 3200]);
        assert_eq!(backoff.attempt(), 7);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_monotonic_and_bounded() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(500),
            ..ReconnectPolicy::default()
        };
        let max = policy.max_delay;
        let mut backoff = Backoff::new(policy);
        let mut previous = Duration::ZERO;
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(40), policy.max_delay);
        assert_eq!(policy.base_delay(u32::MAX), policy.max_delay);
        assert!(policy.exhausted(10));
        assert!(!policy.exhausted(9));
    }
}
