//! Exponential backoff policy for reconnection.

use std::time::Duration;

/// Reconnection policy: bounded attempts with exponential delay.
///
/// `delay = min(base · 2^(attempt − 1), max)`. The attempt counter resets
/// to zero when the session reaches `Ready`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempt: 0,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based). Attempt 0 maps to the base
    /// delay so callers can't underflow the exponent.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        scaled.min(self.max_delay)
    }

    /// True once the attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Reset the attempt counter (on reaching `Ready` or explicit connect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(16));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(7), Duration::from_secs(30));
    }

    #[test]
    fn delay_is_non_decreasing() {
        let policy = ReconnectPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..=40 {
            let d = policy.delay(attempt);
            assert!(d >= prev, "delay decreased at attempt {attempt}");
            prev = d;
        }
    }

    #[test]
    fn delay_never_exceeds_max() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(750),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        for attempt in 1..=64 {
            assert!(policy.delay(attempt) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn attempt_zero_does_not_underflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), policy.base_delay);
    }

    #[test]
    fn exhaustion_and_reset() {
        let mut policy = ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(!policy.exhausted());
        policy.attempt = 2;
        assert!(policy.exhausted());
        policy.reset();
        assert_eq!(policy.attempt, 0);
        assert!(!policy.exhausted());
    }
}
