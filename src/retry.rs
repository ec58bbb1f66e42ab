use rand::Rng;
use std::time::Duration;

use crate::config::Jobs;

/// Exponential backoff for transient provider failures: base * 2^attempt,
/// jittered by +/- `jitter` and capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub const DEFAULT_JITTER: f64 = 0.2;

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Self::DEFAULT_JITTER,
        }
    }

    pub fn from_config(jobs: &Jobs) -> Self {
        Self::new(
            Duration::from_millis(jobs.backoff_base_ms),
            Duration::from_secs(jobs.max_backoff_seconds),
        )
    }

    /// Retry immediately; used by tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(0), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(16));
        assert_eq!(policy.nominal_delay(8), Duration::from_secs(300));
        assert_eq!(policy.nominal_delay(40), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(6_400), "{d:?}");
            assert!(d <= Duration::from_millis(9_600), "{d:?}");
        }
        for _ in 0..50 {
            assert!(policy.delay_for(10) <= Duration::from_secs(300));
        }
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }
}
