//! When a failed conversion runs again, and after how long.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Growth of the delay from one failed attempt to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// Doubles after every failure, up to `max_delay`.
    #[default]
    Exponential,
}

/// Retry budget of a file task.
///
/// Only transient conversion errors are retried. `max_attempts` counts the
/// first run, so a task is tried at most `max_attempts` times in total. The
/// same delays pace redeliveries while the store or queue is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Random spread applied to every delay, as a fraction of it (0.0-1.0),
    /// so tasks that failed together do not come back together.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` runs, `delay` apart, without jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether a task whose `attempt` (1-based) just failed may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait before the run that follows failed `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let nominal = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32 << attempt.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay);

        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64((1.0 + spread).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        }
        .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn fixed_delay_never_changes() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(25));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(25));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1000)).with_jitter(0.2);
        for _ in 0..100 {
            let ms = policy.delay_for_attempt(1).as_millis();
            assert!((800..=1200).contains(&ms), "delay {ms}ms out of range");
        }
    }

    #[test]
    fn max_attempts_counts_the_first_run() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        assert!(!RetryPolicy::fixed(1, Duration::ZERO).should_retry(1));
    }
}
