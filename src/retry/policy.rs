use std::time::Duration;

use rand::Rng;

pub(crate) trait RetryPolicy {
    /// The delay before the next attempt after `n_failures` failed attempts
    /// in a row.
    fn delay(
        &self,
        n_failures: u32,
    ) -> Duration;
}

/// Exponential backoff with a cap and an additive uniform jitter. Retries are
/// never given up.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ExponentialBackOff {
    base: Duration,
    max: Duration,
    // Exclusive upper bound of the jitter
    max_jitter: Duration,
}

impl ExponentialBackOff {
    pub(crate) fn new(
        base: Duration,
        max: Duration,
        max_jitter: Duration,
    ) -> Self {
        Self {
            base,
            max,
            max_jitter,
        }
    }

    pub(crate) fn base(&self) -> Duration {
        self.base
    }

    pub(crate) fn max(&self) -> Duration {
        self.max
    }

    pub(crate) fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    /// The backoff without jitter: `base * 2^(n_failures - 1)`, capped at
    /// `max`.
    pub(crate) fn backoff(
        &self,
        n_failures: u32,
    ) -> Duration {
        let factor = 1u32
            .checked_shl(n_failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    fn jitter(&self) -> Duration {
        let max_jitter_us = self.max_jitter.as_micros() as u64;
        if max_jitter_us == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..max_jitter_us))
    }
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(1),
            Duration::from_millis(500),
            Duration::from_millis(50),
        )
    }
}

impl RetryPolicy for ExponentialBackOff {
    fn delay(
        &self,
        n_failures: u32,
    ) -> Duration {
        self.backoff(n_failures) + self.jitter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let policy = ExponentialBackOff::default();
        let backoffs: Vec<_> = (1..=11)
            .map(|n| policy.backoff(n).as_millis())
            .collect();
        assert_eq!(
            backoffs,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 500, 500]
        );
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_stays_within_jitter_bounds() {
        let policy = ExponentialBackOff::default();
        // Ensure no flakiness
        for n in 1..20 {
            let delay = policy.delay(n);
            assert!(delay >= policy.backoff(n));
            assert!(delay < policy.backoff(n) + Duration::from_millis(50));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = ExponentialBackOff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::ZERO,
        );
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(5), Duration::from_millis(100));
    }
}
