//! Adaptive check interval.

use std::time::Duration;

/// Maps a consecutive-failure count to the delay before the next check.
///
/// Zero failures gives `min_interval`; each further failure doubles it,
/// capped at `max_interval`. Total over all `u32` inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min_interval: Duration,
    max_interval: Duration,
}

impl BackoffPolicy {
    /// Create a policy. A `max_interval` below `min_interval` is raised to it.
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
        }
    }

    /// Baseline interval used after any success
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Upper bound of the interval
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Interval to wait after `consecutive_failures` failed probes
    pub fn next_interval(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.min_interval;
        }

        1u32.checked_shl(consecutive_failures - 1)
            .and_then(|factor| self.min_interval.checked_mul(factor))
            .map_or(self.max_interval, |interval| interval.min(self.max_interval))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_schedule() {
        let policy = BackoffPolicy::default();
        let expected = [60, 60, 120, 240, 480, 960, 1920, 3600, 3600];

        for (failures, want) in expected.iter().enumerate() {
            assert_eq!(policy.next_interval(failures as u32), secs(*want), "failures={}", failures);
        }
    }

    #[test]
    fn test_bounded_and_monotonic() {
        let policy = BackoffPolicy::new(secs(7), secs(1000));
        let mut previous = policy.next_interval(0);
        assert_eq!(previous, secs(7));

        for failures in 1..200u32 {
            let interval = policy.next_interval(failures);
            assert!(interval <= secs(1000));
            assert!(interval >= secs(7));
            assert!(interval >= previous, "not monotonic at {}", failures);
            previous = interval;
        }
    }

    #[test]
    fn test_matches_closed_form_below_cap() {
        let policy = BackoffPolicy::new(secs(3), secs(u32::MAX as u64));
        for failures in 1..=20u32 {
            let want = secs(3 * 2u64.pow(failures - 1));
            assert_eq!(policy.next_interval(failures), want);
        }
    }

    #[test]
    fn test_saturates_on_huge_counts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_interval(32), secs(3600));
        assert_eq!(policy.next_interval(33), secs(3600));
        assert_eq!(policy.next_interval(u32::MAX), secs(3600));

        let huge = BackoffPolicy::new(Duration::MAX / 2, Duration::MAX);
        assert_eq!(huge.next_interval(3), Duration::MAX);
    }

    #[test]
    fn test_inverted_bounds() {
        let policy = BackoffPolicy::new(secs(60), secs(10));
        assert_eq!(policy.max_interval(), secs(60));
        assert_eq!(policy.next_interval(5), secs(60));
    }
}
