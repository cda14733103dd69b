//! Failure backoff for the watch loop.

use std::time::Duration;

/// Delay before the next sync attempt after `failures` consecutive
/// failures: `interval * 2^failures`, capped at `max`.
///
/// `failures == 0` means healthy — no delay.
#[must_use]
pub fn backoff_delay(failures: u32, interval: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    interval.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    const INTERVAL: Duration = Duration::from_secs(30);
    const MAX: Duration = Duration::from_secs(900);

    #[test]
    fn healthy_repo_has_no_delay() {
        assert_eq!(backoff_delay(0, INTERVAL, MAX), Duration::ZERO);
    }

    #[test]
    fn doubles_until_the_cap() {
        assert_eq!(backoff_delay(1, INTERVAL, MAX), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, INTERVAL, MAX), Duration::from_secs(120));
        assert_eq!(backoff_delay(3, INTERVAL, MAX), Duration::from_secs(240));
        assert_eq!(backoff_delay(10, INTERVAL, MAX), MAX);
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        assert_eq!(backoff_delay(u32::MAX, INTERVAL, MAX), MAX);
    }

    proptest! {
        #[test]
        fn monotonic_and_bounded(failures in 0u32..64) {
            let d = backoff_delay(failures, INTERVAL, MAX);
            let next = backoff_delay(failures + 1, INTERVAL, MAX);
            prop_assert!(next >= d);
            prop_assert!(d <= MAX);
        }
    }
}
