//! Exponential backoff with full jitter for store sync failures.
//!
//! Failure count `0` means the last attempt succeeded (no extra delay);
//! the first failure waits one sync interval, then each further failure
//! doubles it up to eight intervals. Jitter spreads instances that lost the
//! store at the same moment.
//!
//! ```rust
//! use std::time::Duration;
//! use floodgate::backoff::SyncBackoff;
//!
//! let backoff = SyncBackoff::for_interval(Duration::from_secs(10));
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_secs(10));
//! assert_eq!(backoff.delay(3), Duration::from_secs(40));
//! assert_eq!(backoff.delay(9), Duration::from_secs(80)); // capped
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay schedule applied after consecutive sync failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBackoff {
    base: Duration,
    max: Duration,
}

impl SyncBackoff {
    /// Schedule derived from a sync interval: starts at the interval, caps at 8×.
    pub fn for_interval(interval: Duration) -> Self {
        let base = interval.max(Duration::from_millis(1)).min(MAX_BACKOFF);
        let max = base.checked_mul(8).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);
        Self { base, max }
    }

    /// Un-jittered delay after `failures` consecutive failures.
    pub fn delay(&self, failures: usize) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        delay.min(self.max)
    }

    /// Delay uniformly drawn from `[0, delay(failures)]`.
    pub fn jittered(&self, failures: usize) -> Duration {
        self.jittered_with_rng(failures, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing).
    pub fn jittered_with_rng<R: Rng>(&self, failures: usize, rng: &mut R) -> Duration {
        let millis: u64 = self.delay(failures).as_millis().try_into().unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(0..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn degenerate_intervals_stay_usable() {
        let zero = SyncBackoff::for_interval(Duration::ZERO);
        assert_eq!(zero.delay(1), Duration::from_millis(1));
        assert_eq!(zero.delay(9), Duration::from_millis(8));

        let huge = SyncBackoff::for_interval(Duration::from_secs(u64::MAX));
        assert_eq!(huge.delay(1), MAX_BACKOFF);
        assert_eq!(huge.delay(3), MAX_BACKOFF);
    }

    #[test]
    fn doubles_until_capped() {
        let b = SyncBackoff::for_interval(Duration::from_secs(10));
        assert_eq!(b.delay(1), Duration::from_secs(10));
        assert_eq!(b.delay(2), Duration::from_secs(20));
        assert_eq!(b.delay(4), Duration::from_secs(80));
        assert_eq!(b.delay(5), Duration::from_secs(80));
        assert_eq!(b.delay(usize::MAX), Duration::from_secs(80));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = SyncBackoff::for_interval(Duration::from_millis(100));
        let mut rng = StdRng::seed_from_u64(7);
        for failures in 1..10 {
            let d = b.jittered_with_rng(failures, &mut rng);
            assert!(d <= b.delay(failures));
        }
        assert_eq!(b.jittered(0), Duration::ZERO);
    }
}
