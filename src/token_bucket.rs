//! Single-permit token bucket.
//!
//! Each bucket refills continuously at `rate` permits per second and holds at
//! most one permit, so a client is granted at most one admission per `1/rate`
//! seconds. Waiting never reserves a future permit: a caller that would have
//! to wait past its deadline gives up immediately and leaves the bucket
//! untouched, and a caller dropped mid-wait has consumed nothing.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Burst capacity of every bucket.
pub const CAPACITY: f64 = 1.0;

// Float refill can land a hair under a whole permit after sleeping exactly the
// computed wait.
const EPSILON: f64 = 1e-9;

/// Outcome of [`TokenBucket::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A permit was consumed.
    Granted,
    /// No permit could be obtained before the deadline.
    TimedOut,
}

impl Acquire {
    /// Helper to check if granted.
    pub fn is_granted(self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Rate-limited gate for one (client, endpoint) pair.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket refilling at `rate` permits per second.
    ///
    /// Zero, negative and non-finite rates are accepted; such a bucket grants
    /// its initial permit and never refills.
    pub fn new(rate: f64) -> Self {
        Self { rate, state: Mutex::new(BucketState { tokens: CAPACITY, last_refill: Instant::now() }) }
    }

    /// Create a bucket from an integer requests-per-second limit.
    pub fn per_second(rps: u32) -> Self {
        Self::new(f64::from(rps))
    }

    /// Configured refill rate in permits per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refills(&self) -> bool {
        self.rate > 0.0 && self.rate.is_finite()
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now <= state.last_refill {
            return;
        }
        if self.refills() {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate).min(CAPACITY);
        }
        state.last_refill = now;
    }

    /// Take a permit at `now`, or report how long until one is due.
    ///
    /// `Err(None)` means the bucket will never refill.
    fn take_at(&self, now: Instant) -> Result<(), Option<Duration>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        if state.tokens + EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            return Ok(());
        }
        if !self.refills() {
            return Err(None);
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::try_from_secs_f64(missing / self.rate).ok())
    }

    /// Take a permit only if one is available right now.
    pub fn try_acquire_now(&self) -> bool {
        self.take_at(Instant::now()).is_ok()
    }

    /// Wait for a permit until `deadline`.
    ///
    /// Only the calling task is suspended. Returns [`Acquire::TimedOut`] as soon
    /// as it is clear no permit can be obtained in time.
    pub async fn try_acquire(&self, deadline: Instant) -> Acquire {
        loop {
            let now = Instant::now();
            match self.take_at(now) {
                Ok(()) => return Acquire::Granted,
                Err(None) => return Acquire::TimedOut,
                Err(Some(wait)) => {
                    if now.checked_add(wait).map_or(true, |due| due > deadline) {
                        return Acquire::TimedOut;
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Wait at most `max_wait` for a permit.
    pub async fn acquire_within(&self, max_wait: Duration) -> Acquire {
        let now = Instant::now();
        let deadline = now.checked_add(max_wait).unwrap_or(now);
        self.try_acquire(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn starts_with_one_permit() {
        let bucket = TokenBucket::per_second(2);
        assert!(bucket.try_acquire_now());
        assert!(!bucket.try_acquire_now());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_after_one_over_rate() {
        let bucket = TokenBucket::per_second(4);
        assert!(bucket.try_acquire_now());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!bucket.try_acquire_now(), "only 200ms of a 250ms interval elapsed");

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(bucket.try_acquire_now());
    }

    #[tokio::test(start_paused = true)]
    async fn never_holds_more_than_capacity() {
        let bucket = TokenBucket::per_second(10);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_acquire_now());
        assert!(!bucket.try_acquire_now(), "a long idle period must not bank permits");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill_within_deadline() {
        let bucket = TokenBucket::per_second(2);
        assert!(bucket.try_acquire_now());

        let start = Instant::now();
        let outcome = bucket.acquire_within(Duration::from_secs(3)).await;
        assert_eq!(outcome, Acquire::Granted);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_consuming() {
        let bucket = TokenBucket::per_second(1);
        assert!(bucket.try_acquire_now());

        let outcome = bucket.acquire_within(Duration::from_millis(100)).await;
        assert_eq!(outcome, Acquire::TimedOut);

        // The timed-out attempt must not have borrowed against the next permit.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire_now());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_wait_is_an_immediate_decision() {
        let bucket = TokenBucket::per_second(2);
        assert!(bucket.acquire_within(Duration::ZERO).await.is_granted());
        assert!(!bucket.acquire_within(Duration::ZERO).await.is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_and_negative_rates_grant_only_the_initial_permit() {
        for rate in [0.0, -3.0, f64::NAN] {
            let bucket = TokenBucket::new(rate);
            assert!(bucket.try_acquire_now());
            tokio::time::advance(Duration::from_secs(10)).await;
            assert_eq!(bucket.acquire_within(Duration::from_secs(5)).await, Acquire::TimedOut);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_refills() {
        let bucket = Arc::new(TokenBucket::per_second(10));
        assert!(bucket.try_acquire_now());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let b = bucket.clone();
            handles.push(tokio::spawn(async move { b.acquire_within(Duration::from_secs(1)).await }));
        }
        let granted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Acquire::Granted)))
            .count();
        assert_eq!(granted, 5, "five permits refill within one second at 10/s");
    }
}
