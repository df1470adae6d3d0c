//! Token-bucket pacing for the dispatch loop.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};

/// Token bucket refilled at `rate` tokens per second with one second's worth
/// of burst capacity.
///
/// The dispatch loop calls [`take`](Self::take) before every probe; the call
/// suspends until a token is available, which is what holds the sustained
/// packet rate at the configured ceiling. Each scan pass gets its own
/// instance so the verification pass does not inherit a drained bucket.
pub struct RateLimiter {
    bucket: DefaultDirectRateLimiter,
    rate: u32,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        let rate = NonZeroU32::new(rate.max(1)).unwrap();
        let quota = Quota::per_second(rate).allow_burst(rate);
        Self {
            bucket: GovernorRateLimiter::direct(quota),
            rate: rate.get(),
        }
    }

    /// Wait until the next probe may be sent.
    pub async fn take(&self) {
        self.bucket.until_ready().await;
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("rate", &self.rate).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn sustained_rate_is_capped() {
        let limiter = RateLimiter::new(50);

        let start = Instant::now();
        // Twice the bucket: the first 50 ride the burst allowance, the
        // second 50 must wait out a full second of refill.
        for _ in 0..100 {
            limiter.take().await;
        }
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(900), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn burst_capacity_is_one_second() {
        let limiter = RateLimiter::new(200);

        let start = Instant::now();
        for _ in 0..200 {
            limiter.take().await;
        }
        // A full second's worth should pass without throttling.
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn zero_rate_is_clamped() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.rate(), 1);
    }
}
