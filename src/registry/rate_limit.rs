//! Minimum spacing between calls to one registry.
//!
//! Public registries ask clients to stay polite; each client owns one
//! governor limiter and waits on it before every request. The limiter is
//! shared by every concurrent run using that client.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct PoliteLimiter {
    limiter: DirectLimiter,
    period: Duration,
}

impl std::fmt::Debug for PoliteLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoliteLimiter").field("period", &self.period).finish()
    }
}

impl PoliteLimiter {
    /// One request per `period`. A zero period falls back to one per second.
    pub fn new(period: Duration) -> Self {
        let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            limiter: DirectLimiter::direct(quota),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next permit.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn second_call_waits_for_period() {
        let limiter = PoliteLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn zero_period_is_tolerated() {
        let limiter = PoliteLimiter::new(Duration::ZERO);
        assert_eq!(limiter.period(), Duration::ZERO);
    }
}
