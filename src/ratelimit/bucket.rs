//! Token bucket
//!
//! Tokens are bytes. The bucket fills at `rate` bytes per second up to a burst
//! of one `period` worth of tokens. A rate of 0 means unlimited.

use std::time::Duration;

use tokio::time::Instant;

/// Token bucket for one direction of one layer
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: u64,
    period: Duration,
    /// May go negative after an oversize consume; the debt is repaid by refills
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate: u64, period: Duration) -> Self {
        let mut bucket = Self {
            rate,
            period,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        bucket.tokens = bucket.capacity();
        bucket
    }

    /// Unlimited bucket
    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(1))
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Burst size in bytes
    pub fn capacity(&self) -> f64 {
        (self.rate as f64 * self.period.as_secs_f64()).max(1.0)
    }

    /// Change the fill rate; the current level is clamped to the new capacity
    pub fn set_rate(&mut self, rate: u64) {
        self.refill(Instant::now());
        self.rate = rate;
        self.tokens = self.tokens.min(self.capacity());
    }

    /// Extend the burst window
    pub fn set_period(&mut self, period: Duration) {
        self.refill(Instant::now());
        self.period = period;
        self.tokens = self.tokens.min(self.capacity());
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        if self.is_unlimited() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate as f64).min(self.capacity());
    }

    /// Time until `bytes` could be taken; zero when it can be taken now.
    ///
    /// Requests larger than the burst are admitted once the bucket is full.
    pub fn wait_time(&mut self, bytes: u64) -> Duration {
        self.wait_time_at(bytes, Instant::now())
    }

    fn wait_time_at(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        self.refill(now);
        let needed = (bytes as f64).min(self.capacity());
        if self.tokens >= needed {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((needed - self.tokens) / self.rate as f64)
    }

    /// Take tokens without waiting; the level may go negative
    pub fn consume(&mut self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }
        self.refill(Instant::now());
        self.tokens -= bytes as f64;
    }

    /// Take tokens only if available
    pub fn try_consume(&mut self, bytes: u64) -> bool {
        if self.wait_time(bytes).is_zero() {
            self.consume(bytes);
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let mut bucket = TokenBucket::unlimited();
        assert!(bucket.try_consume(u64::MAX / 2));
        assert_eq!(bucket.wait_time(1 << 40), Duration::ZERO);
    }

    #[test]
    fn test_burst_then_wait() {
        let mut bucket = TokenBucket::new(1000, Duration::from_secs(2));
        assert_eq!(bucket.capacity(), 2000.0);
        assert!(bucket.try_consume(1500));
        assert!(!bucket.try_consume(1500));
        let wait = bucket.wait_time(1500);
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_millis(1000));
    }

    #[test]
    fn test_refill_over_time() {
        let mut bucket = TokenBucket::new(1000, Duration::from_secs(1));
        let start = Instant::now();
        bucket.last_refill = start;
        bucket.tokens = 0.0;
        assert_eq!(bucket.wait_time_at(500, start + Duration::from_millis(500)), Duration::ZERO);
    }

    #[test]
    fn test_oversize_request_admitted_when_full() {
        let mut bucket = TokenBucket::new(100, Duration::from_secs(1));
        assert_eq!(bucket.wait_time(16384), Duration::ZERO);
        bucket.consume(16384);
        assert!(bucket.available() < 0.0);
        assert!(bucket.wait_time(1) > Duration::from_secs(100));
    }

    #[test]
    fn test_set_rate_clamps() {
        let mut bucket = TokenBucket::new(10_000, Duration::from_secs(1));
        bucket.set_rate(100);
        assert!(bucket.available() <= 100.0);
        bucket.set_rate(0);
        assert!(bucket.is_unlimited());
        assert!(bucket.try_consume(1_000_000));
    }
}
