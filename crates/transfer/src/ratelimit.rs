use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Grants permission to move bytes.
///
/// Shared by every worker of a transfer, so implementations must be safe to
/// call concurrently.
pub trait RateLimiter: Send + Sync {
    /// Asks whether `want` bytes may be transferred now.
    ///
    /// Returns `(true, _)` when granted. Otherwise returns `(false, wait)`,
    /// where `wait` is how long the caller should sleep before asking again.
    fn acquire(&self, want: u64) -> (bool, Duration);
}

/// Token-bucket rate limiter.
///
/// Refills at `rate` bytes per second up to `capacity`. A request larger than
/// the capacity is clamped to it so it can eventually be granted.
pub struct TokenBucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// A `rate` or `capacity` of 0 is treated as 1.
    pub fn new(rate: u64, capacity: u64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            inner: Mutex::new(BucketInner {
                rate: rate.max(1) as f64,
                capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> u64 {
        let mut b = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        b.refill(Instant::now());
        b.tokens as u64
    }
}

impl BucketInner {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl RateLimiter for TokenBucket {
    fn acquire(&self, want: u64) -> (bool, Duration) {
        let mut b = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        b.refill(Instant::now());

        let want = (want as f64).min(b.capacity);
        if b.tokens >= want {
            b.tokens -= want;
            return (true, Duration::ZERO);
        }

        let deficit = want - b.tokens;
        (false, Duration::from_secs_f64(deficit / b.rate))
    }
}
