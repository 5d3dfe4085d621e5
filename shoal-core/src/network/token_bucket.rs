//! Token bucket rate limiter for upload pacing.
//!
//! Tokens accrue at a fixed fill rate up to the bucket capacity. Callers pass
//! the current instant explicitly, so the bucket is driven by whatever clock
//! the owning reactor uses and stays deterministic under test.

use std::time::Instant;

/// Token bucket rate limiter.
///
/// Owned by a single reactor task; it is not shared across threads.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: f64,
    /// Tokens currently in the bucket as of `last_ts`
    tokens: f64,
    /// Tokens added per second
    fill_rate: f64,
    /// Instant `tokens` was last brought up to date
    last_ts: Instant,
}

impl TokenBucket {
    /// Creates a full token bucket.
    ///
    /// # Parameters
    /// - `capacity`: Maximum tokens the bucket can hold (burst size)
    /// - `fill_rate`: Tokens added per second (sustained rate)
    /// - `now`: Reference instant for subsequent refills
    ///
    /// # Panics
    ///
    /// Panics if capacity or fill_rate is not strictly positive.
    pub fn new(capacity: f64, fill_rate: f64, now: Instant) -> Self {
        assert!(
            capacity > 0.0,
            "Token bucket capacity must be greater than zero"
        );
        assert!(
            fill_rate > 0.0,
            "Token bucket fill rate must be greater than zero"
        );

        Self {
            capacity,
            tokens: capacity,
            fill_rate,
            last_ts: now,
        }
    }

    /// Returns the tokens available at `now`.
    ///
    /// `min(capacity, tokens + fill_rate * (now - last_ts))`. Instants earlier
    /// than the last refill add nothing.
    pub fn tokens(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Consumes `amount` tokens if available.
    ///
    /// Returns `false` and leaves the bucket untouched otherwise.
    pub fn consume(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens < amount {
            return false;
        }
        self.tokens -= amount;
        true
    }

    /// Seconds until `amount` tokens will be available at the current fill rate.
    ///
    /// Zero when they already are.
    pub fn seconds_until(&mut self, amount: f64, now: Instant) -> f64 {
        let missing = amount - self.tokens(now);
        if missing <= 0.0 {
            0.0
        } else {
            missing / self.fill_rate
        }
    }

    /// Returns bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_ts {
            return;
        }
        let elapsed = now.duration_since(self.last_ts).as_secs_f64();
        self.tokens = (self.tokens + self.fill_rate * elapsed).min(self.capacity);
        self.last_ts = now;
    }
}
