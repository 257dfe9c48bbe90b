//! Token bucket.

use std::time::{Duration, Instant};

/// Continuous-refill token bucket.
///
/// Tokens accrue at `rate` per second up to `capacity`; fractions carry over
/// between calls. A request passes only if a whole token is available at the
/// instant it is made. Time is passed in so the arithmetic can be tested
/// without sleeping.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            rate: rate.max(0.0),
            tokens: capacity,
            last_refill: now,
            last_access: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consumes one token if available. Access time is recorded either way.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if now > self.last_access {
            self.last_access = now;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}
