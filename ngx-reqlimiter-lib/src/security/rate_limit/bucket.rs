use std::time::Instant;

/// Token bucket for a single source address.
///
/// Both checks take the current instant explicitly, which keeps the refill
/// arithmetic deterministic under test.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst);
        Self { rate, burst, tokens: burst, last: now }
    }

    /// Refill for the time elapsed since the previous check, then try to take
    /// one token. A denied check changes nothing beyond the refill.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without consuming any.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        (self.tokens + elapsed * self.rate).min(self.burst)
    }

    /// Instant of the last check.
    pub fn last_seen(&self) -> Instant {
        self.last
    }

    fn refill(&mut self, now: Instant) {
        // Out-of-order instants never move the clock backwards.
        if now <= self.last {
            return;
        }
        self.tokens = self.available_at(now);
        self.last = now;
    }
}
