//! Token-bucket throttling for transport reads and writes.

use std::time::{Duration, Instant};

/// A byte-granularity token bucket.
///
/// The bucket starts full at `burst` and refills at `rate` tokens per
/// second, capped at `burst`. Callers ask how many bytes they may move
/// right now and report what they actually moved; when the answer is zero
/// they schedule a throttle timer with [`delay_for`](Self::delay_for)
/// instead of spinning.
pub(crate) struct TokenBucket {
    rate: u64,
    burst: u64,
    tokens: u64,
    last: Option<Instant>,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = burst.max(1);
        Self {
            rate: rate.max(1),
            burst,
            tokens: burst,
            last: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let last = match self.last {
            Some(last) => last,
            None => {
                self.last = Some(now);
                return;
            }
        };

        let elapsed = now.saturating_duration_since(last);
        let add = (elapsed.as_micros() * self.rate as u128 / 1_000_000) as u64;
        // Leave `last` untouched for sub-token intervals so fractions of a
        // token are not repeatedly discarded.
        if add > 0 {
            self.tokens = (self.tokens.saturating_add(add)).min(self.burst);
            self.last = Some(now);
        }
    }

    /// Tokens currently available.
    pub fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens
    }

    /// Record `n` tokens as spent.
    pub fn consume(&mut self, n: u64) {
        self.tokens = self.tokens.saturating_sub(n);
    }

    /// How long until at least one token is available again.
    pub fn delay_for(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens > 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(1_000_000u64.div_ceil(self.rate))
    }
}
