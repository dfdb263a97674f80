//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::Instant;

/// A continuously refilling token bucket.
///
/// Tokens accumulate at `rate` per second up to `burst` and each admitted
/// unit of work spends exactly one. The mutable state sits behind its own
/// lock so admission checks never need the owning trie node's lock.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per second
    rate: f64,
    /// Maximum number of tokens the bucket can hold
    burst: u32,
    /// Current balance and refill clock
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    /// Add the tokens earned since `last_refill`, capped at `burst`.
    fn refill(&mut self, now: Instant, rate: f64, burst: u32) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(burst as f64);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

impl TokenBucket {
    /// Create a new, full token bucket.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    /// Create a new, full token bucket whose refill clock starts at `now`.
    pub fn new_at(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: now,
            }),
        }
    }

    /// Try to take one token.
    ///
    /// Returns `true` if the unit of work may proceed.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now(), self.rate, self.burst);
        Self::take(&mut state)
    }

    /// Try to take one token as of `now`.
    ///
    /// An instant older than the last refill earns nothing; the refill clock
    /// never moves backwards.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.refill(now, self.rate, self.burst);
        Self::take(&mut state)
    }

    fn take(state: &mut BucketState) -> bool {
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available right now, without consuming any.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    /// Tokens that would be available at `now`, without consuming any.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_refill);
        (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst as f64)
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Burst capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = TokenBucket::new(2.0, 4);
        assert_eq!(bucket.rate(), 2.0);
        assert_eq!(bucket.burst(), 4);
        assert_eq!(bucket.tokens(), 4.0);
    }

    #[test]
    fn test_burst_then_reject() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 3, start);

        for _ in 0..3 {
            assert!(bucket.allow_at(start));
        }

        // Bucket is drained and no time has passed
        assert!(!bucket.allow_at(start));
        assert_eq!(bucket.tokens_at(start), 0.0);
    }

    #[test]
    fn test_refill_over_time() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 10, start);

        for _ in 0..10 {
            assert!(bucket.allow_at(start));
        }
        assert!(!bucket.allow_at(start));

        // 250ms at 10/s earns 2.5 tokens
        let later = start + Duration::from_millis(250);
        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(100.0, 5, start);

        assert!(bucket.allow_at(start));
        let much_later = start + Duration::from_secs(60);
        assert_eq!(bucket.tokens_at(much_later), 5.0);
    }

    #[test]
    fn test_stale_instant_earns_nothing() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let bucket = TokenBucket::new_at(1.0, 1, later);

        assert!(bucket.allow_at(later));
        // An instant from before the last refill must not rewind the clock
        assert!(!bucket.allow_at(start));
        assert!(bucket.allow_at(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_one_per_second_burst_one() {
        let bucket = TokenBucket::new(1.0, 1);

        assert!(bucket.allow());
        assert!(!bucket.allow());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(bucket.allow());
    }

    #[test]
    fn test_concurrent_allow_never_over_admits() {
        let start = Instant::now();
        let bucket = Arc::new(TokenBucket::new_at(5.0, 5, start));
        let barrier = Arc::new(Barrier::new(20));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let bucket = bucket.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    bucket.allow_at(start)
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(bucket.tokens_at(start), 0.0);
    }
}
