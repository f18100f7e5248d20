//! Token-bucket rate limiting for client IPs and peer pubkeys.
//!
//! Buckets are keyed per source and refill continuously; a request that
//! finds an empty bucket is rejected with 429. Limits are hardcoded.

use dashmap::DashMap;
use std::time::Instant;

/// Client buckets: sustained rate and burst capacity per source IP.
const CLIENT_RATE_PER_SEC: f64 = 20.0;
const CLIENT_BURST: f64 = 100.0;

/// Peer buckets are far more generous; replication is bursty by design.
const SNODE_RATE_PER_SEC: f64 = 300.0;
const SNODE_BURST: f64 = 600.0;

/// Bucket maps are pruned once they exceed this many entries.
const MAX_TRACKED_SOURCES: usize = 10_000;

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    clients: DashMap<String, TokenBucket>,
    snodes: DashMap<String, TokenBucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            snodes: DashMap::new(),
        }
    }

    /// Returns true when a client request from `ip` must be rejected.
    pub fn should_rate_limit_client(&self, ip: &str) -> bool {
        Self::check(&self.clients, ip, CLIENT_BURST, CLIENT_RATE_PER_SEC)
    }

    /// Returns true when a peer request from `pubkey` must be rejected.
    pub fn should_rate_limit_snode(&self, pubkey: &str) -> bool {
        Self::check(&self.snodes, pubkey, SNODE_BURST, SNODE_RATE_PER_SEC)
    }

    fn check(map: &DashMap<String, TokenBucket>, key: &str, capacity: f64, rate: f64) -> bool {
        let now = Instant::now();
        let allowed = map
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, rate, now))
            .try_take(now);

        if map.len() > MAX_TRACKED_SOURCES {
            map.retain(|_, bucket| bucket.tokens < bucket.capacity - 1.0);
        }

        !allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new();
        for _ in 0..CLIENT_BURST as usize {
            assert!(!limiter.should_rate_limit_client("1.2.3.4"));
        }
        assert!(limiter.should_rate_limit_client("1.2.3.4"));
    }

    #[test]
    fn test_sources_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..CLIENT_BURST as usize {
            assert!(!limiter.should_rate_limit_client("1.1.1.1"));
        }
        assert!(limiter.should_rate_limit_client("1.1.1.1"));
        assert!(!limiter.should_rate_limit_client("2.2.2.2"));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 10.0, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));
        // 10 tokens/s means one token back after 100 ms
        assert!(bucket.try_take(start + std::time::Duration::from_millis(150)));
    }

    #[test]
    fn test_snode_limit_is_separate_from_client_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..CLIENT_BURST as usize {
            assert!(!limiter.should_rate_limit_client("key"));
        }
        assert!(limiter.should_rate_limit_client("key"));
        assert!(!limiter.should_rate_limit_snode("key"));
    }
}
