//! Keyed token-bucket rate limiting.
//!
//! One bucket per key, created full on first use. Callers pass the current
//! [`Instant`] so refill is deterministic under test.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sustained rate and burst capacity of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Tokens restored per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: f64,
}

impl RateLimit {
    /// `rate` tokens per second with room for `burst`.
    pub const fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, limit: RateLimit, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limit.rate).min(limit.burst);
        self.last_refill = now;
    }
}

/// Token buckets keyed by `K` (typically a peer id).
#[derive(Debug)]
pub struct KeyedRateLimiter<K: Eq + Hash> {
    limit: RateLimit,
    buckets: DashMap<K, TokenBucket>,
    dropped: AtomicU64,
}

impl<K: Eq + Hash + Clone> KeyedRateLimiter<K> {
    /// Create a limiter applying `limit` to every key.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            buckets: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// The limit applied to each key.
    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take one token for `key`; `false` when the bucket is empty.
    pub fn consume(&self, key: &K, now: Instant) -> bool {
        self.consume_n(key, 1.0, now)
    }

    /// Take `amount` tokens for `key`; `false` (and nothing taken) when the
    /// bucket holds fewer.
    pub fn consume_n(&self, key: &K, amount: f64, now: Instant) -> bool {
        let mut bucket = self.buckets.entry(key.clone()).or_insert(TokenBucket {
            tokens: self.limit.burst,
            last_refill: now,
        });
        bucket.refill(self.limit, now);
        if bucket.tokens >= amount {
            bucket.tokens -= amount;
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total rejected calls since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forget `key`'s bucket, e.g. when a peer disconnects.
    pub fn remove(&self, key: &K) {
        self.buckets.remove(key);
    }

    /// Drop buckets idle for longer than `max_idle`.
    pub fn cleanup(&self, now: Instant, max_idle: Duration) {
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= max_idle);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
