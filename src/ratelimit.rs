//! RateLimiter (component C9): a token bucket per client identity, with
//! a bounded, LRU-evicted bucket population and an independent
//! whitelist — grounded, like `cache.rs`, in the `lru` + `dashmap` +
//! `parking_lot` combination spec §5 calls out for every process-global
//! table in this crate.

use dashmap::DashSet;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: f64,
    pub remaining: f64,
    /// Seconds until the next whole token becomes available.
    pub reset_seconds: f64,
}

pub struct RateLimiter {
    buckets: Mutex<LruCache<String, Bucket>>,
    whitelist: DashSet<String>,
    capacity: f64,
    rate_per_second: f64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(capacity: f64, rate_per_second: f64, max_buckets: usize) -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(NonZeroUsize::new(max_buckets.max(1)).unwrap())),
            whitelist: DashSet::new(),
            capacity,
            rate_per_second,
        }
    }

    pub fn whitelist_add(&self, id: impl Into<String>) {
        self.whitelist.insert(id.into());
    }

    pub fn whitelist_remove(&self, id: &str) {
        self.whitelist.remove(id);
    }

    #[must_use]
    pub fn is_whitelisted(&self, id: &str) -> bool {
        self.whitelist.contains(id)
    }

    /// Spec §4.9 `try_acquire`: whitelisted ids are always allowed;
    /// everyone else draws from a token bucket that refills continuously
    /// and evicts its least-recently-used entry once the population cap
    /// is reached (eviction resets that client to a fresh full bucket,
    /// not an error condition).
    pub fn try_acquire(&self, id: &str) -> Decision {
        if self.is_whitelisted(id) {
            return Decision {
                allowed: true,
                limit: self.capacity,
                remaining: self.capacity,
                reset_seconds: 0.0,
            };
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_or_insert_mut(id.to_string(), || Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision {
                allowed: true,
                limit: self.capacity,
                remaining: bucket.tokens.floor(),
                reset_seconds: 0.0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let reset_seconds = if self.rate_per_second > 0.0 {
                deficit / self.rate_per_second
            } else {
                f64::INFINITY
            };
            Decision {
                allowed: false,
                limit: self.capacity,
                remaining: bucket.tokens.floor(),
                reset_seconds,
            }
        }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}
