//! # Response cache
//!
//! Memo of `normalized query → final answer`. Keys are blake3 hashes of the
//! normalized query; values are returned verbatim.
//!
//! - Entries expire after a fixed TTL. Expiry is checked lazily on read, and
//!   expired entries are swept when the cache is full.
//! - When the cache reaches capacity, the oldest-inserted quarter is evicted in
//!   one batch, so a full cache does not evict on every single insert.
//! - Operations never fail. The lock is a `parking_lot::Mutex`, which cannot be
//!   poisoned, so the worst case is a miss.
//!
//! Every [`ResponseCache::clear`] starts a new generation. A caller that
//! computed its answer against an older knowledge base stores it with
//! [`ResponseCache::put_if_generation`], which drops the write once the
//! generation has moved on.
//!
//! Timestamps come from `tokio::time::Instant`, which lets tests drive expiry
//! with a paused clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// One memoized answer.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Bounded, time-expiring answer cache.
pub struct ResponseCache {
    ttl: Duration,
    capacity: usize,
    /// Insertion-ordered: the front is always the oldest insert.
    entries: Mutex<LinkedHashMap<blake3::Hash, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Bumped by `clear`, under the entries lock.
    generation: AtomicU64,
}

impl ResponseCache {
    /// A capacity of 0 is bumped to 1.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(LinkedHashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn key(normalized_query: &str) -> blake3::Hash {
        blake3::hash(normalized_query.as_bytes())
    }

    /// Return the cached answer, or `None` if absent or expired.
    ///
    /// An expired entry is removed on the spot.
    pub fn get(&self, normalized_query: &str) -> Option<String> {
        let key = Self::key(normalized_query);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get(&key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(self.ttl, now),
        };

        if expired {
            entries.remove(&key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(&key).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite the answer for a query.
    ///
    /// Overwriting moves the entry to the back of the insertion order.
    pub fn put(&self, normalized_query: &str, answer: &str) {
        let mut entries = self.entries.lock();
        self.insert_locked(&mut entries, normalized_query, answer);
    }

    /// [`put`](Self::put), unless the cache was cleared since `generation`
    /// was read. Returns whether the answer was stored.
    pub fn put_if_generation(&self, normalized_query: &str, answer: &str, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!("dropping answer computed before the last cache clear");
            return false;
        }
        self.insert_locked(&mut entries, normalized_query, answer);
        true
    }

    /// Current generation, to be passed back to [`put_if_generation`](Self::put_if_generation).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn insert_locked(
        &self,
        entries: &mut LinkedHashMap<blake3::Hash, CacheEntry>,
        normalized_query: &str,
        answer: &str,
    ) {
        let key = Self::key(normalized_query);
        let now = Instant::now();

        entries.remove(&key);

        if entries.len() >= self.capacity {
            let expired: Vec<blake3::Hash> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(self.ttl, now))
                .map(|(key, _)| *key)
                .collect();
            let mut evicted = expired.len();
            for key in expired {
                entries.remove(&key);
            }

            if entries.len() >= self.capacity {
                let batch = (self.capacity / 4).max(1);
                for _ in 0..batch {
                    if entries.pop_front().is_none() {
                        break;
                    }
                    evicted += 1;
                }
            }

            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = entries.len(), "response cache eviction");
        }

        entries.insert(
            key,
            CacheEntry {
                value: answer.to_string(),
                inserted_at: now,
            },
        );
    }

    /// Whether a live (non-expired) entry exists, without touching the counters.
    pub fn contains(&self, normalized_query: &str) -> bool {
        let key = Self::key(normalized_query);
        let now = Instant::now();
        self.entries
            .lock()
            .get(&key)
            .is_some_and(|entry| !entry.is_expired(self.ttl, now))
    }

    /// Drop every entry. Used after a knowledge base rebuild.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Physical number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
