//! Bounded in-process TTL cache used when the remote cache is unavailable.
//!
//! Entries carry an absolute expiry. Expired entries are dropped when read
//! and by [`FallbackCache::purge_expired`], which the connection manager runs
//! on a timer. The map is LRU-bounded so an outage cannot grow it without
//! limit.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct FallbackState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    expired: u64,
    evictions: u64,
}

/// Counters for the fallback cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FallbackCacheStats {
    /// Entries currently held, including ones not yet swept.
    pub entries: usize,
    /// Maximum entries.
    pub capacity: usize,
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing or an expired value.
    pub misses: u64,
    /// Entries dropped because their TTL elapsed.
    pub expired: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
}

/// Thread-safe LRU cache with per-entry TTL.
pub struct FallbackCache {
    state: Mutex<FallbackState>,
    capacity: NonZeroUsize,
}

impl FallbackCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(FallbackState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                expired: 0,
                evictions: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the value for `key` unless it is missing or expired.
    ///
    /// An expired entry is removed on the spot.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut state = self.lock();

        let lookup = state
            .entries
            .get(key)
            .map(|entry| (entry.is_expired(now), entry.value.clone()));
        let value = match lookup {
            Some((false, value)) => Some(value),
            Some((true, _)) => {
                state.entries.pop(key);
                state.expired += 1;
                None
            },
            None => None,
        };

        if value.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        value
    }

    /// Stores `value` under `key` for `ttl`.
    ///
    /// Returns false without storing anything when `ttl` is zero.
    pub fn set(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };

        let mut state = self.lock();
        if let Some((evicted_key, _)) = state.entries.push(key.to_string(), entry)
            && evicted_key != key
        {
            state.evictions += 1;
            drop(state);
            metrics::counter!("fallback_cache_evictions_total").increment(1);
            tracing::debug!(key = %evicted_key, "Fallback cache evicted least recently used entry");
        }
        true
    }

    /// Removes `key`, returning true if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.pop(key);
        }
        state.expired += expired.len() as u64;
        let remaining = state.entries.len();
        drop(state);

        metrics::gauge!("fallback_cache_entries").set(remaining as f64);
        expired.len()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().entries.clear();
        metrics::gauge!("fallback_cache_entries").set(0.0);
    }

    /// Returns the number of entries held, including unswept expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cache counters.
    #[must_use]
    pub fn stats(&self) -> FallbackCacheStats {
        let state = self.lock();
        FallbackCacheStats {
            entries: state.entries.len(),
            capacity: self.capacity.get(),
            hits: state.hits,
            misses: state.misses,
            expired: state.expired,
            evictions: state.evictions,
        }
    }
}

impl std::fmt::Debug for FallbackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.len())
            .finish()
    }
}
