//! Response Cache
//!
//! TTL cache for worker responses. Expiry is enforced three ways:
//! - lazily, on read
//! - by a per-entry timer scheduled on insert
//! - by [`ResponseCache::purge_expired`], called from the periodic sweep

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio::time::Instant;

/// A cached value with its lifetime and hit counter.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    /// `None` when the TTL reaches past what `Instant` can represent
    pub expires_at: Option<Instant>,
    pub hit_count: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Hit and miss accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup
    pub hit_rate: f64,
}

type EntryMap<T> = Mutex<HashMap<String, CacheEntry<T>>>;

/// String-keyed TTL cache.
#[derive(Debug)]
pub struct ResponseCache<T> {
    entries: Arc<EntryMap<T>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone + Send + 'static> ResponseCache<T> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the value for `key` if present and unexpired.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let value = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Stores `value` under `key` for `ttl` (the default TTL if `None`),
    /// replacing any earlier entry.
    ///
    /// When called inside a tokio runtime, a timer removes the entry once
    /// it expires. A TTL too large to represent never expires.
    pub fn insert(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.unwrap_or(self.default_ttl));

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                CacheEntry {
                    value,
                    created_at: now,
                    expires_at,
                    hit_count: 0,
                },
            );

        let Some(expires_at) = expires_at else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let entries = Arc::downgrade(&self.entries);
            handle.spawn(expire_at(entries, key, expires_at));
        }
    }

    /// Hit count of an entry, if present.
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.hit_count)
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Removes `key` at `expires_at` unless it was replaced meanwhile.
async fn expire_at<T>(entries: Weak<EntryMap<T>>, key: String, expires_at: Instant) {
    tokio::time::sleep_until(expires_at).await;
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    if entries.get(&key).and_then(|e| e.expires_at) == Some(expires_at) {
        entries.remove(&key);
        debug!("Cache entry '{}' expired", key);
    }
}
