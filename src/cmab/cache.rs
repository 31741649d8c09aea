use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;

/// Cached contextual-bandit decision of one user for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabCacheValue {
    /// Hash of the attributes the decision was made for. A lookup with different attributes
    /// must not reuse the decision.
    pub attributes_hash: String,
    pub variation_id: String,
    pub cmab_uuid: String,
}

#[derive(Debug)]
struct Entry {
    value: CmabCacheValue,
    stored_at: DateTime<Utc>,
}

/// Bounded, expiring, concurrent cache of bandit decisions.
///
/// When full, inserting a new key evicts the least recently used entry. A `max_size` of zero
/// disables caching; a zero `timeout` keeps entries until they are evicted.
#[derive(Debug)]
pub struct CmabCache {
    timeout: Duration,
    /// `None` when caching is disabled.
    entries: Option<Mutex<LruCache<String, Entry>>>,
}

impl CmabCache {
    pub const DEFAULT_MAX_SIZE: usize = 1000;
    pub const DEFAULT_TIMEOUT_SECS: i64 = 300;

    pub fn new(max_size: usize, timeout: Duration) -> CmabCache {
        CmabCache {
            timeout,
            entries: NonZeroUsize::new(max_size).map(|size| Mutex::new(LruCache::new(size))),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<CmabCacheValue> {
        self.lookup_at(key, Utc::now())
    }

    pub fn save(&self, key: impl Into<String>, value: CmabCacheValue) {
        self.save_at(key.into(), value, Utc::now());
    }

    pub fn remove(&self, key: &str) {
        if let Some(mut entries) = self.entries() {
            entries.pop(key);
        }
    }

    pub fn reset(&self) {
        if let Some(mut entries) = self.entries() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lookup_at(&self, key: &str, now: DateTime<Utc>) -> Option<CmabCacheValue> {
        let mut entries = self.entries()?;

        let expired = self.is_expired(entries.peek(key)?, now);
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub(crate) fn save_at(&self, key: String, value: CmabCacheValue, now: DateTime<Utc>) {
        if let Some(mut entries) = self.entries() {
            entries.put(
                key,
                Entry {
                    value,
                    stored_at: now,
                },
            );
        }
    }

    fn is_expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        !self.timeout.is_zero() && now - entry.stored_at > self.timeout
    }

    /// A panic while holding the lock cannot leave the cache inconsistent, so poisoning is
    /// ignored.
    fn entries(&self) -> Option<MutexGuard<'_, LruCache<String, Entry>>> {
        let entries = self.entries.as_ref()?;
        Some(entries.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Default for CmabCache {
    fn default() -> Self {
        CmabCache::new(
            CmabCache::DEFAULT_MAX_SIZE,
            Duration::seconds(CmabCache::DEFAULT_TIMEOUT_SECS),
        )
    }
}
