use std::{
    collections::HashMap,
    hash::Hash,
    sync::{PoisonError, RwLock},
    time::Duration,
};
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Key/value store with a time-to-live per entry.
///
/// Expiry is lazy: a stale entry stays in the map until the next `get` for
/// its key evicts it. There is no sweeper and no capacity bound, which is
/// only sound while the key space stays small and fixed (one key per query
/// shape). Anything that derives keys from unbounded input needs an active
/// sweep added here first.
///
/// A cache never fails. Lock poisoning is recovered because entries are
/// replaced whole, so a panicking writer cannot leave a torn value behind.
pub struct TtlCache<K, V> {
    default_ttl: Duration,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match guard.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // A concurrent set may have refreshed the entry between the two locks.
        match guard.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
