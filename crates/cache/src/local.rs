//! In-process TTL cache backed by DashMap for lock-free concurrent access.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Concurrent map whose entries expire after a per-entry TTL.
pub struct TtlCache<K, V> {
    store: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: DashMap::new(),
            default_ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns None if expired or missing.
    pub fn get(&self, key: &K) -> Option<V> {
        let Some(entry) = self.store.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.expired() {
            drop(entry);
            self.store.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        // Over capacity: skip new keys, evict_expired reclaims space.
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove every entry matching `pred`. Returns the number removed.
    pub fn invalidate<F>(&self, pred: F) -> usize
    where
        F: Fn(&K, &V) -> bool,
    {
        let before = self.store.len();
        self.store.retain(|k, entry| !pred(k, &entry.value));
        before.saturating_sub(self.store.len())
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.expired());
        before.saturating_sub(self.store.len())
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.store.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);
        assert!(cache.get(&"a".to_string()).is_none());
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expiry() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(1), 10);
        cache.put("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_skips_new_keys() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        assert_eq!(cache.len(), 2);
        cache.put(1, 10);
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn test_invalidate_predicate() {
        let cache: TtlCache<(u32, u32), u32> = TtlCache::new(Duration::from_secs(60), 10);
        cache.put((1, 1), 1);
        cache.put((1, 2), 2);
        cache.put((2, 1), 3);
        assert_eq!(cache.invalidate(|k, _| k.0 == 1), 2);
        assert_eq!(cache.len(), 1);
    }
}
