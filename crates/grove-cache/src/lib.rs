#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-cache** – LRU entity cache for Grove.
//!
//! A capacity-bounded, recency-ordered mapping from entity id to
//! materialized entity. `get` and `set` both promote; inserting past
//! capacity evicts the least-recently-used entry and fires the configured
//! callback synchronously, before the insertion returns. Capacity 0 means
//! unbounded.
//!
//! The cache is single-writer by contract: methods take `&mut self` and
//! concurrent callers synchronize externally. One cache exists per storage
//! scope, owned by a [`CacheRegistry`]; clearing a scope removes its cache
//! and its statistics become unavailable until a new one is created.

use std::collections::HashMap;

use indexmap::IndexMap;

/// Synchronous eviction callback, invoked with the evicted key and value.
pub type EvictCallback<V> = Box<dyn Fn(&str, &V) + Send + Sync>;

//─────────────────────────────
//  Statistics
//─────────────────────────────

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries evicted by capacity pressure.
    pub evictions: u64,
    /// `hits / (hits + misses)`, 0 when no lookups happened.
    pub hit_rate: f64,
    /// Configured capacity, 0 for unbounded.
    pub max_entries: usize,
    /// Current number of entries.
    pub size: usize,
}

//─────────────────────────────
//  LRU cache
//─────────────────────────────

/// Recency-ordered bounded cache. Iteration order is least-recent first.
pub struct LruCache<V> {
    entries: IndexMap<String, V>,
    max_entries: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    on_evict: Option<EvictCallback<V>>,
}

impl<V> LruCache<V> {
    /// Create a cache holding at most `max_entries` items (0 = unbounded).
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            max_entries,
            hits: 0,
            misses: 0,
            evictions: 0,
            on_evict: None,
        }
    }

    /// Attach an eviction callback.
    pub fn with_callback(mut self, on_evict: EvictCallback<V>) -> Self {
        self.on_evict = Some(on_evict);
        self
    }

    /// Look up an entry, promoting it to most-recent on a hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        match self.entries.shift_remove_entry(key) {
            Some((key, value)) => {
                self.hits += 1;
                self.entries.insert(key, value);
                self.entries.last().map(|(_, v)| v)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an entry, promoting it to most-recent. When the
    /// insertion would exceed capacity, the least-recent entry is evicted
    /// and the callback fires before this call returns.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
        if self.max_entries > 0 {
            while self.entries.len() > self.max_entries {
                self.evict_lru();
            }
        }
    }

    /// Whether an entry exists. Does not promote and does not count as a
    /// lookup.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry. Returns true when something was removed. No
    /// eviction callback fires for explicit removal.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Drop every entry, keeping the statistics counters.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in recency order, least-recent first.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys in recency order, least-recent first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Values in recency order, least-recent first.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    /// Remove every entry whose key starts with `prefix`; returns the
    /// number removed. Invalidation is not eviction: no callback fires and
    /// the eviction counter is untouched.
    pub fn invalidate_by_prefix(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            self.entries.shift_remove(key);
        }
        doomed.len()
    }

    /// Reconfigure the capacity, migrating existing entries and evicting
    /// LRU overflow through the callback.
    pub fn set_capacity(&mut self, max_entries: usize) {
        self.max_entries = max_entries;
        if max_entries > 0 {
            while self.entries.len() > max_entries {
                self.evict_lru();
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate: if lookups == 0 { 0.0 } else { self.hits as f64 / lookups as f64 },
            max_entries: self.max_entries,
            size: self.entries.len(),
        }
    }

    fn evict_lru(&mut self) {
        if let Some((key, value)) = self.entries.shift_remove_index(0) {
            self.evictions += 1;
            if let Some(callback) = &self.on_evict {
                callback(&key, &value);
            }
        }
    }
}

//─────────────────────────────
//  Per-scope registry
//─────────────────────────────

/// Owns one cache per storage scope. Passed explicitly wherever caching is
/// needed; there is no process-global cache state.
pub struct CacheRegistry<V> {
    caches: HashMap<String, LruCache<V>>,
}

impl<V> Default for CacheRegistry<V> {
    fn default() -> Self {
        Self { caches: HashMap::new() }
    }
}

impl<V> CacheRegistry<V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache for `scope`, created with `make` on first use.
    pub fn get_or_create(
        &mut self,
        scope: &str,
        make: impl FnOnce() -> LruCache<V>,
    ) -> &mut LruCache<V> {
        self.caches.entry(scope.to_string()).or_insert_with(make)
    }

    /// The cache for `scope`, when one exists.
    pub fn get(&mut self, scope: &str) -> Option<&mut LruCache<V>> {
        self.caches.get_mut(scope)
    }

    /// Statistics for `scope`; `None` when no cache has been created (the
    /// stats-unavailable sentinel, not an error).
    pub fn stats(&self, scope: &str) -> Option<CacheStats> {
        self.caches.get(scope).map(LruCache::stats)
    }

    /// Remove the cache for `scope`, returning its final statistics.
    /// Afterwards `stats(scope)` is `None` until a new cache is created.
    pub fn clear_scope(&mut self, scope: &str) -> Option<CacheStats> {
        self.caches.remove(scope).map(|cache| cache.stats())
    }

    /// Drop every scope.
    pub fn clear_all(&mut self) {
        self.caches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_get_and_set_promote() {
        let mut cache = LruCache::new(3);
        cache.set("k1", 1);
        cache.set("k2", 2);
        cache.set("k3", 3);

        assert_eq!(cache.get("k1"), Some(&1));
        let keys: Vec<&str> = cache.keys().collect();
        assert_eq!(keys, vec!["k2", "k3", "k1"]);

        cache.set("k2", 20);
        let keys: Vec<&str> = cache.keys().collect();
        assert_eq!(keys, vec!["k3", "k1", "k2"]);
    }

    #[test]
    fn test_eviction_scenario() {
        // Capacity 3, insert K1..K3, get(K1), insert K4: K2 is evicted.
        let evicted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = evicted.clone();
        let mut cache = LruCache::new(3)
            .with_callback(Box::new(move |key, _value: &i32| {
                seen.lock().unwrap().push(key.to_string());
            }));

        cache.set("k1", 1);
        cache.set("k2", 2);
        cache.set("k3", 3);
        assert_eq!(cache.get("k1"), Some(&1));
        cache.set("k4", 4);

        assert_eq!(*evicted.lock().unwrap(), vec!["k2"]);
        let mut keys: Vec<&str> = cache.keys().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["k1", "k3", "k4"]);

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 3);
    }

    #[test]
    fn test_capacity_zero_is_unbounded() {
        let mut cache = LruCache::new(0);
        for i in 0..10_000 {
            cache.set(format!("k{i}"), i);
        }
        assert_eq!(cache.len(), 10_000);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_replacing_existing_key_never_evicts() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some(&10));
    }

    #[test]
    fn test_has_does_not_promote_or_count() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        assert!(cache.has("a"));
        let keys: Vec<&str> = cache.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_miss_counted() {
        let mut cache: LruCache<i32> = LruCache::new(2);
        assert_eq!(cache.get("nope"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn test_invalidate_by_prefix() {
        let mut cache = LruCache::new(0);
        cache.set("user/a", 1);
        cache.set("user/b", 2);
        cache.set("doc/x", 3);
        assert_eq!(cache.invalidate_by_prefix("user/"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.has("doc/x"));
        // Invalidation is not eviction.
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_set_capacity_migrates_and_evicts() {
        let evicted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = evicted.clone();
        let mut cache = LruCache::new(0)
            .with_callback(Box::new(move |key, _value: &i32| {
                seen.lock().unwrap().push(key.to_string());
            }));
        for i in 1..=5 {
            cache.set(format!("k{i}"), i);
        }

        cache.set_capacity(2);
        assert_eq!(cache.len(), 2);
        // The three least-recent entries went through the callback.
        assert_eq!(*evicted.lock().unwrap(), vec!["k1", "k2", "k3"]);
        let keys: Vec<&str> = cache.keys().collect();
        assert_eq!(keys, vec!["k4", "k5"]);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        let _ = cache.get("a");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_registry_scopes_and_sentinel() {
        let mut registry: CacheRegistry<i32> = CacheRegistry::new();
        assert_eq!(registry.stats("scope-a"), None);

        registry.get_or_create("scope-a", || LruCache::new(2)).set("k", 1);
        assert_eq!(registry.stats("scope-a").unwrap().size, 1);
        assert_eq!(registry.stats("scope-b"), None);

        let final_stats = registry.clear_scope("scope-a").unwrap();
        assert_eq!(final_stats.size, 1);
        // Stats unavailable until a new cache is created.
        assert_eq!(registry.stats("scope-a"), None);
        registry.get_or_create("scope-a", || LruCache::new(2));
        assert_eq!(registry.stats("scope-a").unwrap().size, 0);
    }
}
