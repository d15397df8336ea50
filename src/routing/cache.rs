//! Bounded LRU cache of resolution outcomes.
//!
//! Entries are tagged with the tree generation that produced them. Any tree
//! mutation bumps the generation and drops every entry at once; per-entry
//! invalidation is unsafe once wildcard patterns overlap.
//!
//! A poisoned lock degrades to a cache miss, never to a failed request.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;

use crate::observability::metrics;

/// Generation-checked LRU cache keyed by the exact lookup string.
#[derive(Debug)]
pub struct ResolutionCache<V> {
    entries: Option<Mutex<LruCache<String, (u64, V)>>>,
    generation: AtomicU64,
    name: &'static str,
}

impl<V: Clone> ResolutionCache<V> {
    /// A capacity of zero disables caching.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            generation: AtomicU64::new(0),
            name,
        }
    }

    /// Current tree generation. Read it under the tree lock it belongs to.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.as_ref()?;
        let mut entries = match entries.lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(cache = self.name, "Resolution cache lock poisoned, resolving uncached");
                return None;
            }
        };
        let current = self.generation();
        let hit = match entries.get(key) {
            Some((generation, value)) if *generation == current => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        metrics::record_cache_lookup(self.name, hit.is_some());
        hit
    }

    /// Store an outcome computed against `generation`; stale outcomes are dropped.
    pub fn put(&self, key: String, generation: u64, value: V) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        if let Ok(mut entries) = entries.lock() {
            if generation == self.generation() {
                entries.put(key, (generation, value));
            }
        }
    }

    /// Drop every entry. Call while holding the tree's write lock.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(lock) = self.entries.as_ref() {
            match lock.lock() {
                Ok(mut entries) => entries.clear(),
                Err(poisoned) => {
                    poisoned.into_inner().clear();
                    lock.clear_poison();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|e| e.lock().ok().map(|e| e.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|e| e.lock().ok().map(|e| e.cap().get()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_invalidate() {
        let cache = ResolutionCache::new("test", 4);
        let generation = cache.generation();
        cache.put("GET a /x".into(), generation, 1);
        assert_eq!(cache.get("GET a /x"), Some(1));

        cache.invalidate();
        assert_eq!(cache.get("GET a /x"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_put_is_dropped() {
        let cache = ResolutionCache::new("test", 4);
        let generation = cache.generation();
        cache.invalidate();
        cache.put("k".into(), generation, 1);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResolutionCache::new("test", 2);
        let g = cache.generation();
        cache.put("a".into(), g, 1);
        cache.put("b".into(), g, 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.put("c".into(), g, 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = ResolutionCache::new("test", 0);
        cache.put("a".into(), cache.generation(), 1);
        assert_eq!(cache.get("a"), None);
    }
}
