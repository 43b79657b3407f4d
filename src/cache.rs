//! # Bounded Cache
//!
//! Generic key/value store with an insertion bound: once the configured
//! limit is reached, the entire store is wiped before the new entry goes in.
//! Not LRU — a deliberate O(1) policy trading occasional cold-cache bursts
//! for bounded memory.
//!
//! Operations are synchronous and not safe for concurrent mutation; callers
//! serialize access externally (the engine keeps each instance behind a
//! `Mutex`).

use std::collections::HashMap;
use std::hash::Hash;

/// Bounded key/value store with wipe-on-limit semantics
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    data: HashMap<K, V>,
    limit: Option<usize>,
}

impl<K: Eq + Hash, V> BoundedCache<K, V> {
    /// Create a cache; `limit = None` (or `Some(0)`) means unbounded
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            data: HashMap::new(),
            limit: limit.filter(|&n| n > 0),
        }
    }

    /// Whether `key` is present
    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Get a stored value
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    /// Get a stored value, or insert and return `fallback()`
    pub fn get_or(&mut self, key: K, fallback: impl FnOnce() -> V) -> &V {
        self.data.entry(key).or_insert_with(fallback)
    }

    /// Insert a value, wiping the whole store first if the limit is reached
    pub fn set(&mut self, key: K, value: V) {
        if let Some(limit) = self.limit {
            if self.data.len() >= limit && !self.data.contains_key(&key) {
                self.data.clear();
            }
        }
        self.data.insert(key, value);
    }

    /// Remove everything except the named keys
    pub fn clear(&mut self, excluded: &[K]) {
        if excluded.is_empty() {
            self.data.clear();
        } else {
            self.data.retain(|k, _| excluded.contains(k));
        }
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
