//! Weak-reference cache keeping one resource per URL
//!
//! Every successful lookup holds its value strongly. A flush downgrades
//! entries to weak references, so values nobody else holds are dropped,
//! and prunes entries whose values are gone. A value a caller still holds
//! is never lost: it can always be found again by key.

use std::collections::HashMap;
use std::hash::Hash;
use std::rc::{Rc, Weak};

enum CacheRef<V> {
    Strong(Rc<V>),
    Weak(Weak<V>),
}

impl<V> CacheRef<V> {
    fn upgrade(&self) -> Option<Rc<V>> {
        match self {
            Self::Strong(value) => Some(value.clone()),
            Self::Weak(value) => value.upgrade(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Self::Strong(_) => true,
            Self::Weak(value) => value.strong_count() > 0,
        }
    }
}

pub(crate) struct WeakCache<K, V> {
    entries: HashMap<K, CacheRef<V>>,
    count_limit: usize,
}

impl<K: Eq + Hash + Clone, V> WeakCache<K, V> {
    pub(crate) fn new(count_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            count_limit,
        }
    }

    /// Find a live value, holding it strongly until the next flush
    pub(crate) fn get(&mut self, key: &K) -> Option<Rc<V>> {
        let value = self.entries.get(key)?.upgrade();
        match &value {
            Some(value) => {
                self.entries
                    .insert(key.clone(), CacheRef::Strong(value.clone()));
            }
            None => {
                self.entries.remove(key);
            }
        }
        value
    }

    /// Store a value; returns true if the cache is now over its limit
    pub(crate) fn insert(&mut self, key: K, value: Rc<V>) -> bool {
        self.entries.insert(key, CacheRef::Strong(value));
        self.entries.len() > self.count_limit
    }

    /// Values currently held strongly, as flush candidates
    pub(crate) fn strong_entries(&self) -> Vec<(K, Rc<V>)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                CacheRef::Strong(value) => Some((key.clone(), value.clone())),
                CacheRef::Weak(_) => None,
            })
            .collect()
    }

    /// Downgrade the given entries, then drop every entry whose value is gone
    pub(crate) fn weaken(&mut self, keys: &[K]) {
        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                if let CacheRef::Strong(value) = entry {
                    *entry = CacheRef::Weak(Rc::downgrade(value));
                }
            }
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_alive());
        tracing::debug!(
            "Flushed {} of {} entries; {} evicted, {} remain",
            keys.len(),
            before,
            before - self.entries.len(),
            self.entries.len()
        );
    }

    /// Every value still alive
    pub(crate) fn live_values(&self) -> Vec<Rc<V>> {
        self.entries.values().filter_map(CacheRef::upgrade).collect()
    }

    /// Remove every entry, returning the strongly held values so the caller
    /// can drop them outside any borrow
    pub(crate) fn drain(&mut self) -> Vec<Rc<V>> {
        self.entries
            .drain()
            .filter_map(|(_, entry)| match entry {
                CacheRef::Strong(value) => Some(value),
                CacheRef::Weak(_) => None,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
