//! Bounded least-recently-used map

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Map that evicts its least recently used entry once full
///
/// Recency is tracked with a monotonically increasing stamp per access;
/// the stamp index keeps eviction at `O(log n)`.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    clock: u64,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Looks up an entry and marks it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        let old_stamp = std::mem::replace(&mut entry.1, stamp);
        if let Some(k) = self.recency.remove(&old_stamp) {
            self.recency.insert(stamp, k);
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Inserts or replaces an entry, evicting the least recently used one
    /// when full
    pub fn put(&mut self, key: K, value: V) {
        let stamp = self.tick();
        if let Some((_, old_stamp)) = self.entries.insert(key.clone(), (value, stamp)) {
            self.recency.remove(&old_stamp);
        }
        self.recency.insert(stamp, key);
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    /// Drops every entry whose key fails the predicate
    pub fn retain<F: FnMut(&K) -> bool>(&mut self, mut keep: F) {
        let entries = &mut self.entries;
        self.recency.retain(|_, key| {
            if keep(key) {
                true
            } else {
                entries.remove(key);
                false
            }
        });
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
