//! Secondary indices.
//!
//! An index maps keys computed from a value to the IDs holding that value.
//! The table updates every index in the same critical section that persists
//! the entry, right after the bytes hit the disk.

use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type KeyFn<V> = Box<dyn Fn(&V) -> Vec<String> + Send + Sync>;

pub struct Index<V> {
    key_fn: KeyFn<V>,
    by_key: BTreeMap<String, BTreeSet<String>>,
    by_id: HashMap<String, Vec<String>>,
}

impl<V> Index<V> {
    pub fn new(key_fn: KeyFn<V>) -> Self {
        Self {
            key_fn,
            by_key: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Re-indexes `id`. `None` removes it.
    pub fn update(&mut self, id: &str, value: Option<&V>) {
        if let Some(old_keys) = self.by_id.remove(id) {
            for key in old_keys {
                if let Some(ids) = self.by_key.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.by_key.remove(&key);
                    }
                }
            }
        }
        let Some(value) = value else { return };
        let mut keys = (self.key_fn)(value);
        keys.sort();
        keys.dedup();
        for key in &keys {
            self.by_key
                .entry(key.clone())
                .or_default()
                .insert(id.to_string());
        }
        if !keys.is_empty() {
            self.by_id.insert(id.to_string(), keys);
        }
    }

    pub fn find(&self, key: &str) -> Vec<String> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }
}
