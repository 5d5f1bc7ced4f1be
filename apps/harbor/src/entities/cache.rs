use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    complete: bool,
}

/// In-memory store behind the cache tier. Entries remember whether they came
/// from a full fetch; a partial result never replaces a complete one.
#[derive(Debug)]
pub struct EntityCache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
}

impl<K, V> Clone for EntityCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> Default for EntityCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).map(|entry| entry.value.clone())
    }

    pub fn is_complete(&self, key: &K) -> bool {
        self.entries.read().get(key).is_some_and(|entry| entry.complete)
    }

    /// Returns whether the value was stored.
    pub fn insert(&self, key: K, value: V, complete: bool) -> bool {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.complete && !complete {
                return false;
            }
        }
        entries.insert(key, Entry { value, complete });
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
