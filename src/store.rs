//! Key/value store bridged through the execution context so tasks can
//! publish outputs for their dependents.
//!
//! The engine is agnostic to the implementation beyond thread safety of
//! the two [`Storer`] operations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::types::{Key, StoreValue};

/// Minimal contract a store must satisfy.
pub trait Storer: Send + Sync {
    /// Record a value under a key, replacing any previous value.
    fn store(&self, key: Key, value: StoreValue);

    /// Look up the value recorded under a key.
    fn load(&self, key: &Key) -> Option<StoreValue>;
}

/// Copy-on-write map store: reads take a snapshot, writes clone the map.
/// Suited to read-heavy workloads such as fan-in graphs where many
/// dependents fetch a few published values.
#[derive(Default)]
pub struct MapStore {
    map: RwLock<Arc<HashMap<Key, StoreValue>>>,
}

impl MapStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<HashMap<Key, StoreValue>> {
        Arc::clone(&self.map.read().expect("store lock poisoned"))
    }
}

impl Storer for MapStore {
    fn store(&self, key: Key, value: StoreValue) {
        let mut guard = self.map.write().expect("store lock poisoned");
        let mut next = HashMap::clone(&guard);
        next.insert(key, value);
        *guard = Arc::new(next);
    }

    fn load(&self, key: &Key) -> Option<StoreValue> {
        self.snapshot().get(key).cloned()
    }
}
