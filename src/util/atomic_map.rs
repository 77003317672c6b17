use std::hash::Hash;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;


/// Copy-on-write map: readers get a consistent snapshot, writers install a modified copy
///  atomically. Intended for small, rarely changing tables that are read on every message.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone, V: Clone> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone, V: Clone> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load()
            .get(key)
            .cloned()
    }

    /// applies `f` to a copy of the current map and installs the result; returns whatever `f`
    ///  returns
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut guard = self.map.write()
            .unwrap_or_else(|e| e.into_inner());
        let mut map: FxHashMap<K,V> = (**guard).clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }
}
