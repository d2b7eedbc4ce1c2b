// String interning: at most one live CrocString per byte content.
//
// The map holds weak ownership - dead entries are dropped by the sweep
// phase. Lookup resurrects strings that are condemned but not yet swept.

use crate::value::StringId;
use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

pub struct StringInterner {
    // Content hash -> candidate ids. Collisions are resolved by comparing
    // content in the pool.
    map: HashMap<u64, Vec<StringId>, RandomState>,
    hashbuilder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hashbuilder: RandomState::new(),
        }
    }

    #[inline(always)]
    pub fn hash_str(&self, s: &str) -> u64 {
        let mut hasher = self.hashbuilder.build_hasher();
        s.hash(&mut hasher);
        hasher.finish()
    }

    pub fn candidates(&self, hash: u64) -> &[StringId] {
        self.map.get(&hash).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn insert(&mut self, hash: u64, id: StringId) {
        self.map.entry(hash).or_default().push(id);
    }

    /// Called by the sweep phase when a string dies.
    pub fn remove_dead(&mut self, hash: u64, id: StringId) {
        if let Some(ids) = self.map.get_mut(&hash) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
