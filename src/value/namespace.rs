// Namespace: string-keyed map with a parent link, forming a tree rooted at
// the VM's globals. Iteration order is insertion order so serialization is
// deterministic.

use crate::value::{NamespaceId, StringId, Value};
use ahash::RandomState;
use indexmap::IndexMap;

pub struct CrocNamespace {
    pub name: StringId,
    pub parent: Option<NamespaceId>,
    entries: IndexMap<StringId, Value, RandomState>,
}

impl CrocNamespace {
    pub fn new(name: StringId, parent: Option<NamespaceId>) -> Self {
        CrocNamespace {
            name,
            parent,
            entries: IndexMap::with_hasher(RandomState::new()),
        }
    }

    #[inline]
    pub fn get(&self, key: StringId) -> Option<Value> {
        self.entries.get(&key).copied()
    }

    #[inline]
    pub fn set(&mut self, key: StringId, value: Value) {
        self.entries.insert(key, value);
    }

    #[inline]
    pub fn contains(&self, key: StringId) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn remove(&mut self, key: StringId) -> Option<Value> {
        self.entries.shift_remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    pub fn pairs(&self) -> Vec<(StringId, Value)> {
        self.iter().collect()
    }
}
