//! Bookkeeping carried between a read and the following write.

use std::collections::{BTreeMap, BTreeSet};

use super::context::MainInfo;
use super::field::{FieldKey, FieldName};

/// Keys known to exist in storage, per field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownKeys {
    keys: BTreeMap<FieldName, BTreeSet<FieldKey>>,
}

impl KnownKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of one field; empty when nothing is known.
    pub fn get(&self, field: FieldName) -> &BTreeSet<FieldKey> {
        static EMPTY: BTreeSet<FieldKey> = BTreeSet::new();
        self.keys.get(&field).unwrap_or(&EMPTY)
    }

    pub fn set(&mut self, field: FieldName, keys: BTreeSet<FieldKey>) {
        self.keys.insert(field, keys);
    }

    pub fn extend(&mut self, field: FieldName, keys: impl IntoIterator<Item = FieldKey>) {
        self.keys.entry(field).or_default().extend(keys);
    }

    pub fn insert(&mut self, field: FieldName, key: FieldKey) {
        self.keys.entry(field).or_default().insert(key);
    }

    pub fn remove(&mut self, field: FieldName, key: &FieldKey) {
        if let Some(keys) = self.keys.get_mut(&field) {
            keys.remove(key);
        }
    }

    pub fn contains(&self, field: FieldName, key: &FieldKey) -> bool {
        self.get(field).contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.values().all(|k| k.is_empty())
    }
}

/// Content hashes of field entries as last seen in storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    hashes: BTreeMap<FieldName, BTreeMap<FieldKey, String>>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: FieldName, key: &FieldKey) -> Option<&str> {
        self.hashes.get(&field)?.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, field: FieldName, key: FieldKey, hash: String) {
        self.hashes.entry(field).or_default().insert(key, hash);
    }

    pub fn remove(&mut self, field: FieldName, key: &FieldKey) {
        if let Some(hashes) = self.hashes.get_mut(&field) {
            hashes.remove(key);
        }
    }

    pub fn contains(&self, field: FieldName, key: &FieldKey) -> bool {
        self.get(field, key).is_some()
    }

    pub fn len(&self, field: FieldName) -> usize {
        self.hashes.get(&field).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.values().all(|h| h.is_empty())
    }
}

/// What a materialised context remembers about its stored counterpart.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// MAIN record as last read or written; `None` until the context is stored.
    pub stored: Option<MainInfo>,
    pub known_keys: KnownKeys,
    /// Keys materialised in memory, used to detect caller-side removals.
    pub loaded: KnownKeys,
    pub baseline: Baseline,
}
