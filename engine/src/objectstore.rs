//! In-memory object stores with IndexedDB semantics.
//!
//! This is the data model behind the memory backend: named databases holding
//! object stores of JSON values, addressed by [`Key`]s extracted through
//! [`KeyPath`]s, with optional key generators and secondary indexes.
//!
//! Semantics follow IndexedDB:
//! - `add` rejects an existing key, `put` replaces
//! - deleting a missing key is not an error
//! - auto-increment stores inject generated keys at their key path
//! - values lacking an index's key path are simply not indexed
//! - multi-entry indexes index each element of an array

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A record key.
///
/// Variant order gives IndexedDB's cross-type ordering: numbers sort before
/// strings, strings before arrays.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Number(i64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    /// Convert a JSON value into a key.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(Key::Number)
                .ok_or_else(|| Error::InvalidKey(format!("non-integer number {n}"))),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Result<Vec<_>>>()
                .map(Key::Array),
            other => Err(Error::InvalidKey(format!(
                "{} is not a valid key",
                crate::schema::json_type_name(other)
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => Value::from(*n),
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n)
    }
}

/// Dotted path into a JSON object, e.g. `_meta.collectionName`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(String);

impl KeyPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Look up the value at this path.
    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.0
            .split('.')
            .try_fold(value, |current, segment| current.as_object()?.get(segment))
    }

    /// Write `key` at this path, creating intermediate objects.
    pub fn inject(&self, value: &mut Value, key: &Key) -> Result<()> {
        let not_object =
            || Error::InvalidKey(format!("cannot inject key at '{}': not an object", self.0));

        let segments: Vec<&str> = self.0.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(not_object());
        };

        let mut current = value;
        for segment in parents {
            current = current
                .as_object_mut()
                .ok_or_else(not_object)?
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }

        current
            .as_object_mut()
            .ok_or_else(not_object)?
            .insert(last.to_string(), key.to_value());
        Ok(())
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl std::fmt::Display for KeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexDef {
    /// A non-unique, single-entry index.
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// Keys under which `value` appears in this index.
    pub fn keys_for(&self, value: &Value) -> Vec<Key> {
        match self.key_path.resolve(value) {
            None => Vec::new(),
            Some(Value::Array(items)) if self.multi_entry => {
                let mut keys: Vec<Key> = items
                    .iter()
                    .filter_map(|item| Key::from_value(item).ok())
                    .collect();
                keys.sort();
                keys.dedup();
                keys
            }
            Some(v) => Key::from_value(v).into_iter().collect(),
        }
    }
}

/// Definition of an object store: its key, its generator and its indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreDef {
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub indexes: Vec<IndexDef>,
}

impl ObjectStoreDef {
    /// An out-of-line, non-generating store with no indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}

/// A single object store.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStore {
    pub(crate) name: String,
    pub(crate) key_path: Option<KeyPath>,
    pub(crate) auto_increment: bool,
    /// Next generated key
    pub(crate) next_key: i64,
    pub(crate) records: BTreeMap<Key, Value>,
    pub(crate) indexes: BTreeMap<String, IndexDef>,
}

impl ObjectStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>, key_path: Option<KeyPath>, auto_increment: bool) -> Self {
        Self {
            name: name.into(),
            key_path,
            auto_increment,
            next_key: 1,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_path(&self) -> Option<&KeyPath> {
        self.key_path.as_ref()
    }

    pub fn auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Create an index. Existing records are indexed immediately.
    pub fn create_index(&mut self, index: IndexDef) -> Result<()> {
        if self.indexes.contains_key(&index.name) {
            return Err(Error::IndexExists {
                store: self.name.clone(),
                index: index.name,
            });
        }

        if index.unique {
            let mut seen = std::collections::BTreeSet::new();
            for value in self.records.values() {
                for key in index.keys_for(value) {
                    if !seen.insert(key.clone()) {
                        return Err(Error::UniqueIndexViolation {
                            index: index.name,
                            key: key.to_string(),
                        });
                    }
                }
            }
        }

        self.indexes.insert(index.name.clone(), index);
        Ok(())
    }

    /// Index names, sorted.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.get(name)
    }

    /// Insert a new record. Fails if the key is taken.
    pub fn add(&mut self, value: Value, key: Option<Key>) -> Result<Key> {
        self.write(value, key, false)
    }

    /// Insert or replace a record.
    pub fn put(&mut self, value: Value, key: Option<Key>) -> Result<Key> {
        self.write(value, key, true)
    }

    fn write(&mut self, mut value: Value, key: Option<Key>, overwrite: bool) -> Result<Key> {
        let (key, generated) = self.resolve_key(&value, key)?;

        if !overwrite && self.records.contains_key(&key) {
            return Err(Error::KeyAlreadyExists {
                store: self.name.clone(),
                key: key.to_string(),
            });
        }

        self.check_unique(&key, &value)?;

        if generated {
            if let Some(path) = &self.key_path {
                path.inject(&mut value, &key)?;
            }
        }

        if let Key::Number(n) = key {
            if self.auto_increment && n >= self.next_key {
                self.next_key = n.saturating_add(1);
            }
        }

        self.records.insert(key.clone(), value);
        Ok(key)
    }

    /// Work out the primary key for `value`. The flag is set for generated keys.
    fn resolve_key(&self, value: &Value, explicit: Option<Key>) -> Result<(Key, bool)> {
        match (&self.key_path, explicit) {
            (Some(path), None) => match path.resolve(value) {
                Some(v) => Ok((Key::from_value(v)?, false)),
                None if self.auto_increment => {
                    if !value.is_object() {
                        return Err(Error::InvalidKey(format!(
                            "cannot inject key at '{path}': not an object"
                        )));
                    }
                    Ok((Key::Number(self.next_key), true))
                }
                None => Err(Error::InvalidKey(format!(
                    "value has no key at '{path}' in store '{}'",
                    self.name
                ))),
            },
            (Some(_), Some(_)) => Err(Error::InvalidKey(format!(
                "store '{}' uses in-line keys; an explicit key is not allowed",
                self.name
            ))),
            (None, Some(key)) => Ok((key, false)),
            (None, None) if self.auto_increment => Ok((Key::Number(self.next_key), true)),
            (None, None) => Err(Error::InvalidKey(format!(
                "store '{}' requires an explicit key",
                self.name
            ))),
        }
    }

    fn check_unique(&self, key: &Key, value: &Value) -> Result<()> {
        for index in self.indexes.values().filter(|i| i.unique) {
            for index_key in index.keys_for(value) {
                let taken = self.records.iter().any(|(other_key, other)| {
                    other_key != key && index.keys_for(other).contains(&index_key)
                });
                if taken {
                    return Err(Error::UniqueIndexViolation {
                        index: index.name.clone(),
                        key: index_key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&mut self, key: &Key) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.records.contains_key(key)
    }

    /// All records in key order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.records.values()
    }

    /// Records whose index entries include `key`, in primary key order.
    pub fn get_all_by_index(&self, index: &str, key: &Key) -> Result<Vec<&Value>> {
        let def = self.indexes.get(index).ok_or_else(|| Error::IndexNotFound {
            store: self.name.clone(),
            index: index.to_string(),
        })?;

        Ok(self
            .records
            .values()
            .filter(|value| def.keys_for(value).contains(key))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record. The key generator is not reset.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// A named, versioned set of object stores.
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub(crate) name: String,
    pub(crate) version: u32,
    pub(crate) stores: BTreeMap<String, ObjectStore>,
}

impl Database {
    /// Create an empty database. Version 0 means never upgraded.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            stores: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Object store names, sorted.
    pub fn object_store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn contains_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Create an empty object store.
    pub fn create_object_store(
        &mut self,
        name: &str,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) -> Result<&mut ObjectStore> {
        if self.stores.contains_key(name) {
            return Err(Error::ObjectStoreExists(name.to_string()));
        }

        Ok(self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| ObjectStore::new(name, key_path, auto_increment)))
    }

    pub fn store(&self, name: &str) -> Result<&ObjectStore> {
        self.stores
            .get(name)
            .ok_or_else(|| Error::ObjectStoreNotFound(name.to_string()))
    }

    pub fn store_mut(&mut self, name: &str) -> Result<&mut ObjectStore> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| Error::ObjectStoreNotFound(name.to_string()))
    }

    /// Replace a store wholesale, used when a transaction's working copy
    /// is committed.
    pub fn replace_store(&mut self, store: ObjectStore) {
        self.stores.insert(store.name.clone(), store);
    }
}
