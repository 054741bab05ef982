//! Snapshot types for persisting and restoring object-store databases.
//!
//! Snapshots are the bridge between in-memory [`Database`]s and persistent
//! storage. They are designed for deterministic serialization so the same
//! state always produces the same bytes.

use crate::{
    error::Result, Database, Error, IndexDef, Key, KeyPath, ObjectStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Format written by [`Snapshot::to_json`]. Readers accept this and older.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time image of a set of databases, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format_version: u32,
    pub databases: BTreeMap<String, DatabaseSnapshot>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            databases: BTreeMap::new(),
        }
    }

    /// Capture a database, replacing any earlier image with the same name.
    pub fn add_database(&mut self, database: &Database) {
        self.databases
            .insert(database.name.clone(), DatabaseSnapshot::capture(database));
    }

    /// Rebuild every database in the snapshot.
    pub fn restore(self) -> Result<Vec<Database>> {
        self.databases
            .into_iter()
            .map(|(name, snapshot)| snapshot.restore(name))
            .collect()
    }

    /// Count records across all databases and stores.
    pub fn record_count(&self) -> usize {
        self.databases
            .values()
            .flat_map(|db| db.stores.values())
            .map(|store| store.records.len())
            .sum()
    }

    /// Compact JSON. Databases, stores and records are emitted in key
    /// order, so equal contents give equal text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(invalid)
    }

    /// Indented JSON, used for snapshot files meant to be read by people.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(invalid)
    }

    /// Parse a snapshot written by this or an older format.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json).map_err(invalid)?;
        match snapshot.format_version {
            1..=SNAPSHOT_FORMAT_VERSION => Ok(snapshot),
            found => Err(Error::InvalidSnapshot(format!(
                "format {found} is not readable, expected 1..={SNAPSHOT_FORMAT_VERSION}"
            ))),
        }
    }
}

fn invalid(err: impl std::fmt::Display) -> Error {
    Error::InvalidSnapshot(err.to_string())
}

/// Image of one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSnapshot {
    pub version: u32,
    pub stores: BTreeMap<String, StoreSnapshot>,
}

/// Image of one object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub next_key: i64,
    pub indexes: Vec<IndexDef>,
    /// Records in key order
    pub records: Vec<RecordEntry>,
}

/// A stored record and its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub key: Key,
    pub value: Value,
}

impl DatabaseSnapshot {
    /// Capture a database.
    pub fn capture(database: &Database) -> Self {
        let stores = database
            .stores
            .iter()
            .map(|(name, store)| (name.clone(), StoreSnapshot::capture(store)))
            .collect();

        Self {
            version: database.version,
            stores,
        }
    }

    /// Rebuild the database, checking that every record sits under the key
    /// its value carries.
    pub fn restore(self, name: impl Into<String>) -> Result<Database> {
        let mut database = Database::new(name);
        database.set_version(self.version);

        for (store_name, snapshot) in self.stores {
            let store = snapshot.restore(&store_name)?;
            database.replace_store(store);
        }

        Ok(database)
    }
}

impl StoreSnapshot {
    fn capture(store: &ObjectStore) -> Self {
        Self {
            key_path: store.key_path.clone(),
            auto_increment: store.auto_increment,
            next_key: store.next_key,
            indexes: store.indexes.values().cloned().collect(),
            records: store
                .records
                .iter()
                .map(|(key, value)| RecordEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    fn restore(self, name: &str) -> Result<ObjectStore> {
        let mut store = ObjectStore::new(name, self.key_path, self.auto_increment);
        store.next_key = self.next_key;

        for index in self.indexes {
            store
                .create_index(index)
                .map_err(invalid)?;
        }

        for entry in self.records {
            if let Some(path) = &store.key_path {
                let inline = path
                    .resolve(&entry.value)
                    .map(Key::from_value)
                    .transpose()
                    .map_err(invalid)?;
                if inline.as_ref() != Some(&entry.key) {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {} in '{}' does not carry its key at '{}'",
                        entry.key, name, path
                    )));
                }
            }
            store.records.insert(entry.key, entry.value);
        }

        Ok(store)
    }
}
