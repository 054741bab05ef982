//! The fixed set of object stores every docstash database carries, and the
//! records kept in the two bookkeeping stores.

use crate::{CollectionName, IndexDef, ObjectStoreDef, Timestamp};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_NAME: &str = "LikelyMindsLM";
pub const DEFAULT_DATABASE_VERSION: u32 = 1;

/// Per-client bookkeeping, keyed by `clientID`
pub const CLIENT_INFO: &str = "clientInfo";
/// Server copies of documents
pub const REMOTE: &str = "remote";
/// Documents mutated on this client and not yet reconciled
pub const LOCAL: &str = "local";
/// Committed batch records, keyed by a generated `batchID`
pub const INTERCOM: &str = "intercom";

/// Index over the collection a record belongs to.
pub const BY_COLLECTION_NAME: &str = "by-collectionName";

/// Every store a transaction is scoped to, in declaration order.
pub const ALL_STORES: [&str; 4] = [CLIENT_INFO, REMOTE, LOCAL, INTERCOM];

/// Definitions of the four stores.
pub fn object_stores() -> Vec<ObjectStoreDef> {
    vec![
        ObjectStoreDef::new(CLIENT_INFO).key_path("clientID"),
        document_store(REMOTE),
        document_store(LOCAL),
        ObjectStoreDef::new(INTERCOM)
            .key_path("batchID")
            .auto_increment()
            .with_index(IndexDef::new(BY_COLLECTION_NAME, "collectionNames").multi_entry()),
    ]
}

fn document_store(name: &str) -> ObjectStoreDef {
    ObjectStoreDef::new(name)
        .key_path("_id")
        .with_index(IndexDef::new(BY_COLLECTION_NAME, "_meta.collectionName"))
}

/// Record in the `clientInfo` store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub created_at: Timestamp,
}

/// Record in the `intercom` store, written once per committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    /// Assigned by the store's key generator
    #[serde(rename = "batchID", skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<i64>,
    pub collection_names: Vec<CollectionName>,
    pub mutation_count: usize,
    pub committed_at: Timestamp,
}
