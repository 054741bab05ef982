//! Document types: the unit of storage.
//!
//! Every stored document carries an `_id` and a `_meta` block next to its
//! application fields:
//!
//! ```json
//! {"_id": "0190...", "_meta": {"collectionName": "users", "createdAt": 1, "lastUpdatedAt": 2}, "name": "Ada"}
//! ```

use crate::{error::Result, layout, CollectionName, DocumentId, Error, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Untyped document body.
pub type Body = Map<String, Value>;

/// A document whose body has not been bound to an application type.
pub type RawDocument = Document<Body>;

/// Where a document currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Mutated on this client and not yet reconciled
    Local,
    /// Server copy
    Remote,
}

impl Placement {
    /// Name of the object store holding documents with this placement.
    pub fn store_name(self) -> &'static str {
        match self {
            Placement::Local => layout::LOCAL,
            Placement::Remote => layout::REMOTE,
        }
    }
}

/// Library-maintained metadata stored under `_meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Collection the document belongs to
    pub collection_name: CollectionName,
    /// When the document was created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the document was last written (milliseconds since epoch)
    pub last_updated_at: Timestamp,
}

impl DocumentMetadata {
    pub fn new(collection_name: impl Into<CollectionName>, timestamp: Timestamp) -> Self {
        Self {
            collection_name: collection_name.into(),
            created_at: timestamp,
            last_updated_at: timestamp,
        }
    }

    /// Stamp a write. Never moves `last_updated_at` before `created_at`.
    pub fn touch(&mut self, timestamp: Timestamp) {
        self.last_updated_at = timestamp.max(self.created_at);
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    #[serde(rename = "_meta")]
    pub meta: DocumentMetadata,
    /// Application fields, stored alongside `_id` and `_meta`
    #[serde(flatten)]
    pub body: T,
}

impl<T> Document<T> {
    /// Create a new document stamped at `timestamp`.
    pub fn new(
        id: impl Into<DocumentId>,
        collection_name: impl Into<CollectionName>,
        body: T,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            meta: DocumentMetadata::new(collection_name, timestamp),
            body,
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.meta.collection_name
    }
}

impl<T: Serialize> Document<T> {
    /// Serialize into the stored JSON layout.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Erase the body type.
    pub fn into_raw(self) -> Result<RawDocument> {
        let body = match serde_json::to_value(&self.body) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(Error::InvalidPayload(format!(
                    "document body must be an object, got {}",
                    crate::schema::json_type_name(&other)
                )))
            }
            Err(e) => return Err(Error::InvalidPayload(e.to_string())),
        };

        Ok(Document {
            id: self.id,
            meta: self.meta,
            body,
        })
    }
}

impl RawDocument {
    /// Parse a stored JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Bind the body to an application type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Document<T>> {
        let body = serde_json::from_value(Value::Object(self.body))
            .map_err(|e| Error::InvalidPayload(e.to_string()))?;

        Ok(Document {
            id: self.id,
            meta: self.meta,
            body,
        })
    }
}
