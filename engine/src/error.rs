//! Error types for the docstash engine.

use crate::{CollectionName, DocumentId};
use thiserror::Error;

/// All possible errors from the docstash engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("document id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: DocumentId, got: DocumentId },

    #[error("document belongs to '{got}', not '{expected}'")]
    CollectionMismatch {
        expected: CollectionName,
        got: CollectionName,
    },

    // Object store errors
    #[error("key already exists in '{store}': {key}")]
    KeyAlreadyExists { store: String, key: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("object store not found: {0}")]
    ObjectStoreNotFound(String),

    #[error("object store already exists: {0}")]
    ObjectStoreExists(String),

    #[error("index not found: {store}.{index}")]
    IndexNotFound { store: String, index: String },

    #[error("index already exists: {store}.{index}")]
    IndexExists { store: String, index: String },

    #[error("unique index '{index}' violated by key {key}")]
    UniqueIndexViolation { index: String, key: String },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::CollectionNotFound("users".into());
        assert_eq!(err.to_string(), "collection not found: users");

        let err = Error::KeyAlreadyExists {
            store: "local".into(),
            key: "\"doc-1\"".into(),
        };
        assert_eq!(err.to_string(), "key already exists in 'local': \"doc-1\"");

        let err = Error::TypeMismatch {
            field: "age".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'age': expected Int, got String"
        );

        let err = Error::CollectionMismatch {
            expected: "notes".into(),
            got: "tags".into(),
        };
        assert_eq!(err.to_string(), "document belongs to 'tags', not 'notes'");
    }
}
