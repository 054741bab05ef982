//! The boundary to the transactional object-store engine.
//!
//! These traits describe the slice of an IndexedDB-style engine docstash
//! relies on. Opening a database, creating a transaction and every
//! per-store operation either throw synchronously (`Err`) or hand back a
//! [`Request`] that later settles with success or an error. Transactions
//! signal their outcome separately through an [`OutcomeSignal`].

#[cfg(target_arch = "wasm32")]
pub mod indexeddb;
#[cfg(not(target_arch = "wasm32"))]
pub mod memory;

use crate::race::{OutcomeSignal, Request};
use docstash_engine::{IndexDef, Key, KeyPath};
use serde_json::Value;
use thiserror::Error;

/// Category of an engine failure, named after the DOMException it mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Abort,
    Constraint,
    Data,
    InvalidAccess,
    InvalidState,
    NotFound,
    QuotaExceeded,
    ReadOnly,
    TransactionInactive,
    Type,
    Version,
    Unknown,
}

impl ErrorKind {
    pub fn dom_name(self) -> &'static str {
        match self {
            ErrorKind::Abort => "AbortError",
            ErrorKind::Constraint => "ConstraintError",
            ErrorKind::Data => "DataError",
            ErrorKind::InvalidAccess => "InvalidAccessError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::QuotaExceeded => "QuotaExceededError",
            ErrorKind::ReadOnly => "ReadOnlyError",
            ErrorKind::TransactionInactive => "TransactionInactiveError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Version => "VersionError",
            ErrorKind::Unknown => "UnknownError",
        }
    }

    pub fn from_dom_name(name: &str) -> Self {
        match name {
            "AbortError" => ErrorKind::Abort,
            "ConstraintError" => ErrorKind::Constraint,
            "DataError" => ErrorKind::Data,
            "InvalidAccessError" => ErrorKind::InvalidAccess,
            "InvalidStateError" => ErrorKind::InvalidState,
            "NotFoundError" => ErrorKind::NotFound,
            "QuotaExceededError" => ErrorKind::QuotaExceeded,
            "ReadOnlyError" => ErrorKind::ReadOnly,
            "TransactionInactiveError" => ErrorKind::TransactionInactive,
            "TypeError" => ErrorKind::Type,
            "VersionError" => ErrorKind::Version,
            _ => ErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dom_name())
    }
}

/// A failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Abort, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

impl From<docstash_engine::Error> for BackendError {
    fn from(err: docstash_engine::Error) -> Self {
        use docstash_engine::Error as E;

        let kind = match &err {
            E::KeyAlreadyExists { .. }
            | E::UniqueIndexViolation { .. }
            | E::ObjectStoreExists(_)
            | E::IndexExists { .. } => ErrorKind::Constraint,
            E::InvalidKey(_)
            | E::InvalidPayload(_)
            | E::IdMismatch { .. }
            | E::CollectionMismatch { .. } => ErrorKind::Data,
            E::ObjectStoreNotFound(_) | E::IndexNotFound { .. } | E::CollectionNotFound(_) => {
                ErrorKind::NotFound
            }
            _ => ErrorKind::Unknown,
        };

        Self::new(kind, err.to_string())
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "readonly"),
            TransactionMode::ReadWrite => write!(f, "readwrite"),
        }
    }
}

/// Schema operations available while a database is being upgraded.
pub trait UpgradeContext {
    /// Version the database had before this upgrade (0 when new).
    fn old_version(&self) -> u32;

    fn new_version(&self) -> u32;

    fn object_store_names(&self) -> Vec<String>;

    fn create_object_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), BackendError>;

    fn index_names(&self, store: &str) -> Result<Vec<String>, BackendError>;

    fn create_index(&mut self, store: &str, index: &IndexDef) -> Result<(), BackendError>;
}

/// Runs inside the engine's upgrade step, before the open succeeds. An error
/// fails the open.
pub type UpgradeHandler =
    Box<dyn FnOnce(&mut dyn UpgradeContext) -> Result<(), BackendError> + Send>;

/// An engine that can open databases.
pub trait StorageBackend: Send + Sync + 'static {
    type Database: BackendDatabase;

    /// Open `name` at `version`, running `on_upgrade` if the stored version is
    /// older. `Err` means the engine threw before an open request existed.
    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler,
    ) -> Result<Request<Self::Database>, BackendError>;
}

/// An open database connection.
pub trait BackendDatabase: Send + Sync + 'static {
    type Transaction: BackendTransaction;

    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn object_store_names(&self) -> Vec<String>;

    /// Request a transaction over `scope`. The request settles once the
    /// engine has scheduled the transaction.
    fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<Request<Self::Transaction>, BackendError>;
}

/// A live transaction.
///
/// Engines commit automatically once a transaction is dropped while still
/// active; [`BackendTransaction::commit`] makes that explicit.
pub trait BackendTransaction: Send + Sync + 'static {
    type ObjectStore: BackendObjectStore;

    fn mode(&self) -> TransactionMode;

    fn object_store(&self, name: &str) -> Result<Self::ObjectStore, BackendError>;

    /// Fires once, with either "committed" or "aborted".
    fn outcome(&self) -> OutcomeSignal;

    /// Ask the engine to commit once pending requests have settled.
    fn commit(&self) -> Result<(), BackendError>;

    /// Roll back everything done in the transaction. No-op once finished.
    fn abort(&self);
}

/// An object store reached through a transaction.
pub trait BackendObjectStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Insert a new record; fails with `ConstraintError` if the key exists.
    fn add(&self, value: Value) -> Request<Key>;

    /// Insert or replace a record.
    fn put(&self, value: Value) -> Request<Key>;

    fn delete(&self, key: Key) -> Request<()>;

    fn get(&self, key: Key) -> Request<Option<Value>>;

    fn get_all(&self) -> Request<Vec<Value>>;

    fn get_all_by_index(&self, index: &str, key: Key) -> Request<Vec<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BackendError::constraint("key already exists");
        assert_eq!(err.to_string(), "ConstraintError: key already exists");
    }

    #[test]
    fn dom_names_roundtrip() {
        for kind in [
            ErrorKind::Abort,
            ErrorKind::Constraint,
            ErrorKind::QuotaExceeded,
            ErrorKind::TransactionInactive,
            ErrorKind::Version,
        ] {
            assert_eq!(ErrorKind::from_dom_name(kind.dom_name()), kind);
        }
        assert_eq!(ErrorKind::from_dom_name("SomethingNew"), ErrorKind::Unknown);
    }

    #[test]
    fn engine_errors_map_to_kinds() {
        let err: BackendError = docstash_engine::Error::KeyAlreadyExists {
            store: "local".into(),
            key: "\"a\"".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Constraint);

        let err: BackendError = docstash_engine::Error::InvalidKey("bad".into()).into();
        assert_eq!(err.kind, ErrorKind::Data);

        let err: BackendError = docstash_engine::Error::ObjectStoreNotFound("x".into()).into();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn mode_display() {
        assert_eq!(TransactionMode::ReadOnly.to_string(), "readonly");
        assert_eq!(TransactionMode::ReadWrite.to_string(), "readwrite");
    }
}
