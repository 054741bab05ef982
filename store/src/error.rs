//! Unified error handling for the store.

use crate::backend::BackendError;
use crate::config::ConfigError;
use docstash_engine::{DocumentId, OpId};
use std::sync::Arc;

/// Store error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The connection could not be established. Cached for the lifetime of
    /// the connection manager; every later request sees the same cause.
    #[error("Connection unusable: {0}")]
    ConnectionUnusable(Arc<BackendError>),

    #[error("Failed to open transaction: {0}")]
    TransactionOpenFailed(BackendError),

    /// A queued mutation was rejected by the engine.
    #[error("Operation {op_id} (position {position}, document {document_id}) failed: {source}")]
    OperationFailed {
        op_id: OpId,
        position: usize,
        document_id: DocumentId,
        source: BackendError,
    },

    /// The transaction ended before the operation settled.
    #[error("Transaction aborted while operation {op_id} was pending: {source}")]
    TransactionAborted { op_id: OpId, source: BackendError },

    #[error("Failed to read document {id}: {source}")]
    ReadFailed { id: DocumentId, source: BackendError },

    /// A write outside a batch failed.
    #[error("Failed to write document {id}: {source}")]
    WriteFailed { id: DocumentId, source: BackendError },

    #[error("Engine error: {0}")]
    Engine(#[from] docstash_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// The engine error behind this failure, if there is one.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Error::ConnectionUnusable(source) => Some(source.as_ref()),
            Error::TransactionOpenFailed(source)
            | Error::OperationFailed { source, .. }
            | Error::TransactionAborted { source, .. }
            | Error::ReadFailed { source, .. }
            | Error::WriteFailed { source, .. } => Some(source),
            Error::Engine(_) | Error::Config(_) => None,
        }
    }

    /// Whether the failure rolled back a batch.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Error::OperationFailed { .. } | Error::TransactionAborted { .. }
        )
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
