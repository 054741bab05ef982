//! Connection manager.
//!
//! Owns the single connection to the docstash database. The connection is
//! opened lazily, on the first request for it, and the outcome of that one
//! open attempt is kept for the manager's lifetime: every caller, before or
//! after the open completes, gets the same connection or the same failure.

use crate::backend::{BackendDatabase, BackendError, StorageBackend, TransactionMode};
use crate::config::Config;
use crate::provision;
use crate::transaction::TransactionHandle;
use crate::{Error, Result};
use docstash_engine::layout;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Transaction type of a backend.
pub type BackendTx<B> = <<B as StorageBackend>::Database as BackendDatabase>::Transaction;

type Outcome<D> = std::result::Result<Arc<D>, Arc<BackendError>>;

/// Lazily opens, provisions and caches the database connection.
///
/// Thread-safe and can be shared via `Arc`.
pub struct ConnectionManager<B: StorageBackend> {
    backend: B,
    config: Config,
    connection: OnceCell<Outcome<B::Database>>,
}

impl<B: StorageBackend> ConnectionManager<B> {
    pub fn new(backend: B, config: Config) -> Self {
        Self {
            backend,
            config,
            connection: OnceCell::new(),
        }
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared(backend: B, config: Config) -> Arc<Self> {
        Arc::new(Self::new(backend, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the open attempt has finished, successfully or not.
    pub fn is_initialized(&self) -> bool {
        self.connection.initialized()
    }

    /// The shared connection, opening it on first use.
    ///
    /// A failed open is permanent: this and every later call return
    /// [`Error::ConnectionUnusable`] carrying the same cause.
    pub async fn connection(&self) -> Result<Arc<B::Database>> {
        match self.connection.get_or_init(|| self.connect()).await {
            Ok(db) => Ok(db.clone()),
            Err(cause) => Err(Error::ConnectionUnusable(cause.clone())),
        }
    }

    async fn connect(&self) -> Outcome<B::Database> {
        let name = self.config.database_name.as_str();
        let version = self.config.database_version;

        info!(database = %name, version, "Opening database");

        let request = self
            .backend
            .open(name, version, provision::upgrade_handler())
            .map_err(|err| {
                error!(database = %name, error = %err, "Database open threw");
                Arc::new(err)
            })?;

        match request.await {
            Ok(db) => {
                info!(
                    database = %db.name(),
                    version = db.version(),
                    stores = ?db.object_store_names(),
                    "Database connection established"
                );
                Ok(Arc::new(db))
            }
            Err(err) => {
                error!(database = %name, error = %err, "Database open failed");
                Err(Arc::new(err))
            }
        }
    }

    /// Open a transaction over every docstash store.
    ///
    /// A failure to create the transaction is reported as
    /// [`Error::TransactionOpenFailed`] and does not affect the connection.
    pub async fn open_transaction(
        &self,
        mode: TransactionMode,
    ) -> Result<TransactionHandle<BackendTx<B>>> {
        let db = self.connection().await?;

        let tx = db
            .transaction(&layout::ALL_STORES, mode)
            .map_err(Error::TransactionOpenFailed)?
            .await
            .map_err(Error::TransactionOpenFailed)?;

        debug!(%mode, "Transaction opened");

        TransactionHandle::new(tx).map_err(Error::TransactionOpenFailed)
    }
}

impl<B: StorageBackend + std::fmt::Debug> std::fmt::Debug for ConnectionManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("initialized", &self.connection.initialized())
            .finish()
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::backend::memory::{JournalEntry, MemoryBackend};
    use crate::backend::BackendTransaction;

    fn manager(backend: MemoryBackend) -> Arc<ConnectionManager<MemoryBackend>> {
        ConnectionManager::new_shared(backend, Config::default().with_database_name("conn-test"))
    }

    #[tokio::test]
    async fn connection_is_cached() {
        let manager = manager(MemoryBackend::new());
        assert!(!manager.is_initialized());

        let first = manager.connection().await.unwrap();
        let second = manager.connection().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.is_initialized());
    }

    fn opens(backend: &MemoryBackend) -> usize {
        backend
            .journal()
            .into_iter()
            .filter(|e| matches!(e, JournalEntry::OpenRequested { .. }))
            .count()
    }

    #[tokio::test]
    async fn callers_before_and_after_the_open_share_one_connection() {
        let backend = MemoryBackend::new();
        let manager = manager(backend.clone());

        // Both start while the open is still pending
        let (a, b) = tokio::join!(manager.connection(), manager.connection());
        let c = manager.connection().await;
        let d = manager.connection().await;

        let all = [a, b, c, d].map(|outcome| outcome.unwrap());
        assert!(all.iter().all(|db| Arc::ptr_eq(db, &all[0])));
        assert_eq!(opens(&backend), 1);
    }

    #[tokio::test]
    async fn callers_before_and_after_a_failed_open_share_one_error() {
        let backend = MemoryBackend::new();
        backend.fail_open(BackendError::unknown("disk gone"));
        let manager = manager(backend.clone());

        let (a, b) = tokio::join!(manager.connection(), manager.connection());
        backend.clear_faults();
        let c = manager.connection().await;
        let d = manager.connection().await;

        let causes = [a, b, c, d].map(|outcome| match outcome {
            Err(Error::ConnectionUnusable(cause)) => cause,
            other => panic!("unexpected result: {other:?}"),
        });
        assert!(causes.iter().all(|cause| Arc::ptr_eq(cause, &causes[0])));
        assert_eq!(causes[0].message, "disk gone");
        assert_eq!(opens(&backend), 1);
    }

    #[tokio::test]
    async fn open_transaction_covers_all_stores() {
        let manager = manager(MemoryBackend::new());
        let handle = manager
            .open_transaction(TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(handle.transaction().mode(), TransactionMode::ReadOnly);
    }
}
