//! # docstash Store
//!
//! Typed document store with atomic batched mutations, built on a
//! transactional, asynchronous object-store engine: IndexedDB in the
//! browser, an in-memory engine with the same event semantics everywhere
//! else.
//!
//! ## Layers
//!
//! - [`backend`]: the engine boundary traits and the engines themselves
//! - [`connection::ConnectionManager`]: one lazily opened, provisioned and
//!   cached connection
//! - [`transaction::TransactionHandle`]: a transaction over the four stores,
//!   with requests raced against its outcome
//! - [`batch::BatchedMutation`]: ordered, all-or-nothing mutation batches
//! - [`DocStore`]: the facade applications use
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docstash_engine::{store_schema, Collection};
//! use docstash_store::{backend::memory::MemoryBackend, Config, DocStore};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Note {
//!     title: String,
//! }
//!
//! struct Notes;
//!
//! impl Collection for Notes {
//!     const NAME: &'static str = "notes";
//!     type Doc = Note;
//! }
//!
//! store_schema! {
//!     struct AppSchema {
//!         version: 1,
//!         collections: [Notes],
//!     }
//! }
//!
//! # async fn run() -> docstash_store::Result<()> {
//! let store: DocStore<AppSchema, _> = DocStore::new(MemoryBackend::new(), Config::default());
//!
//! let id = store.generate_document_id();
//! let mut batch = store.batched_mutations().await?;
//! batch.add::<Notes>(id.clone(), Note { title: "hello".into() })?;
//! batch.execute_batch().await?;
//!
//! assert!(store.get::<Notes>(&id).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod connection;
pub mod docstore;
pub mod error;
pub mod provision;
pub mod race;
pub mod transaction;

pub use batch::{BatchReport, BatchState, BatchedMutation};
pub use config::{Config, ConfigError};
pub use connection::{BackendTx, ConnectionManager};
pub use docstore::DocStore;
pub use error::{Error, Result};
pub use transaction::{Settled, TransactionHandle};

use docstash_engine::Timestamp;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
