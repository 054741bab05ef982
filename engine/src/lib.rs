//! # docstash Engine
//!
//! The deterministic core of docstash, a typed document store for
//! local-first applications.
//!
//! This crate holds everything that does not touch IO: documents and their
//! metadata, the schema that says which collections exist, the ordered
//! mutation batch, and an in-memory model of object stores with IndexedDB
//! semantics. The async store that drives a real engine lives in
//! `docstash-store`.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, no network, no timers
//! - **Deterministic**: timestamps and identifiers are passed in or injected
//! - **Testable**: pure logic, no mocks needed
//! - **Portable**: runs anywhere Rust runs (native, WASM)
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] is an application body stored alongside an `_id` and a
//! `_meta` block ([`DocumentMetadata`]) naming its collection and its
//! creation and last-write timestamps. A document lives either in the
//! `local` or the `remote` store ([`Placement`]), never both.
//!
//! ### Schema
//!
//! [`Schema`] is the runtime table of declared collections and optional
//! field rules. [`Collection`], [`StoreSchema`] and [`Declares`] give the
//! same information to the compiler so typed mutations only compile for
//! declared collections.
//!
//! ### Mutations
//!
//! A [`MutationBatch`] is an append-only queue of [`MutationAction`]s. Each
//! action gets the next `opID` (starting at 1) when it is pushed.
//!
//! ### Object stores
//!
//! [`Database`] and [`ObjectStore`] model an IndexedDB database: records
//! keyed by [`Key`]s found at a [`KeyPath`], key generators, and secondary
//! indexes. [`layout`] fixes the four stores every docstash database has.
//!
//! ## Quick Start
//!
//! ```rust
//! use docstash_engine::{
//!     layout, CollectionSchema, Document, FieldDef, FieldType, MutationBatch, MutationType,
//!     Schema,
//! };
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new(1).with_collection(CollectionSchema::new(
//!     "users",
//!     vec![FieldDef::required("name", FieldType::String)],
//! ));
//!
//! // 2. Build a document
//! let doc = Document::new("user_1", "users", json!({"name": "Alice"}), 1706745600000);
//! let value = doc.to_value().unwrap();
//! assert_eq!(value["_meta"]["collectionName"], "users");
//!
//! // 3. Queue mutations
//! let mut batch = MutationBatch::new();
//! let op_id = batch.push(MutationType::Create, "user_1", "users", Some(value));
//! assert_eq!(op_id, 1);
//!
//! for action in batch.actions() {
//!     schema.validate_action(action).unwrap();
//! }
//!
//! // 4. The stores every database is provisioned with
//! assert_eq!(layout::ALL_STORES, ["clientInfo", "remote", "local", "intercom"]);
//! ```
//!
//! ## Persistence
//!
//! Use [`Snapshot`] to capture and restore [`Database`]s. Snapshots are
//! serializable to JSON with deterministic ordering.

pub mod collection;
pub mod document;
pub mod error;
pub mod id;
pub mod layout;
pub mod mutation;
pub mod objectstore;
pub mod schema;
pub mod snapshot;

// Re-export main types at crate root
pub use collection::{Collection, Declares, StoreSchema};
pub use document::{Body, Document, DocumentMetadata, Placement, RawDocument};
pub use error::Error;
pub use id::{IdSource, SequentialIdSource, UuidV7Source};
pub use layout::{BatchRecord, ClientInfo};
pub use mutation::{MutationAction, MutationBatch, MutationType};
pub use objectstore::{Database, IndexDef, Key, KeyPath, ObjectStore, ObjectStoreDef};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use snapshot::{DatabaseSnapshot, Snapshot, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type DocumentId = String;
pub type CollectionName = String;
pub type OpId = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
