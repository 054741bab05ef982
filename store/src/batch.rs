//! Atomic batched mutations.
//!
//! A [`BatchedMutation`] queues creates, updates and deletes inside one
//! read-write transaction and then executes them as a single unit: either
//! every queued action lands, or none does.
//!
//! ## Execution
//!
//! Actions are dispatched strictly one after another in the order they were
//! queued (which is also `opID` order). Each request is raced against the
//! transaction's outcome and the next request is only dispatched once the
//! previous one has settled. The first failure stops the batch; the
//! transaction is aborted and the engine rolls back every write made so far.
//!
//! Documents move between placements on write:
//!
//! | op | requests |
//! |---|---|
//! | CREATE | `local.add(doc)` |
//! | UPDATE | `local.put(doc)`, `remote.delete(id)` |
//! | DELETE | `local.delete(id)`, `remote.delete(id)` |
//!
//! ## Reads
//!
//! [`BatchedMutation::read`] is not queued: it runs immediately in the
//! batch's transaction. Reads are expected to complete before
//! [`BatchedMutation::execute_batch`] is called; nothing orders a read that
//! is still in flight against the writes.

use crate::backend::{BackendObjectStore, BackendTransaction};
use crate::now_ms;
use crate::race::{Request, TxOutcome};
use crate::transaction::{finished_early, Settled, TransactionHandle};
use crate::{Error, Result};
use docstash_engine::error::Error as EngineError;
use docstash_engine::{
    layout, BatchRecord, Collection, CollectionName, Declares, Document, DocumentId, Key,
    MutationAction, MutationBatch, MutationType, OpId, RawDocument, Schema, StoreSchema,
};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    /// Nothing queued yet
    Empty,
    /// At least one action queued
    Queueing,
    /// Actions are being dispatched
    Executing,
    Committed,
    Aborted,
}

/// Summary of an executed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub state: BatchState,
    /// Number of queued actions that were applied
    pub mutations: usize,
    /// `opID` of the last applied action, 0 for an empty batch
    pub last_op_id: OpId,
    /// Key of the intercom record written for the batch, if any
    pub batch_id: Option<i64>,
}

impl BatchReport {
    fn empty() -> Self {
        Self {
            state: BatchState::Empty,
            mutations: 0,
            last_op_id: 0,
            batch_id: None,
        }
    }
}

/// An ordered, all-or-nothing set of mutations over one transaction.
///
/// `S` is the application's [`StoreSchema`]; typed mutations only compile for
/// collections it declares.
pub struct BatchedMutation<S, T: BackendTransaction> {
    handle: TransactionHandle<T>,
    batch: MutationBatch,
    state: BatchState,
    schema: Arc<Schema>,
    record_intercom: bool,
    _schema: PhantomData<fn() -> S>,
}

impl<S: StoreSchema, T: BackendTransaction> BatchedMutation<S, T> {
    /// Start a batch on a read-write transaction.
    pub fn new(handle: TransactionHandle<T>, schema: Arc<Schema>, record_intercom: bool) -> Self {
        Self {
            handle,
            batch: MutationBatch::new(),
            state: BatchState::Empty,
            schema,
            record_intercom,
            _schema: PhantomData,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Queued actions in dispatch order.
    pub fn actions(&self) -> &[MutationAction] {
        self.batch.actions()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn handle(&self) -> &TransactionHandle<T> {
        &self.handle
    }

    /// Queue the creation of a document.
    pub fn add<C>(&mut self, id: impl Into<DocumentId>, body: C::Doc) -> Result<OpId>
    where
        C: Collection,
        S: Declares<C>,
    {
        let document = Document::new(id, C::NAME, body, now_ms());
        let value = document.to_value()?;
        self.enqueue(MutationType::Create, document.id, C::NAME, Some(value))
    }

    /// Queue a full replacement of a document.
    ///
    /// `lastUpdatedAt` is stamped; `createdAt` is kept from `document`.
    pub fn replace<C>(&mut self, mut document: Document<C::Doc>) -> Result<OpId>
    where
        C: Collection,
        S: Declares<C>,
    {
        check_collection(document.collection_name(), C::NAME)?;
        document.meta.touch(now_ms());
        let value = document.to_value()?;
        self.enqueue(MutationType::Update, document.id, C::NAME, Some(value))
    }

    /// Queue the removal of a document.
    pub fn remove<C>(&mut self, id: impl Into<DocumentId>) -> Result<OpId>
    where
        C: Collection,
        S: Declares<C>,
    {
        self.enqueue(MutationType::Delete, id.into(), C::NAME, None)
    }

    /// Queue the creation of a document in a collection named at runtime.
    ///
    /// `body` holds the application fields; `_id` and `_meta` are added.
    pub fn add_value(
        &mut self,
        collection: &str,
        id: impl Into<DocumentId>,
        body: Value,
    ) -> Result<OpId> {
        let Value::Object(body) = body else {
            return Err(EngineError::InvalidPayload("document body must be an object".into()).into());
        };
        let document = RawDocument::new(id, collection, body, now_ms());
        let value = document.to_value()?;
        self.enqueue(MutationType::Create, document.id, collection, Some(value))
    }

    /// Queue a full replacement with a stored document (`_id`, `_meta` and
    /// body) in a collection named at runtime.
    pub fn replace_value(&mut self, collection: &str, document: Value) -> Result<OpId> {
        let mut document = RawDocument::from_value(document)?;
        check_collection(document.collection_name(), collection)?;
        document.meta.touch(now_ms());
        let value = document.to_value()?;
        self.enqueue(MutationType::Update, document.id, collection, Some(value))
    }

    /// Queue the removal of a document from a collection named at runtime.
    pub fn remove_value(&mut self, collection: &str, id: impl Into<DocumentId>) -> Result<OpId> {
        self.enqueue(MutationType::Delete, id.into(), collection, None)
    }

    fn enqueue(
        &mut self,
        op: MutationType,
        id: DocumentId,
        collection: &str,
        doc: Option<Value>,
    ) -> Result<OpId> {
        let schema = &self.schema;
        let op_id = self
            .batch
            .push_checked(op, id, collection, doc, |action| schema.validate_action(action))?;
        self.state = BatchState::Queueing;
        Ok(op_id)
    }

    /// Read a document in the batch's transaction, local placement first.
    pub async fn read(&self, id: &str) -> Result<Option<RawDocument>> {
        Ok(self.handle.find(id).await?.map(|(_, document)| document))
    }

    /// Typed [`read`](Self::read). Documents of other collections are not
    /// returned.
    pub async fn read_as<C>(&self, id: &str) -> Result<Option<Document<C::Doc>>>
    where
        C: Collection,
        S: Declares<C>,
    {
        match self.read(id).await? {
            Some(document) if document.collection_name() == C::NAME => {
                Ok(Some(document.into_typed()?))
            }
            _ => Ok(None),
        }
    }

    /// Read `read_ids`, let `populate` queue mutations based on what was
    /// found, then execute the batch.
    ///
    /// Results are passed in the order of `read_ids`; `None` marks an id that
    /// exists in neither placement.
    pub async fn execute<I, F>(mut self, read_ids: I, populate: F) -> Result<BatchReport>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnOnce(&mut Self, Vec<Option<RawDocument>>) -> Result<()>,
    {
        let mut documents = Vec::new();
        for id in read_ids {
            match self.read(id.as_ref()).await {
                Ok(document) => documents.push(document),
                Err(err) => return Err(self.fail(err)),
            }
        }

        if let Err(err) = populate(&mut self, documents) {
            return Err(self.fail(err));
        }

        self.execute_batch().await
    }

    /// Dispatch every queued action and commit.
    ///
    /// An empty batch resolves immediately without touching the engine.
    pub async fn execute_batch(mut self) -> Result<BatchReport> {
        if self.batch.is_empty() {
            return Ok(BatchReport::empty());
        }

        self.state = BatchState::Executing;
        let collection_names = self.batch.collection_names();
        let last_op_id = self.batch.last_op_id();
        let actions = self.batch.drain();

        for (position, action) in actions.iter().enumerate() {
            debug!(
                op_id = action.op_id,
                op = %action.op,
                collection = %action.collection_name,
                id = %action.id,
                "Dispatching mutation"
            );

            if let Err(err) = self.apply(position, action).await {
                return Err(self.fail(err));
            }
        }

        let batch_id = if self.record_intercom {
            match self
                .record_batch(collection_names, actions.len(), last_op_id)
                .await
            {
                Ok(batch_id) => batch_id,
                Err(err) => return Err(self.fail(err)),
            }
        } else {
            None
        };

        if let Err(source) = self.handle.commit() {
            return Err(self.fail(Error::TransactionAborted {
                op_id: last_op_id,
                source,
            }));
        }

        match self.handle.outcome().await {
            TxOutcome::Committed => {
                self.state = BatchState::Committed;
                info!(
                    mutations = actions.len(),
                    last_op_id,
                    batch_id = ?batch_id,
                    "Batch committed"
                );

                Ok(BatchReport {
                    state: BatchState::Committed,
                    mutations: actions.len(),
                    last_op_id,
                    batch_id,
                })
            }
            TxOutcome::Aborted(source) => Err(self.fail(Error::TransactionAborted {
                op_id: last_op_id,
                source,
            })),
        }
    }

    async fn apply(&self, position: usize, action: &MutationAction) -> Result<()> {
        let key = Key::from(action.id.as_str());
        let local = self.handle.local_cache();
        let remote = self.handle.remote_cache();

        match action.op {
            MutationType::Create => {
                let doc = queued_document(action)?;
                self.step(action.op_id, position, &action.id, local.add(doc))
                    .await?;
            }
            MutationType::Update => {
                let doc = queued_document(action)?;
                self.step(action.op_id, position, &action.id, local.put(doc))
                    .await?;
                self.step(action.op_id, position, &action.id, remote.delete(key))
                    .await?;
            }
            MutationType::Delete => {
                self.step(action.op_id, position, &action.id, local.delete(key.clone()))
                    .await?;
                self.step(action.op_id, position, &action.id, remote.delete(key))
                    .await?;
            }
        }

        Ok(())
    }

    async fn step<V>(
        &self,
        op_id: OpId,
        position: usize,
        document_id: &str,
        request: Request<V>,
    ) -> Result<V> {
        match self.handle.race(request).await {
            Settled::Succeeded(value) => Ok(value),
            Settled::Failed(source) => Err(Error::OperationFailed {
                op_id,
                position,
                document_id: document_id.to_string(),
                source,
            }),
            Settled::Aborted(source) => Err(Error::TransactionAborted { op_id, source }),
            Settled::Finished => Err(Error::TransactionAborted {
                op_id,
                source: finished_early(),
            }),
        }
    }

    async fn record_batch(
        &self,
        collection_names: Vec<CollectionName>,
        mutation_count: usize,
        last_op_id: OpId,
    ) -> Result<Option<i64>> {
        let record = BatchRecord {
            batch_id: None,
            collection_names,
            mutation_count,
            committed_at: now_ms(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| EngineError::InvalidPayload(e.to_string()))?;

        let key = self
            .step(
                last_op_id,
                mutation_count,
                layout::INTERCOM,
                self.handle.intercom().add(value),
            )
            .await?;

        Ok(match key {
            Key::Number(batch_id) => Some(batch_id),
            _ => None,
        })
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = BatchState::Aborted;
        self.handle.abort();
        warn!(error = %err, "Batch aborted");
        err
    }
}

/// A batch that goes away before its commit resolved rolls back, whether it
/// was never executed or its execution future was dropped mid-way.
impl<S, T: BackendTransaction> Drop for BatchedMutation<S, T> {
    fn drop(&mut self) {
        match self.state {
            BatchState::Committed | BatchState::Aborted => {}
            BatchState::Executing => {
                warn!("Batch dropped during execution, rolling back");
                self.handle.abort();
            }
            BatchState::Empty | BatchState::Queueing => self.handle.abort(),
        }
    }
}

fn queued_document(action: &MutationAction) -> Result<Value> {
    action.doc.clone().ok_or_else(|| {
        EngineError::InvalidPayload(format!("{} of '{}' carries no document", action.op, action.id))
            .into()
    })
}

fn check_collection(found: &str, expected: &str) -> Result<()> {
    if found == expected {
        return Ok(());
    }
    Err(EngineError::CollectionMismatch {
        expected: expected.to_string(),
        got: found.to_string(),
    }
    .into())
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryTransaction};
    use crate::backend::TransactionMode;
    use crate::config::Config;
    use crate::connection::ConnectionManager;
    use docstash_engine::{store_schema, CollectionSchema, FieldDef, FieldType};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
    }

    struct Notes;

    impl Collection for Notes {
        const NAME: &'static str = "notes";
        type Doc = Note;

        fn schema() -> CollectionSchema {
            CollectionSchema::new("notes", vec![FieldDef::required("title", FieldType::String)])
        }
    }

    store_schema! {
        struct TestSchema {
            version: 1,
            collections: [Notes],
        }
    }

    async fn batch(backend: &MemoryBackend) -> BatchedMutation<TestSchema, MemoryTransaction> {
        let manager = ConnectionManager::new(backend.clone(), Config::default());
        let handle = manager
            .open_transaction(TransactionMode::ReadWrite)
            .await
            .unwrap();
        BatchedMutation::new(handle, Arc::new(TestSchema::schema()), false)
    }

    fn note(title: &str) -> Note {
        Note {
            title: title.into(),
        }
    }

    #[tokio::test]
    async fn state_moves_to_queueing() {
        let backend = MemoryBackend::new();
        let mut batch = batch(&backend).await;
        assert_eq!(batch.state(), BatchState::Empty);

        assert_eq!(batch.add::<Notes>("n1", note("first")).unwrap(), 1);
        assert_eq!(batch.remove::<Notes>("n0").unwrap(), 2);
        assert_eq!(batch.state(), BatchState::Queueing);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn untyped_mutations_are_validated() {
        let backend = MemoryBackend::new();
        let mut batch = batch(&backend).await;

        let err = batch.add_value("ghosts", "g1", json!({})).unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::CollectionNotFound(_))));

        let err = batch.add_value("notes", "n1", json!({"title": 3})).unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::TypeMismatch { .. })));

        let err = batch.remove_value("ghosts", "g1").unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::CollectionNotFound(_))));

        // Rejected actions take no op ID
        assert_eq!(batch.add_value("notes", "n1", json!({"title": "ok"})).unwrap(), 1);
    }

    #[tokio::test]
    async fn replace_keeps_created_at() {
        let backend = MemoryBackend::new();
        let mut batch = batch(&backend).await;

        let original = Document::new("n1", "notes", note("v1"), 5);
        batch.replace::<Notes>(original).unwrap();

        let stored = batch.actions()[0].doc.clone().unwrap();
        assert_eq!(stored["_meta"]["createdAt"], 5);
        assert!(stored["_meta"]["lastUpdatedAt"].as_u64().unwrap() >= 5);
    }

    #[tokio::test]
    async fn replace_rejects_foreign_documents() {
        let backend = MemoryBackend::new();
        let mut batch = batch(&backend).await;

        let foreign = Document::new("u1", "users", note("v1"), 5);
        assert!(batch.replace::<Notes>(foreign).is_err());
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_reports_empty() {
        let backend = MemoryBackend::new();
        let report = batch(&backend).await.execute_batch().await.unwrap();
        assert_eq!(report, BatchReport::empty());
    }

    #[tokio::test]
    async fn update_moves_document_to_local() {
        let backend = MemoryBackend::new();

        // Seed a server copy
        let seed = batch(&backend).await;
        seed.handle()
            .race(
                seed.handle()
                    .remote_cache()
                    .put(Document::new("n1", "notes", note("server"), 1).to_value().unwrap()),
            )
            .await;
        seed.handle().commit().unwrap();
        drop(seed);

        let mut batch = batch(&backend).await;
        let current = batch.read_as::<Notes>("n1").await.unwrap().unwrap();
        assert_eq!(current.body.title, "server");

        let mut edited = current;
        edited.body.title = "edited".into();
        batch.replace::<Notes>(edited).unwrap();
        let report = batch.execute_batch().await.unwrap();
        assert_eq!(report.state, BatchState::Committed);

        let db = backend.database("LikelyMindsLM").unwrap();
        assert!(db.store("remote").unwrap().is_empty());
        assert_eq!(
            db.store("local").unwrap().get(&Key::from("n1")).unwrap()["title"],
            "edited"
        );
    }
}
