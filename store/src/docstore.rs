//! The application-facing document store.

use crate::backend::{BackendObjectStore, StorageBackend, TransactionMode};
use crate::batch::{BatchReport, BatchedMutation};
use crate::config::Config;
use crate::connection::{BackendTx, ConnectionManager};
use crate::now_ms;
use crate::race::TxOutcome;
use crate::transaction::TransactionHandle;
use crate::{Error, Result};
use docstash_engine::error::Error as EngineError;
use docstash_engine::{
    layout, BatchRecord, ClientInfo, Collection, Declares, Document, DocumentId, IdSource, Key,
    Placement, RawDocument, Schema, StoreSchema, UuidV7Source,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// Typed document store over a storage backend.
///
/// Cheap to clone; clones share one connection.
pub struct DocStore<S: StoreSchema, B: StorageBackend> {
    manager: Arc<ConnectionManager<B>>,
    schema: Arc<Schema>,
    ids: Arc<dyn IdSource>,
    _schema: PhantomData<fn() -> S>,
}

impl<S: StoreSchema, B: StorageBackend> Clone for DocStore<S, B> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            schema: self.schema.clone(),
            ids: self.ids.clone(),
            _schema: PhantomData,
        }
    }
}

impl<S: StoreSchema, B: StorageBackend> DocStore<S, B> {
    pub fn new(backend: B, config: Config) -> Self {
        Self::from_manager(ConnectionManager::new_shared(backend, config))
    }

    /// Build a store on an existing connection manager.
    pub fn from_manager(manager: Arc<ConnectionManager<B>>) -> Self {
        Self {
            manager,
            schema: Arc::new(S::schema()),
            ids: Arc::new(UuidV7Source),
            _schema: PhantomData,
        }
    }

    /// Replace the identifier source (UUIDv7 by default).
    pub fn with_id_source(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<B>> {
        &self.manager
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn generate_document_id(&self) -> DocumentId {
        self.ids.generate()
    }

    /// Start a batch on a fresh read-write transaction.
    pub async fn batched_mutations(&self) -> Result<BatchedMutation<S, BackendTx<B>>> {
        let handle = self
            .manager
            .open_transaction(TransactionMode::ReadWrite)
            .await?;

        Ok(BatchedMutation::new(
            handle,
            self.schema.clone(),
            self.manager.config().record_intercom,
        ))
    }

    /// Read `read_ids`, queue mutations with `populate`, then execute, all in
    /// one transaction.
    pub async fn execute<I, F>(&self, read_ids: I, populate: F) -> Result<BatchReport>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnOnce(&mut BatchedMutation<S, BackendTx<B>>, Vec<Option<RawDocument>>) -> Result<()>,
    {
        self.batched_mutations()
            .await?
            .execute(read_ids, populate)
            .await
    }

    /// Look up a document, local copy first.
    pub async fn get<C>(&self, id: &str) -> Result<Option<Document<C::Doc>>>
    where
        C: Collection,
        S: Declares<C>,
    {
        let handle = self.read_only().await?;

        match handle.find(id).await? {
            Some((_, document)) if document.collection_name() == C::NAME => {
                Ok(Some(document.into_typed()?))
            }
            _ => Ok(None),
        }
    }

    /// Every document of a collection, ordered by id. A local copy hides the
    /// remote copy with the same id.
    pub async fn documents_in<C>(&self) -> Result<Vec<Document<C::Doc>>>
    where
        C: Collection,
        S: Declares<C>,
    {
        let handle = self.read_only().await?;
        let mut merged = BTreeMap::new();

        for placement in [Placement::Remote, Placement::Local] {
            let request = handle
                .store(placement)
                .get_all_by_index(layout::BY_COLLECTION_NAME, Key::from(C::NAME));
            let values = handle
                .race(request)
                .await
                .into_result()
                .map_err(|source| Error::ReadFailed {
                    id: C::NAME.to_string(),
                    source,
                })?;

            for value in values {
                let document = RawDocument::from_value(value)?;
                merged.insert(document.id.clone(), document);
            }
        }

        merged
            .into_values()
            .map(|document| document.into_typed().map_err(Error::from))
            .collect()
    }

    /// Store server copies of documents in the remote placement.
    ///
    /// Documents that have a local copy are skipped. Returns how many were
    /// cached.
    pub async fn cache_remote<C>(&self, documents: Vec<Document<C::Doc>>) -> Result<usize>
    where
        C: Collection,
        S: Declares<C>,
    {
        let handle = self.read_write().await?;

        match cache_into::<C, _>(&handle, documents).await {
            Ok(cached) => {
                finish(handle, layout::REMOTE).await?;
                debug!(collection = C::NAME, cached, "Cached remote documents");
                Ok(cached)
            }
            Err(err) => {
                handle.abort();
                Err(err)
            }
        }
    }

    /// The identifier of this client, created on first use.
    pub async fn client_id(&self) -> Result<String> {
        let handle = self.read_write().await?;

        match self.client_id_in(&handle).await {
            Ok((client_id, created)) => {
                finish(handle, layout::CLIENT_INFO).await?;
                if created {
                    info!(client_id = %client_id, "Registered client");
                }
                Ok(client_id)
            }
            Err(err) => {
                handle.abort();
                Err(err)
            }
        }
    }

    async fn client_id_in(&self, handle: &TransactionHandle<BackendTx<B>>) -> Result<(String, bool)> {
        let existing = handle
            .race(handle.client_info().get_all())
            .await
            .into_result()
            .map_err(|source| Error::ReadFailed {
                id: layout::CLIENT_INFO.to_string(),
                source,
            })?;

        if let Some(value) = existing.into_iter().next() {
            let info: ClientInfo = parse(value)?;
            return Ok((info.client_id, false));
        }

        let info = ClientInfo {
            client_id: self.generate_document_id(),
            created_at: now_ms(),
        };
        let value = serde_json::to_value(&info)
            .map_err(|e| EngineError::InvalidPayload(e.to_string()))?;

        handle
            .race(handle.client_info().add(value))
            .await
            .into_result()
            .map_err(|source| Error::WriteFailed {
                id: info.client_id.clone(),
                source,
            })?;

        Ok((info.client_id, true))
    }

    /// Committed batches that touched `collection`, oldest first.
    pub async fn batches_touching(&self, collection: &str) -> Result<Vec<BatchRecord>> {
        let handle = self.read_only().await?;

        let values = handle
            .race(
                handle
                    .intercom()
                    .get_all_by_index(layout::BY_COLLECTION_NAME, Key::from(collection)),
            )
            .await
            .into_result()
            .map_err(|source| Error::ReadFailed {
                id: layout::INTERCOM.to_string(),
                source,
            })?;

        values.into_iter().map(parse).collect()
    }

    async fn read_only(&self) -> Result<TransactionHandle<BackendTx<B>>> {
        self.manager
            .open_transaction(TransactionMode::ReadOnly)
            .await
    }

    async fn read_write(&self) -> Result<TransactionHandle<BackendTx<B>>> {
        self.manager
            .open_transaction(TransactionMode::ReadWrite)
            .await
    }
}

async fn cache_into<C, T>(
    handle: &TransactionHandle<T>,
    documents: Vec<Document<C::Doc>>,
) -> Result<usize>
where
    C: Collection,
    T: crate::backend::BackendTransaction,
{
    let mut cached = 0;

    for document in documents {
        if document.collection_name() != C::NAME {
            return Err(EngineError::InvalidPayload(format!(
                "document {} belongs to '{}', not '{}'",
                document.id,
                document.collection_name(),
                C::NAME
            ))
            .into());
        }

        let key = Key::from(document.id.as_str());
        let shadowed = handle
            .race(handle.local_cache().get(key))
            .await
            .into_result()
            .map_err(|source| Error::ReadFailed {
                id: document.id.clone(),
                source,
            })?;
        if shadowed.is_some() {
            continue;
        }

        let value = document.to_value()?;
        handle
            .race(handle.remote_cache().put(value))
            .await
            .into_result()
            .map_err(|source| Error::WriteFailed {
                id: document.id.clone(),
                source,
            })?;
        cached += 1;
    }

    Ok(cached)
}

async fn finish<T: crate::backend::BackendTransaction>(
    handle: TransactionHandle<T>,
    target: &str,
) -> Result<()> {
    match handle.complete().await {
        TxOutcome::Committed => Ok(()),
        TxOutcome::Aborted(source) => Err(Error::WriteFailed {
            id: target.to_string(),
            source,
        }),
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| EngineError::InvalidPayload(e.to_string()).into())
}
