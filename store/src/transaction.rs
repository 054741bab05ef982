//! Transaction handles.
//!
//! A [`TransactionHandle`] wraps one engine transaction scoped to the four
//! docstash stores. Every request made through it can be raced against the
//! transaction's own outcome, so a caller waiting on a request also learns
//! when the transaction went down underneath it.

use crate::backend::{BackendError, BackendObjectStore, BackendTransaction, ErrorKind};
use crate::race::{OutcomeSignal, Request, TxOutcome};
use crate::{Error, Result};
use docstash_engine::{layout, Key, Placement, RawDocument};

/// How a raced request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<V> {
    /// The request's success event fired first
    Succeeded(V),
    /// The request's error event fired first
    Failed(BackendError),
    /// The transaction aborted before the request settled
    Aborted(BackendError),
    /// The transaction committed before the request settled
    Finished,
}

impl<V> Settled<V> {
    /// Collapse into a result, treating every non-success as an error.
    pub fn into_result(self) -> std::result::Result<V, BackendError> {
        match self {
            Settled::Succeeded(value) => Ok(value),
            Settled::Failed(error) | Settled::Aborted(error) => Err(error),
            Settled::Finished => Err(finished_early()),
        }
    }
}

/// Error for a request overtaken by its transaction's commit.
pub(crate) fn finished_early() -> BackendError {
    BackendError::new(
        ErrorKind::TransactionInactive,
        "transaction finished before the request settled",
    )
}

/// The four stores of a transaction.
pub struct ObjectStores<S> {
    pub client_info: S,
    pub remote: S,
    pub local: S,
    pub intercom: S,
}

/// A live transaction over every docstash store.
pub struct TransactionHandle<T: BackendTransaction> {
    tx: T,
    stores: ObjectStores<T::ObjectStore>,
    outcome: OutcomeSignal,
}

impl<T: BackendTransaction> std::fmt::Debug for TransactionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle").finish_non_exhaustive()
    }
}

impl<T: BackendTransaction> TransactionHandle<T> {
    /// Wrap a transaction whose scope covers [`layout::ALL_STORES`].
    pub fn new(tx: T) -> std::result::Result<Self, BackendError> {
        let stores = ObjectStores {
            client_info: tx.object_store(layout::CLIENT_INFO)?,
            remote: tx.object_store(layout::REMOTE)?,
            local: tx.object_store(layout::LOCAL)?,
            intercom: tx.object_store(layout::INTERCOM)?,
        };
        let outcome = tx.outcome();

        Ok(Self {
            tx,
            stores,
            outcome,
        })
    }

    pub fn transaction(&self) -> &T {
        &self.tx
    }

    pub fn client_info(&self) -> &T::ObjectStore {
        &self.stores.client_info
    }

    pub fn remote_cache(&self) -> &T::ObjectStore {
        &self.stores.remote
    }

    pub fn local_cache(&self) -> &T::ObjectStore {
        &self.stores.local
    }

    pub fn intercom(&self) -> &T::ObjectStore {
        &self.stores.intercom
    }

    /// The document store for a placement.
    pub fn store(&self, placement: Placement) -> &T::ObjectStore {
        match placement {
            Placement::Local => &self.stores.local,
            Placement::Remote => &self.stores.remote,
        }
    }

    /// Resolves once the transaction has committed or aborted.
    pub fn outcome(&self) -> OutcomeSignal {
        self.outcome.clone()
    }

    /// Wait for `request`, or for the transaction to end first.
    ///
    /// If both are ready, the request's own result wins.
    pub async fn race<V>(&self, request: Request<V>) -> Settled<V> {
        let outcome = self.outcome.clone();

        tokio::select! {
            biased;

            result = request => match result {
                Ok(value) => Settled::Succeeded(value),
                Err(error) => Settled::Failed(error),
            },
            outcome = outcome => match outcome {
                TxOutcome::Aborted(error) => Settled::Aborted(error),
                TxOutcome::Committed => Settled::Finished,
            },
        }
    }

    /// Look a document up by id, local placement first.
    pub async fn find(&self, id: &str) -> Result<Option<(Placement, RawDocument)>> {
        for placement in [Placement::Local, Placement::Remote] {
            let request = self.store(placement).get(Key::from(id));
            let found = self
                .race(request)
                .await
                .into_result()
                .map_err(|source| Error::ReadFailed {
                    id: id.to_string(),
                    source,
                })?;

            if let Some(value) = found {
                return Ok(Some((placement, RawDocument::from_value(value)?)));
            }
        }

        Ok(None)
    }

    pub fn commit(&self) -> std::result::Result<(), BackendError> {
        self.tx.commit()
    }

    pub fn abort(&self) {
        self.tx.abort();
    }

    /// Commit and wait for the outcome.
    pub async fn complete(self) -> TxOutcome {
        if let Err(error) = self.tx.commit() {
            // Already finished: report how
            if let Some(outcome) = self.outcome.peek() {
                return outcome;
            }
            return TxOutcome::Aborted(error);
        }
        self.outcome.clone().await
    }
}
