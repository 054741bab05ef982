//! Integration tests for batched mutations against the in-memory engine.
//!
//! The engine journal records every dispatch and settlement, which is how
//! ordering and atomicity are checked here.

#![cfg(not(target_arch = "wasm32"))]

use docstash_engine::{store_schema, Collection, CollectionSchema, Document, FieldDef, FieldType, Key};
use docstash_store::backend::memory::{JournalEntry, MemoryBackend, RequestKind};
use docstash_store::backend::{BackendError, ErrorKind, TransactionMode};
use docstash_store::{BatchState, Config, DocStore, Error};
use futures::FutureExt;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    title: String,
}

struct Notes;

impl Collection for Notes {
    const NAME: &'static str = "notes";
    type Doc = Note;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(Self::NAME, vec![FieldDef::required("title", FieldType::String)])
    }
}

store_schema! {
    struct TestSchema {
        version: 1,
        collections: [Notes],
    }
}

type Store = DocStore<TestSchema, MemoryBackend>;

fn setup() -> (MemoryBackend, Store) {
    let backend = MemoryBackend::new();
    let store = DocStore::new(backend.clone(), Config::default());
    (backend, store)
}

fn note(title: &str) -> Note {
    Note {
        title: title.into(),
    }
}

/// Ids stored in `store` of the default database.
fn stored_ids(backend: &MemoryBackend, store: &str) -> Vec<String> {
    let db = backend.database("LikelyMindsLM").unwrap();
    let ids = db
        .store(store)
        .unwrap()
        .values()
        .filter_map(|v| v["_id"].as_str().map(String::from))
        .collect();
    ids
}

/// Id of the most recent read-write transaction.
fn last_write_tx(journal: &[JournalEntry]) -> u64 {
    journal
        .iter()
        .rev()
        .find_map(|entry| match entry {
            JournalEntry::TransactionStarted {
                tx,
                mode: TransactionMode::ReadWrite,
            } => Some(*tx),
            _ => None,
        })
        .unwrap()
}

fn dispatches(journal: &[JournalEntry], tx: u64) -> Vec<(String, RequestKind, Option<Key>)> {
    journal
        .iter()
        .filter_map(|entry| match entry {
            JournalEntry::Dispatched {
                tx: t,
                store,
                request,
                key,
            } if *t == tx => Some((store.clone(), *request, key.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn add_add_remove_commits_in_order() {
    let (backend, store) = setup();

    let mut batch = store.batched_mutations().await.unwrap();
    assert_eq!(batch.add::<Notes>("a", note("first")).unwrap(), 1);
    assert_eq!(batch.add::<Notes>("b", note("second")).unwrap(), 2);
    assert_eq!(batch.remove::<Notes>("a").unwrap(), 3);

    let report = batch.execute_batch().await.unwrap();
    assert_eq!(report.state, BatchState::Committed);
    assert_eq!(report.mutations, 3);
    assert_eq!(report.last_op_id, 3);

    assert_eq!(stored_ids(&backend, "local"), vec!["b"]);

    let journal = backend.journal();
    let tx = last_write_tx(&journal);
    let order: Vec<_> = dispatches(&journal, tx)
        .into_iter()
        .map(|(store, request, key)| (store, request, key.and_then(|k| k.as_str().map(String::from))))
        .collect();

    assert_eq!(
        order,
        vec![
            ("local".into(), RequestKind::Add, Some("a".into())),
            ("local".into(), RequestKind::Add, Some("b".into())),
            ("local".into(), RequestKind::Delete, Some("a".into())),
            ("remote".into(), RequestKind::Delete, Some("a".into())),
            ("intercom".into(), RequestKind::Add, None),
        ]
    );
    assert!(journal.contains(&JournalEntry::Committed { tx }));
}

#[tokio::test]
async fn each_request_settles_before_the_next_dispatch() {
    let (backend, store) = setup();

    let mut batch = store.batched_mutations().await.unwrap();
    for i in 0..5 {
        batch.add::<Notes>(format!("n{i}"), note("x")).unwrap();
    }
    batch.remove::<Notes>("n0").unwrap();
    batch.execute_batch().await.unwrap();

    let journal = backend.journal();
    let tx = last_write_tx(&journal);

    let mut in_flight = false;
    for entry in &journal {
        match entry {
            JournalEntry::Dispatched { tx: t, .. } if *t == tx => {
                assert!(!in_flight, "dispatched while a request was in flight");
                in_flight = true;
            }
            JournalEntry::Settled { tx: t, .. } if *t == tx => {
                assert!(in_flight);
                in_flight = false;
            }
            _ => {}
        }
    }
    assert!(!in_flight);
}

#[tokio::test]
async fn duplicate_add_rolls_back_the_whole_batch() {
    let (backend, store) = setup();

    let mut seed = store.batched_mutations().await.unwrap();
    seed.add::<Notes>("x", note("existing")).unwrap();
    seed.execute_batch().await.unwrap();

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("y", note("new")).unwrap();
    batch.add::<Notes>("x", note("duplicate")).unwrap();
    batch.add::<Notes>("z", note("never dispatched")).unwrap();

    let err = batch.execute_batch().await.unwrap_err();
    match err {
        Error::OperationFailed {
            op_id,
            position,
            document_id,
            source,
        } => {
            assert_eq!(op_id, 2);
            assert_eq!(position, 1);
            assert_eq!(document_id, "x");
            assert_eq!(source.kind, ErrorKind::Constraint);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Only the seeded document survives, unchanged
    assert_eq!(stored_ids(&backend, "local"), vec!["x"]);
    let existing = store.get::<Notes>("x").await.unwrap().unwrap();
    assert_eq!(existing.body.title, "existing");

    let journal = backend.journal();
    let tx = last_write_tx(&journal);
    assert_eq!(dispatches(&journal, tx).len(), 2);
    assert!(journal
        .iter()
        .any(|e| matches!(e, JournalEntry::Aborted { tx: t, .. } if *t == tx)));
}

#[tokio::test]
async fn engine_abort_mid_batch_is_reported() {
    let (backend, store) = setup();
    store.manager().connection().await.unwrap();

    // Applies to the next read-write transaction
    backend.abort_transaction_at(2, BackendError::quota_exceeded("disk full"));

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("a")).unwrap();
    batch.add::<Notes>("b", note("b")).unwrap();
    batch.add::<Notes>("c", note("c")).unwrap();

    match batch.execute_batch().await {
        Err(Error::TransactionAborted { op_id, source }) => {
            assert_eq!(op_id, 2);
            assert_eq!(source.kind, ErrorKind::QuotaExceeded);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(stored_ids(&backend, "local").is_empty());

    let journal = backend.journal();
    let tx = last_write_tx(&journal);
    assert_eq!(dispatches(&journal, tx).len(), 2);
}

#[tokio::test]
async fn empty_batch_has_no_side_effects() {
    let (backend, store) = setup();
    // Open the connection first so only the batch shows up afterwards
    store.manager().connection().await.unwrap();
    backend.clear_journal();

    let batch = store.batched_mutations().await.unwrap();
    assert_eq!(batch.state(), BatchState::Empty);
    let report = batch.execute_batch().await.unwrap();
    assert_eq!(report.state, BatchState::Empty);

    let journal = backend.journal();
    assert!(!journal
        .iter()
        .any(|e| matches!(e, JournalEntry::Dispatched { .. })));
    assert!(store.batches_touching("notes").await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_execution_rolls_back() {
    let (backend, store) = setup();
    store.manager().connection().await.unwrap();

    let mut batch = store.batched_mutations().await.unwrap();
    for id in ["a", "b", "c"] {
        batch.add::<Notes>(id, note(id)).unwrap();
    }

    // One poll dispatches the first add, then the future is dropped
    assert!(batch.execute_batch().now_or_never().is_none());
    tokio::task::yield_now().await;

    let journal = backend.journal();
    let tx = last_write_tx(&journal);
    assert_eq!(dispatches(&journal, tx).len(), 1);
    assert!(!journal.contains(&JournalEntry::Committed { tx }));
    assert!(journal
        .iter()
        .any(|e| matches!(e, JournalEntry::Aborted { tx: aborted, .. } if *aborted == tx)));
    assert!(stored_ids(&backend, "local").is_empty());

    // The connection stays usable
    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("again")).unwrap();
    batch.execute_batch().await.unwrap();
    assert_eq!(stored_ids(&backend, "local"), vec!["a".to_string()]);
}

#[tokio::test]
async fn unexecuted_batch_is_rolled_back() {
    let (backend, store) = setup();

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("queued")).unwrap();
    assert!(batch.read("a").await.unwrap().is_none());
    drop(batch);

    let journal = backend.journal();
    let tx = last_write_tx(&journal);
    assert!(!journal.contains(&JournalEntry::Committed { tx }));
    assert!(stored_ids(&backend, "local").is_empty());
    assert!(store.batches_touching("notes").await.unwrap().is_empty());
}

#[tokio::test]
async fn last_write_wins() {
    let (_backend, store) = setup();

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("v1")).unwrap();
    batch.execute_batch().await.unwrap();

    for title in ["v2", "v3"] {
        let mut batch = store.batched_mutations().await.unwrap();
        let mut current = batch.read_as::<Notes>("a").await.unwrap().unwrap();
        current.body.title = title.into();
        batch.replace::<Notes>(current).unwrap();
        batch.execute_batch().await.unwrap();
    }

    let stored = store.get::<Notes>("a").await.unwrap().unwrap();
    assert_eq!(stored.body.title, "v3");
    assert!(stored.meta.last_updated_at >= stored.meta.created_at);
}

#[tokio::test]
async fn read_then_write_in_one_transaction() {
    let (backend, store) = setup();

    store
        .cache_remote::<Notes>(vec![Document::new("r1", "notes", note("server"), 1)])
        .await
        .unwrap();

    let report = store
        .execute(["r1", "missing"], |batch, found| {
            assert_eq!(found.len(), 2);
            assert!(found[1].is_none());

            let mut doc = found[0].clone().unwrap().into_typed::<Note>()?;
            doc.body.title = "edited locally".into();
            batch.replace::<Notes>(doc)?;
            batch.add::<Notes>("missing", note("created"))?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(report.mutations, 2);
    assert!(stored_ids(&backend, "remote").is_empty());

    let local: BTreeSet<_> = stored_ids(&backend, "local").into_iter().collect();
    assert_eq!(local, BTreeSet::from(["missing".to_string(), "r1".to_string()]));
}

#[tokio::test]
async fn failing_callback_aborts_without_writes() {
    let (backend, store) = setup();

    let err = store
        .execute(["a"], |batch, _found| {
            batch.add::<Notes>("a", note("a"))?;
            batch.add_value("ghosts", "g", serde_json::json!({}))?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Engine(_)));
    assert!(stored_ids(&backend, "local").is_empty());
}

#[tokio::test]
async fn failures_do_not_poison_the_connection() {
    let (_backend, store) = setup();

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("a")).unwrap();
    batch.add::<Notes>("a", note("again")).unwrap();
    assert!(batch.execute_batch().await.is_err());

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("a")).unwrap();
    assert!(batch.execute_batch().await.is_ok());
}

#[tokio::test]
async fn intercom_can_be_disabled() {
    let backend = MemoryBackend::new();
    let store: Store = DocStore::new(backend.clone(), Config::default().with_record_intercom(false));

    let mut batch = store.batched_mutations().await.unwrap();
    batch.add::<Notes>("a", note("a")).unwrap();
    let report = batch.execute_batch().await.unwrap();

    assert_eq!(report.batch_id, None);
    assert!(store.batches_touching("notes").await.unwrap().is_empty());
}

#[derive(Debug, Clone)]
enum Step {
    Add(u8),
    Remove(u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![(0u8..6).prop_map(Step::Add), (0u8..6).prop_map(Step::Remove)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A batch either lands completely or not at all, and op IDs count up
    /// from 1 in queue order.
    #[test]
    fn batches_are_all_or_nothing(steps in prop::collection::vec(step(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (backend, store) = setup();
            let mut batch = store.batched_mutations().await.unwrap();

            let mut expected = BTreeSet::new();
            let mut conflict = false;
            for (i, step) in steps.iter().enumerate() {
                let op_id = match step {
                    Step::Add(n) => {
                        let id = format!("n{n}");
                        if !expected.insert(id.clone()) {
                            conflict = true;
                        }
                        batch.add::<Notes>(id, note("p")).unwrap()
                    }
                    Step::Remove(n) => {
                        expected.remove(&format!("n{n}"));
                        batch.remove::<Notes>(format!("n{n}")).unwrap()
                    }
                };
                prop_assert_eq!(op_id, i as u64 + 1);
            }

            let result = batch.execute_batch().await;
            let stored: BTreeSet<String> = stored_ids(&backend, "local").into_iter().collect();

            if conflict {
                prop_assert!(result.is_err());
                prop_assert!(stored.is_empty());
            } else {
                prop_assert!(result.is_ok());
                prop_assert_eq!(stored, expected);
            }
            Ok(())
        })?;
    }
}
