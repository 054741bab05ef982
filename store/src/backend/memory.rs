//! In-memory engine with IndexedDB semantics.
//!
//! Databases live in a shared registry, so several [`MemoryBackend`] clones
//! (and several connection managers) see the same data, the way several
//! page loads see the same browser storage. Behaviour mirrors IndexedDB:
//!
//! - opening at a higher version runs the upgrade handler exclusively
//! - read-only transactions run concurrently, read-write ones one at a time
//! - requests apply in dispatch order; their events are delivered later
//! - a failed request aborts its transaction and discards its writes
//! - a transaction dropped while active commits
//!
//! Events are delivered on spawned tokio tasks, so the backend must be used
//! from within a tokio runtime.
//!
//! Every open, dispatch, settlement and transaction outcome is appended to a
//! [`JournalEntry`] log, and faults can be injected to exercise failure
//! paths.

use super::{
    BackendDatabase, BackendError, BackendObjectStore, BackendTransaction, ErrorKind,
    StorageBackend, TransactionMode, UpgradeContext, UpgradeHandler,
};
use crate::race::{self, OutcomeNotifier, OutcomeSignal, Request};
use dashmap::DashMap;
use docstash_engine::{Database, IndexDef, Key, KeyPath, ObjectStore, Snapshot};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Kind of a per-store request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Add,
    Put,
    Delete,
    Get,
    GetAll,
    GetAllByIndex,
}

impl RequestKind {
    fn is_write(self) -> bool {
        matches!(self, RequestKind::Add | RequestKind::Put | RequestKind::Delete)
    }
}

/// One observable engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    OpenRequested {
        name: String,
        version: u32,
    },
    Upgraded {
        name: String,
        old_version: u32,
        new_version: u32,
    },
    TransactionStarted {
        tx: u64,
        mode: TransactionMode,
    },
    Dispatched {
        tx: u64,
        store: String,
        request: RequestKind,
        key: Option<Key>,
    },
    Settled {
        tx: u64,
        store: String,
        request: RequestKind,
        ok: bool,
    },
    Committed {
        tx: u64,
    },
    Aborted {
        tx: u64,
        reason: String,
    },
}

#[derive(Debug, Default)]
struct Faults {
    /// Every open throws synchronously
    open_throws: Option<BackendError>,
    /// Every open request fails
    open_fails: Option<BackendError>,
    /// The next read-write transaction aborts when its n-th request is dispatched
    abort_at: Option<(usize, BackendError)>,
}

#[derive(Debug, Default)]
struct Shared {
    databases: DashMap<String, Arc<DatabaseCell>>,
    journal: Mutex<Vec<JournalEntry>>,
    faults: Mutex<Faults>,
    next_tx: AtomicU64,
}

impl Shared {
    fn record(&self, entry: JournalEntry) {
        lock(&self.journal).push(entry);
    }
}

#[derive(Debug)]
struct DatabaseCell {
    state: Mutex<Database>,
    /// Read guards for read-only transactions, write guards for read-write
    /// transactions and upgrades
    schedule: Arc<RwLock<()>>,
}

impl DatabaseCell {
    fn new(database: Database) -> Self {
        Self {
            state: Mutex::new(database),
            schedule: Arc::new(RwLock::new(())),
        }
    }

    fn upgrade(
        &self,
        shared: &Shared,
        version: u32,
        on_upgrade: UpgradeHandler,
    ) -> Result<(), BackendError> {
        let mut db = lock(&self.state);
        let old_version = db.version();

        if version < old_version {
            return Err(BackendError::new(
                ErrorKind::Version,
                format!(
                    "requested version {version} is lower than stored version {old_version}"
                ),
            ));
        }
        if version == old_version {
            return Ok(());
        }

        // Upgrades are all-or-nothing too
        let mut working = db.clone();
        on_upgrade(&mut MemoryUpgrade {
            db: &mut working,
            old_version,
            new_version: version,
        })?;
        working.set_version(version);

        shared.record(JournalEntry::Upgraded {
            name: working.name().to_string(),
            old_version,
            new_version: version,
        });
        *db = working;

        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared-registry in-memory engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the databases held by a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> docstash_engine::error::Result<Self> {
        let backend = Self::new();
        for database in snapshot.restore()? {
            backend.shared.databases.insert(
                database.name().to_string(),
                Arc::new(DatabaseCell::new(database)),
            );
        }
        Ok(backend)
    }

    /// Capture the committed state of every database.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for entry in self.shared.databases.iter() {
            snapshot.add_database(&lock(&entry.value().state));
        }
        snapshot
    }

    /// Copy of the committed state of a database.
    pub fn database(&self, name: &str) -> Option<Database> {
        self.shared
            .databases
            .get(name)
            .map(|cell| lock(&cell.state).clone())
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.shared.journal).clone()
    }

    pub fn clear_journal(&self) {
        lock(&self.shared.journal).clear();
    }

    /// Make every subsequent open throw before a request exists.
    pub fn fail_open_synchronously(&self, error: BackendError) {
        lock(&self.shared.faults).open_throws = Some(error);
    }

    /// Make every subsequent open request fire its error event.
    pub fn fail_open(&self, error: BackendError) {
        lock(&self.shared.faults).open_fails = Some(error);
    }

    /// Abort the next read-write transaction when its `request`-th request
    /// (counting from 1) is dispatched. That request never settles.
    pub fn abort_transaction_at(&self, request: usize, error: BackendError) {
        lock(&self.shared.faults).abort_at = Some((request, error));
    }

    pub fn clear_faults(&self) {
        *lock(&self.shared.faults) = Faults::default();
    }
}

impl StorageBackend for MemoryBackend {
    type Database = MemoryDatabase;

    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler,
    ) -> Result<Request<MemoryDatabase>, BackendError> {
        let open_fails = {
            let faults = lock(&self.shared.faults);
            if let Some(error) = &faults.open_throws {
                return Err(error.clone());
            }
            faults.open_fails.clone()
        };

        if version == 0 {
            return Err(BackendError::new(
                ErrorKind::Type,
                "database version must be at least 1",
            ));
        }

        self.shared.record(JournalEntry::OpenRequested {
            name: name.to_string(),
            version,
        });

        let (responder, request) = race::request();
        let shared = self.shared.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            if let Some(error) = open_fails {
                responder.fail(error);
                return;
            }

            let cell = shared
                .databases
                .entry(name.clone())
                .or_insert_with(|| Arc::new(DatabaseCell::new(Database::new(&name))))
                .value()
                .clone();

            // Upgrades wait for every running transaction
            let _exclusive = cell.schedule.clone().write_owned().await;

            let result = cell
                .upgrade(&shared, version, on_upgrade)
                .map(|()| MemoryDatabase {
                    name,
                    version,
                    cell: cell.clone(),
                    shared: shared.clone(),
                });
            responder.settle(result);
        });

        Ok(request)
    }
}

/// Schema access during an upgrade.
pub(crate) struct MemoryUpgrade<'a> {
    pub(crate) db: &'a mut Database,
    pub(crate) old_version: u32,
    pub(crate) new_version: u32,
}

impl UpgradeContext for MemoryUpgrade<'_> {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.db.object_store_names()
    }

    fn create_object_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), BackendError> {
        self.db
            .create_object_store(name, key_path.cloned(), auto_increment)?;
        Ok(())
    }

    fn index_names(&self, store: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.db.store(store)?.index_names())
    }

    fn create_index(&mut self, store: &str, index: &IndexDef) -> Result<(), BackendError> {
        self.db.store_mut(store)?.create_index(index.clone())?;
        Ok(())
    }
}

/// An open connection to an in-memory database.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    version: u32,
    cell: Arc<DatabaseCell>,
    shared: Arc<Shared>,
}

impl BackendDatabase for MemoryDatabase {
    type Transaction = MemoryTransaction;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        lock(&self.cell.state).object_store_names()
    }

    fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<Request<MemoryTransaction>, BackendError> {
        if scope.is_empty() {
            return Err(BackendError::new(
                ErrorKind::InvalidAccess,
                "transaction scope is empty",
            ));
        }

        let mut stores: Vec<String> = scope.iter().map(|s| s.to_string()).collect();
        stores.sort();
        stores.dedup();

        {
            let db = lock(&self.cell.state);
            if let Some(missing) = stores.iter().find(|name| !db.contains_store(name)) {
                return Err(BackendError::not_found(format!(
                    "object store '{missing}' does not exist"
                )));
            }
        }

        let id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        let abort_at = match mode {
            TransactionMode::ReadWrite => lock(&self.shared.faults).abort_at.take(),
            TransactionMode::ReadOnly => None,
        };

        let (responder, request) = race::request();
        let cell = self.cell.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let schedule = match mode {
                TransactionMode::ReadOnly => {
                    ScheduleGuard::Read(cell.schedule.clone().read_owned().await)
                }
                TransactionMode::ReadWrite => {
                    ScheduleGuard::Write(cell.schedule.clone().write_owned().await)
                }
            };

            let working: BTreeMap<String, ObjectStore> = {
                let db = lock(&cell.state);
                stores
                    .iter()
                    .filter_map(|name| db.store(name).ok().map(|s| (name.clone(), s.clone())))
                    .collect()
            };

            shared.record(JournalEntry::TransactionStarted { tx: id, mode });

            let (notifier, outcome) = race::outcome();
            responder.succeed(MemoryTransaction {
                inner: Arc::new(TxInner {
                    id,
                    mode,
                    cell,
                    shared: shared.clone(),
                    state: Mutex::new(TxState {
                        phase: Phase::Active,
                        working,
                        dispatched: 0,
                        abort_at,
                        schedule: Some(schedule),
                        orphans: Vec::new(),
                    }),
                    notifier,
                    outcome,
                }),
            });
        });

        Ok(request)
    }
}

#[allow(dead_code)]
enum ScheduleGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Committed,
    Aborted,
}

struct TxState {
    phase: Phase,
    /// Copies of the scoped stores; written back on commit
    working: BTreeMap<String, ObjectStore>,
    dispatched: usize,
    abort_at: Option<(usize, BackendError)>,
    schedule: Option<ScheduleGuard>,
    /// Responders of requests cut off by an injected abort
    orphans: Vec<Box<dyn Any + Send>>,
}

struct TxInner {
    id: u64,
    mode: TransactionMode,
    cell: Arc<DatabaseCell>,
    shared: Arc<Shared>,
    state: Mutex<TxState>,
    notifier: OutcomeNotifier,
    outcome: OutcomeSignal,
}

impl TxInner {
    fn dispatch<T, F>(&self, store: &str, kind: RequestKind, key: Option<Key>, op: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ObjectStore) -> docstash_engine::error::Result<T>,
    {
        let mut state = lock(&self.state);

        if state.phase != Phase::Active {
            return Request::ready(Err(BackendError::new(
                ErrorKind::TransactionInactive,
                format!("transaction {} has finished", self.id),
            )));
        }
        if kind.is_write() && self.mode == TransactionMode::ReadOnly {
            return Request::ready(Err(BackendError::new(
                ErrorKind::ReadOnly,
                format!("cannot write to '{store}' in a read-only transaction"),
            )));
        }

        state.dispatched += 1;
        self.shared.record(JournalEntry::Dispatched {
            tx: self.id,
            store: store.to_string(),
            request: kind,
            key,
        });

        let (responder, request) = race::request();

        let cut_off = matches!(&state.abort_at, Some((at, _)) if *at == state.dispatched);
        if cut_off {
            if let Some((_, reason)) = state.abort_at.take() {
                state.orphans.push(Box::new(responder));
                self.finish(&mut state, Phase::Aborted);
                drop(state);
                self.shared.record(JournalEntry::Aborted {
                    tx: self.id,
                    reason: reason.to_string(),
                });
                self.notifier.abort(reason);
            }
            return request;
        }

        let result = match state.working.get_mut(store) {
            Some(target) => op(target).map_err(BackendError::from),
            None => Err(BackendError::not_found(format!(
                "object store '{store}' is not in the transaction scope"
            ))),
        };

        // A failed request takes its transaction down with it
        let failure = result.as_ref().err().cloned();
        if failure.is_some() {
            self.finish(&mut state, Phase::Aborted);
        }
        drop(state);

        let shared = self.shared.clone();
        let notifier = self.notifier.clone();
        let tx = self.id;
        let store = store.to_string();

        tokio::spawn(async move {
            shared.record(JournalEntry::Settled {
                tx,
                store,
                request: kind,
                ok: result.is_ok(),
            });
            responder.settle(result);

            if let Some(error) = failure {
                shared.record(JournalEntry::Aborted {
                    tx,
                    reason: error.to_string(),
                });
                notifier.abort(error);
            }
        });

        request
    }

    /// Move to a terminal phase, writing back or discarding the working copy
    /// and releasing the schedule slot.
    fn finish(&self, state: &mut TxState, phase: Phase) {
        let working = std::mem::take(&mut state.working);

        if phase == Phase::Committed && self.mode == TransactionMode::ReadWrite {
            let mut db = lock(&self.cell.state);
            for store in working.into_values() {
                db.replace_store(store);
            }
        }

        state.phase = phase;
        state.schedule = None;
    }

    fn commit(&self) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.phase != Phase::Active {
            return Err(BackendError::invalid_state(format!(
                "transaction {} has already finished",
                self.id
            )));
        }

        self.finish(&mut state, Phase::Committed);
        drop(state);

        self.shared.record(JournalEntry::Committed { tx: self.id });
        self.notifier.complete();
        Ok(())
    }

    fn abort(&self) {
        let mut state = lock(&self.state);
        if state.phase != Phase::Active {
            return;
        }

        self.finish(&mut state, Phase::Aborted);
        drop(state);

        let reason = BackendError::abort("transaction was aborted");
        self.shared.record(JournalEntry::Aborted {
            tx: self.id,
            reason: reason.to_string(),
        });
        self.notifier.abort(reason);
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        let active = lock(&self.state).phase == Phase::Active;
        if active {
            // Same as the engine running out of requests
            let _ = self.commit();
        }
    }
}

/// A transaction on an in-memory database.
#[derive(Clone)]
pub struct MemoryTransaction {
    inner: Arc<TxInner>,
}

impl MemoryTransaction {
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl BackendTransaction for MemoryTransaction {
    type ObjectStore = MemoryObjectStore;

    fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    fn object_store(&self, name: &str) -> Result<MemoryObjectStore, BackendError> {
        let state = lock(&self.inner.state);
        if state.phase != Phase::Active {
            return Err(BackendError::invalid_state(format!(
                "transaction {} has finished",
                self.inner.id
            )));
        }

        let store = state.working.get(name).ok_or_else(|| {
            BackendError::not_found(format!(
                "object store '{name}' is not in the transaction scope"
            ))
        })?;

        Ok(MemoryObjectStore {
            tx: self.inner.clone(),
            name: name.to_string(),
            key_path: store.key_path().cloned(),
        })
    }

    fn outcome(&self) -> OutcomeSignal {
        self.inner.outcome.clone()
    }

    fn commit(&self) -> Result<(), BackendError> {
        self.inner.commit()
    }

    fn abort(&self) {
        self.inner.abort();
    }
}

/// An object store inside a [`MemoryTransaction`].
pub struct MemoryObjectStore {
    tx: Arc<TxInner>,
    name: String,
    key_path: Option<KeyPath>,
}

impl MemoryObjectStore {
    fn inline_key(&self, value: &Value) -> Option<Key> {
        self.key_path
            .as_ref()
            .and_then(|path| path.resolve(value))
            .and_then(|v| Key::from_value(v).ok())
    }
}

impl BackendObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, value: Value) -> Request<Key> {
        let key = self.inline_key(&value);
        self.tx
            .dispatch(&self.name, RequestKind::Add, key, move |store| {
                store.add(value, None)
            })
    }

    fn put(&self, value: Value) -> Request<Key> {
        let key = self.inline_key(&value);
        self.tx
            .dispatch(&self.name, RequestKind::Put, key, move |store| {
                store.put(value, None)
            })
    }

    fn delete(&self, key: Key) -> Request<()> {
        self.tx.dispatch(
            &self.name,
            RequestKind::Delete,
            Some(key.clone()),
            move |store| {
                store.delete(&key);
                Ok(())
            },
        )
    }

    fn get(&self, key: Key) -> Request<Option<Value>> {
        self.tx.dispatch(
            &self.name,
            RequestKind::Get,
            Some(key.clone()),
            move |store| Ok(store.get(&key).cloned()),
        )
    }

    fn get_all(&self) -> Request<Vec<Value>> {
        self.tx
            .dispatch(&self.name, RequestKind::GetAll, None, |store| {
                Ok(store.values().cloned().collect())
            })
    }

    fn get_all_by_index(&self, index: &str, key: Key) -> Request<Vec<Value>> {
        let index = index.to_string();
        self.tx.dispatch(
            &self.name,
            RequestKind::GetAllByIndex,
            Some(key.clone()),
            move |store| {
                Ok(store
                    .get_all_by_index(&index, &key)?
                    .into_iter()
                    .cloned()
                    .collect())
            },
        )
    }
}
