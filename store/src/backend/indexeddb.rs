//! IndexedDB engine for the browser.
//!
//! Every IndexedDB request gets its event listeners wired to a
//! [`Responder`](crate::race::Responder). The listeners live as long as the
//! returned [`Request`] and are detached when it is dropped. Transaction
//! outcome listeners live as long as the transaction handle.
//!
//! JavaScript objects are not `Send`. wasm32 is single threaded, so they are
//! wrapped in [`SendWrapper`] to satisfy the backend traits.

use super::{
    BackendDatabase, BackendError, BackendObjectStore, BackendTransaction, ErrorKind,
    StorageBackend, TransactionMode, UpgradeContext, UpgradeHandler,
};
use crate::race::{self, OutcomeSignal, Request};
use docstash_engine::{IndexDef, Key, KeyPath};
use send_wrapper::SendWrapper;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    DomException, DomStringList, Event, IdbDatabase, IdbFactory, IdbIndexParameters,
    IdbObjectStore, IdbObjectStoreParameters, IdbOpenDbRequest, IdbRequest, IdbTransaction,
    IdbTransactionMode, IdbVersionChangeEvent,
};

type Listener = Closure<dyn FnMut(Event)>;

/// Converts a thrown JavaScript value.
fn js_error(err: JsValue) -> BackendError {
    if let Some(exception) = err.dyn_ref::<DomException>() {
        return BackendError::new(ErrorKind::from_dom_name(&exception.name()), exception.message());
    }
    if let Some(error) = err.dyn_ref::<js_sys::Error>() {
        return BackendError::new(
            ErrorKind::from_dom_name(&String::from(error.name())),
            String::from(error.message()),
        );
    }
    BackendError::unknown(err.as_string().unwrap_or_else(|| format!("{err:?}")))
}

fn request_error(request: &IdbRequest) -> BackendError {
    match request.error() {
        Ok(Some(exception)) => {
            BackendError::new(ErrorKind::from_dom_name(&exception.name()), exception.message())
        }
        Ok(None) => BackendError::unknown("request failed without an error"),
        Err(err) => js_error(err),
    }
}

fn to_js(value: &Value) -> Result<JsValue, BackendError> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| BackendError::data(e.to_string()))
}

fn from_js(value: JsValue) -> Result<Value, BackendError> {
    serde_wasm_bindgen::from_value(value).map_err(|e| BackendError::data(e.to_string()))
}

fn key_to_js(key: &Key) -> JsValue {
    match key {
        Key::Number(n) => JsValue::from_f64(*n as f64),
        Key::String(s) => JsValue::from_str(s),
        Key::Array(parts) => parts.iter().map(key_to_js).collect::<js_sys::Array>().into(),
    }
}

fn key_from_js(value: &JsValue) -> Result<Key, BackendError> {
    if let Some(s) = value.as_string() {
        return Ok(Key::String(s));
    }
    if let Some(n) = value.as_f64() {
        return Ok(Key::Number(n as i64));
    }
    if js_sys::Array::is_array(value) {
        let parts = js_sys::Array::from(value);
        return parts.iter().map(|part| key_from_js(&part)).collect::<Result<_, _>>().map(Key::Array);
    }
    Err(BackendError::data(format!("unsupported key {value:?}")))
}

fn names(list: DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.item(i)).collect()
}

/// Listeners attached to one request, detached on drop.
struct RequestListeners {
    request: IdbRequest,
    _on_success: Listener,
    _on_error: Listener,
}

impl Drop for RequestListeners {
    fn drop(&mut self) {
        self.request.set_onsuccess(None);
        self.request.set_onerror(None);
    }
}

/// Wire `request` to a [`Request`], mapping its result with `map`.
fn track<T, F>(request: IdbRequest, map: F) -> Request<T>
where
    T: Send + 'static,
    F: Fn(JsValue) -> Result<T, BackendError> + 'static,
{
    let (responder, pending) = race::request();

    let on_success: Listener = Closure::wrap(Box::new({
        let responder = responder.clone();
        let request = request.clone();
        move |_event: Event| {
            let result = request.result().map_err(js_error).and_then(&map);
            responder.settle(result);
        }
    }) as Box<dyn FnMut(_)>);

    let on_error: Listener = Closure::wrap(Box::new({
        let request = request.clone();
        // Left to bubble, so the engine aborts the transaction
        move |_event: Event| {
            responder.fail(request_error(&request));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
    request.set_onerror(Some(on_error.as_ref().unchecked_ref()));

    pending.with_keepalive(SendWrapper::new(RequestListeners {
        request,
        _on_success: on_success,
        _on_error: on_error,
    }))
}

fn failed<T: Send + 'static>(err: JsValue) -> Request<T> {
    Request::ready(Err(js_error(err)))
}

/// The browser's IndexedDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexedDbBackend;

impl IndexedDbBackend {
    pub fn new() -> Self {
        Self
    }

    fn factory() -> Result<IdbFactory, BackendError> {
        web_sys::window()
            .ok_or_else(|| BackendError::invalid_state("no window"))?
            .indexed_db()
            .map_err(js_error)?
            .ok_or_else(|| BackendError::invalid_state("indexedDB is not available"))
    }
}

struct OpenListeners {
    request: IdbOpenDbRequest,
    _on_upgrade: Closure<dyn FnMut(IdbVersionChangeEvent)>,
    _on_success: Listener,
    _on_error: Listener,
}

impl Drop for OpenListeners {
    fn drop(&mut self) {
        self.request.set_onupgradeneeded(None);
        self.request.set_onsuccess(None);
        self.request.set_onerror(None);
    }
}

impl StorageBackend for IndexedDbBackend {
    type Database = IndexedDbDatabase;

    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHandler,
    ) -> Result<Request<IndexedDbDatabase>, BackendError> {
        let factory = Self::factory()?;
        let open_request = factory.open_with_u32(name, version).map_err(js_error)?;
        let (responder, pending) = race::request();

        let on_upgrade: Closure<dyn FnMut(IdbVersionChangeEvent)> = Closure::wrap(Box::new({
            let responder = responder.clone();
            let request = open_request.clone();
            let mut handler = Some(on_upgrade);
            move |event: IdbVersionChangeEvent| {
                let Some(handler) = handler.take() else {
                    return;
                };
                let upgrade = request
                    .result()
                    .map_err(js_error)
                    .and_then(|db| {
                        let transaction = request
                            .transaction()
                            .ok_or_else(|| BackendError::invalid_state("no upgrade transaction"))?;
                        Ok((db.unchecked_into::<IdbDatabase>(), transaction))
                    });

                let (db, transaction) = match upgrade {
                    Ok(parts) => parts,
                    Err(err) => {
                        responder.fail(err);
                        return;
                    }
                };

                let mut ctx = IdbUpgrade {
                    db,
                    transaction: transaction.clone(),
                    old_version: event.old_version() as u32,
                    new_version: event.new_version().unwrap_or(version as f64) as u32,
                };

                if let Err(err) = handler(&mut ctx) {
                    tracing::error!(error = %err, "Upgrade failed");
                    responder.fail(err);
                    let _ = transaction.abort();
                }
            }
        }) as Box<dyn FnMut(_)>);

        let on_success: Listener = Closure::wrap(Box::new({
            let responder = responder.clone();
            let request = open_request.clone();
            move |_event: Event| {
                let result = request.result().map_err(js_error).map(|db| {
                    IndexedDbDatabase::new(db.unchecked_into::<IdbDatabase>())
                });
                responder.settle(result);
            }
        }) as Box<dyn FnMut(_)>);

        let on_error: Listener = Closure::wrap(Box::new({
            let request = open_request.clone();
            move |_event: Event| {
                responder.fail(request_error(&request));
            }
        }) as Box<dyn FnMut(_)>);

        open_request.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));
        open_request.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        open_request.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        Ok(pending.with_keepalive(SendWrapper::new(OpenListeners {
            request: open_request,
            _on_upgrade: on_upgrade,
            _on_success: on_success,
            _on_error: on_error,
        })))
    }
}

struct IdbUpgrade {
    db: IdbDatabase,
    transaction: IdbTransaction,
    old_version: u32,
    new_version: u32,
}

impl IdbUpgrade {
    fn store(&self, name: &str) -> Result<IdbObjectStore, BackendError> {
        self.transaction.object_store(name).map_err(js_error)
    }
}

impl UpgradeContext for IdbUpgrade {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn object_store_names(&self) -> Vec<String> {
        names(self.db.object_store_names())
    }

    fn create_object_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), BackendError> {
        let params = IdbObjectStoreParameters::new();
        if let Some(path) = key_path {
            params.set_key_path(&JsValue::from_str(path.as_str()));
        }
        params.set_auto_increment(auto_increment);

        self.db
            .create_object_store_with_optional_parameters(name, &params)
            .map(|_| ())
            .map_err(js_error)
    }

    fn index_names(&self, store: &str) -> Result<Vec<String>, BackendError> {
        Ok(names(self.store(store)?.index_names()))
    }

    fn create_index(&mut self, store: &str, index: &IndexDef) -> Result<(), BackendError> {
        let params = IdbIndexParameters::new();
        params.set_unique(index.unique);
        params.set_multi_entry(index.multi_entry);

        self.store(store)?
            .create_index_with_str_and_optional_parameters(
                &index.name,
                index.key_path.as_str(),
                &params,
            )
            .map(|_| ())
            .map_err(js_error)
    }
}

/// An open IndexedDB connection.
#[derive(Debug, Clone)]
pub struct IndexedDbDatabase {
    db: SendWrapper<IdbDatabase>,
    name: String,
    version: u32,
}

impl IndexedDbDatabase {
    fn new(db: IdbDatabase) -> Self {
        let name = db.name();
        let version = db.version() as u32;
        Self {
            db: SendWrapper::new(db),
            name,
            version,
        }
    }
}

impl BackendDatabase for IndexedDbDatabase {
    type Transaction = IndexedDbTransaction;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        names(self.db.object_store_names())
    }

    fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<Request<IndexedDbTransaction>, BackendError> {
        let stores: js_sys::Array = scope.iter().map(|s| JsValue::from_str(s)).collect();
        let idb_mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
        };

        let transaction = self
            .db
            .transaction_with_str_sequence_and_mode(&stores, idb_mode)
            .map_err(js_error)?;

        // IndexedDB creates transactions synchronously
        Ok(Request::ready(Ok(IndexedDbTransaction::new(transaction, mode))))
    }
}

struct OutcomeListeners {
    transaction: IdbTransaction,
    _on_complete: Listener,
    _on_abort: Listener,
}

impl Drop for OutcomeListeners {
    fn drop(&mut self) {
        self.transaction.set_oncomplete(None);
        self.transaction.set_onabort(None);
    }
}

struct TxInner {
    transaction: SendWrapper<IdbTransaction>,
    mode: TransactionMode,
    outcome: OutcomeSignal,
    _listeners: SendWrapper<OutcomeListeners>,
}

/// A transaction on an IndexedDB database.
#[derive(Clone)]
pub struct IndexedDbTransaction {
    inner: Arc<TxInner>,
}

impl IndexedDbTransaction {
    fn new(transaction: IdbTransaction, mode: TransactionMode) -> Self {
        let (notifier, outcome) = race::outcome();

        let on_complete: Listener = Closure::wrap(Box::new({
            let notifier = notifier.clone();
            move |_event: Event| {
                notifier.complete();
            }
        }) as Box<dyn FnMut(_)>);

        let on_abort: Listener = Closure::wrap(Box::new({
            let transaction = transaction.clone();
            move |_event: Event| {
                notifier.abort(abort_reason(&transaction));
            }
        }) as Box<dyn FnMut(_)>);

        transaction.set_oncomplete(Some(on_complete.as_ref().unchecked_ref()));
        transaction.set_onabort(Some(on_abort.as_ref().unchecked_ref()));

        Self {
            inner: Arc::new(TxInner {
                transaction: SendWrapper::new(transaction.clone()),
                mode,
                outcome,
                _listeners: SendWrapper::new(OutcomeListeners {
                    transaction,
                    _on_complete: on_complete,
                    _on_abort: on_abort,
                }),
            }),
        }
    }
}

fn abort_reason(transaction: &IdbTransaction) -> BackendError {
    match transaction.error() {
        Some(exception) => {
            BackendError::new(ErrorKind::from_dom_name(&exception.name()), exception.message())
        }
        None => BackendError::abort("transaction was aborted"),
    }
}

impl std::fmt::Debug for IndexedDbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedDbTransaction")
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl BackendTransaction for IndexedDbTransaction {
    type ObjectStore = IndexedDbObjectStore;

    fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    fn object_store(&self, name: &str) -> Result<IndexedDbObjectStore, BackendError> {
        let store = self.inner.transaction.object_store(name).map_err(js_error)?;
        Ok(IndexedDbObjectStore {
            store: SendWrapper::new(store),
            name: name.to_string(),
        })
    }

    fn outcome(&self) -> OutcomeSignal {
        self.inner.outcome.clone()
    }

    fn commit(&self) -> Result<(), BackendError> {
        // IndexedDB commits once no requests remain; a finished transaction
        // has already reported its outcome
        match self.inner.outcome.peek() {
            Some(_) => Err(BackendError::invalid_state("transaction has already finished")),
            None => Ok(()),
        }
    }

    fn abort(&self) {
        let _ = self.inner.transaction.abort();
    }
}

/// An object store inside an [`IndexedDbTransaction`].
pub struct IndexedDbObjectStore {
    store: SendWrapper<IdbObjectStore>,
    name: String,
}

impl BackendObjectStore for IndexedDbObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, value: Value) -> Request<Key> {
        let value = match to_js(&value) {
            Ok(value) => value,
            Err(err) => return Request::ready(Err(err)),
        };
        match self.store.add(&value) {
            Ok(request) => track(request, |key| key_from_js(&key)),
            Err(err) => failed(err),
        }
    }

    fn put(&self, value: Value) -> Request<Key> {
        let value = match to_js(&value) {
            Ok(value) => value,
            Err(err) => return Request::ready(Err(err)),
        };
        match self.store.put(&value) {
            Ok(request) => track(request, |key| key_from_js(&key)),
            Err(err) => failed(err),
        }
    }

    fn delete(&self, key: Key) -> Request<()> {
        match self.store.delete(&key_to_js(&key)) {
            Ok(request) => track(request, |_| Ok(())),
            Err(err) => failed(err),
        }
    }

    fn get(&self, key: Key) -> Request<Option<Value>> {
        match self.store.get(&key_to_js(&key)) {
            Ok(request) => track(request, |value| {
                if value.is_undefined() {
                    Ok(None)
                } else {
                    from_js(value).map(Some)
                }
            }),
            Err(err) => failed(err),
        }
    }

    fn get_all(&self) -> Request<Vec<Value>> {
        match self.store.get_all() {
            Ok(request) => track(request, values_from_js),
            Err(err) => failed(err),
        }
    }

    fn get_all_by_index(&self, index: &str, key: Key) -> Request<Vec<Value>> {
        let request = self
            .store
            .index(index)
            .and_then(|index| index.get_all_with_key(&key_to_js(&key)));
        match request {
            Ok(request) => track(request, values_from_js),
            Err(err) => failed(err),
        }
    }
}

fn values_from_js(values: JsValue) -> Result<Vec<Value>, BackendError> {
    js_sys::Array::from(&values).iter().map(from_js).collect()
}
