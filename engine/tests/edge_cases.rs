//! Edge case tests for docstash-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use docstash_engine::{
    error::Error, layout, CollectionSchema, Database, Document, FieldDef, FieldType, IndexDef,
    Key, KeyPath, MutationBatch, MutationType, ObjectStore, RawDocument, Schema, Snapshot,
};
use proptest::prelude::*;
use serde_json::json;

fn create_test_schema() -> Schema {
    let fields = vec![
        FieldDef::required("name", FieldType::String),
        FieldDef::optional("count", FieldType::Int),
        FieldDef::optional("data", FieldType::Json),
    ];
    Schema::new(1).with_collection(CollectionSchema::new("items", fields))
}

fn provisioned() -> Database {
    let mut db = Database::new("edge");
    for def in layout::object_stores() {
        let store = db
            .create_object_store(&def.name, def.key_path.clone(), def.auto_increment)
            .unwrap();
        for index in def.indexes {
            store.create_index(index).unwrap();
        }
    }
    db.set_version(1);
    db
}

fn doc(id: &str, name: &str) -> serde_json::Value {
    Document::new(id, "items", json!({"name": name}), 1000)
        .to_value()
        .unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let schema = create_test_schema();
    let value = doc("item1", "");
    schema.validate_document("items", &value).unwrap();

    let mut db = provisioned();
    db.store_mut(layout::LOCAL).unwrap().add(value, None).unwrap();

    let stored = db.store(layout::LOCAL).unwrap().get(&Key::from("item1")).unwrap();
    assert_eq!(stored["name"], "");
}

#[test]
fn unicode_ids_and_fields() {
    let mut db = provisioned();
    let local = db.store_mut(layout::LOCAL).unwrap();

    let ids = ["日本語", "Привет", "🎉🚀", "with space", "tab\there"];
    for id in ids {
        local.add(doc(id, id), None).unwrap();
    }

    for id in ids {
        let stored = local.get(&Key::from(id)).unwrap();
        let raw = RawDocument::from_value(stored.clone()).unwrap();
        assert_eq!(raw.id, id);
        assert_eq!(raw.body["name"], id);
    }
}

#[test]
fn empty_document_id_is_still_a_key() {
    let mut db = provisioned();
    let local = db.store_mut(layout::LOCAL).unwrap();

    local.add(doc("", "anonymous"), None).unwrap();
    assert!(local.contains(&Key::from("")));
}

// ============================================================================
// Key Edge Cases
// ============================================================================

#[test]
fn keys_order_numbers_before_strings_before_arrays() {
    let mut keys = vec![
        Key::Array(vec![Key::Number(1)]),
        Key::from("a"),
        Key::Number(10),
        Key::from(""),
        Key::Number(-5),
    ];
    keys.sort();

    assert_eq!(
        keys,
        vec![
            Key::Number(-5),
            Key::Number(10),
            Key::from(""),
            Key::from("a"),
            Key::Array(vec![Key::Number(1)]),
        ]
    );
}

#[test]
fn non_key_values_are_rejected() {
    for value in [json!(null), json!(true), json!({"a": 1}), json!(1.5)] {
        assert!(matches!(Key::from_value(&value), Err(Error::InvalidKey(_))));
    }
}

#[test]
fn missing_inline_key_is_rejected() {
    let mut db = provisioned();
    let err = db
        .store_mut(layout::LOCAL)
        .unwrap()
        .add(json!({"name": "no id"}), None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidKey(_)));
}

#[test]
fn explicit_key_on_inline_store_is_rejected() {
    let mut db = provisioned();
    let err = db
        .store_mut(layout::LOCAL)
        .unwrap()
        .put(doc("a", "a"), Some(Key::from("a")))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidKey(_)));
}

// ============================================================================
// Key Generator Edge Cases
// ============================================================================

#[test]
fn generated_keys_skip_past_explicit_numbers() {
    let mut store = ObjectStore::new("log", Some(KeyPath::new("seq")), true);

    assert_eq!(store.add(json!({}), None).unwrap(), Key::Number(1));
    store.add(json!({"seq": 10}), None).unwrap();
    assert_eq!(store.add(json!({}), None).unwrap(), Key::Number(11));

    let third = store.get(&Key::Number(11)).unwrap();
    assert_eq!(third["seq"], 11);
}

#[test]
fn generated_keys_are_not_reused_after_delete() {
    let mut store = ObjectStore::new("log", None, true);

    let first = store.add(json!("a"), None).unwrap();
    assert!(store.delete(&first));
    assert_eq!(store.add(json!("b"), None).unwrap(), Key::Number(2));
}

#[test]
fn injecting_into_a_non_object_fails() {
    let mut store = ObjectStore::new("log", Some(KeyPath::new("seq")), true);
    assert!(store.add(json!("scalar"), None).is_err());
    assert!(store.is_empty());
}

// ============================================================================
// Index Edge Cases
// ============================================================================

#[test]
fn collection_index_finds_documents_across_ids() {
    let mut db = provisioned();
    let remote = db.store_mut(layout::REMOTE).unwrap();

    remote.put(doc("b", "b"), None).unwrap();
    remote.put(doc("a", "a"), None).unwrap();
    remote
        .put(Document::new("c", "other", json!({}), 1).to_value().unwrap(), None)
        .unwrap();

    let items = remote
        .get_all_by_index(layout::BY_COLLECTION_NAME, &Key::from("items"))
        .unwrap();
    let ids: Vec<_> = items.iter().map(|v| v["_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[test]
fn multi_entry_index_lists_every_element() {
    let mut db = provisioned();
    let intercom = db.store_mut(layout::INTERCOM).unwrap();

    intercom
        .add(json!({"collectionNames": ["items", "users"]}), None)
        .unwrap();
    intercom
        .add(json!({"collectionNames": ["users"]}), None)
        .unwrap();

    let by = |name: &str| {
        intercom
            .get_all_by_index(layout::BY_COLLECTION_NAME, &Key::from(name))
            .unwrap()
            .len()
    };
    assert_eq!(by("items"), 1);
    assert_eq!(by("users"), 2);
    assert_eq!(by("none"), 0);
}

#[test]
fn unique_index_rejects_duplicates_but_allows_rewrites() {
    let mut store = ObjectStore::new("people", Some(KeyPath::new("_id")), false);
    store
        .create_index(IndexDef::new("by-email", "email").unique())
        .unwrap();

    store.put(json!({"_id": "a", "email": "x@y"}), None).unwrap();
    store.put(json!({"_id": "a", "email": "x@y"}), None).unwrap();

    let err = store
        .put(json!({"_id": "b", "email": "x@y"}), None)
        .unwrap_err();
    assert!(matches!(err, Error::UniqueIndexViolation { .. }));
}

#[test]
fn unknown_index_is_an_error() {
    let db = provisioned();
    let err = db
        .store(layout::LOCAL)
        .unwrap()
        .get_all_by_index("by-nothing", &Key::from("x"))
        .unwrap_err();
    assert!(matches!(err, Error::IndexNotFound { .. }));
}

#[test]
fn duplicate_store_and_index_creation_fail() {
    let mut db = provisioned();
    assert!(matches!(
        db.create_object_store(layout::LOCAL, None, false),
        Err(Error::ObjectStoreExists(_))
    ));

    let err = db
        .store_mut(layout::LOCAL)
        .unwrap()
        .create_index(IndexDef::new(layout::BY_COLLECTION_NAME, "_meta.collectionName"))
        .unwrap_err();
    assert!(matches!(err, Error::IndexExists { .. }));
}

// ============================================================================
// Document Edge Cases
// ============================================================================

#[test]
fn body_fields_sit_beside_id_and_meta() {
    let value = Document::new("d1", "items", json!({"name": "n", "count": 3}), 42)
        .to_value()
        .unwrap();

    assert_eq!(value["_id"], "d1");
    assert_eq!(value["_meta"]["collectionName"], "items");
    assert_eq!(value["_meta"]["createdAt"], 42);
    assert_eq!(value["_meta"]["lastUpdatedAt"], 42);
    assert_eq!(value["count"], 3);
}

#[test]
fn touch_never_precedes_creation() {
    let mut document = Document::new("d1", "items", json!({"name": "n"}), 5000);
    document.meta.touch(1000);
    assert_eq!(document.meta.last_updated_at, 5000);

    document.meta.touch(6000);
    assert_eq!(document.meta.last_updated_at, 6000);
    assert_eq!(document.meta.created_at, 5000);
}

#[test]
fn scalar_body_cannot_become_raw() {
    let document = Document::new("d1", "items", 7, 1);
    assert!(matches!(document.into_raw(), Err(Error::InvalidPayload(_))));
}

#[test]
fn raw_document_without_meta_is_rejected() {
    assert!(RawDocument::from_value(json!({"_id": "x", "name": "n"})).is_err());
}

// ============================================================================
// Schema Edge Cases
// ============================================================================

#[test]
fn deeply_nested_json_field() {
    let schema = create_test_schema();
    let nested = json!({
        "name": "nested",
        "data": {"a": {"b": {"c": {"d": [1, 2, {"e": null}]}}}}
    });
    schema.validate_body("items", &nested).unwrap();
}

#[test]
fn wrong_field_type_is_reported() {
    let schema = create_test_schema();
    let err = schema
        .validate_body("items", &json!({"name": "n", "count": "three"}))
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
}

#[test]
fn updates_must_carry_a_document() {
    let schema = create_test_schema();
    let mut batch = MutationBatch::new();
    batch.push(MutationType::Update, "a", "items", None);

    assert!(matches!(
        schema.validate_action(&batch.actions()[0]),
        Err(Error::InvalidPayload(_))
    ));
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_keeps_key_generator_state() {
    let mut db = provisioned();
    let intercom = db.store_mut(layout::INTERCOM).unwrap();
    intercom.add(json!({"collectionNames": []}), None).unwrap();
    intercom.add(json!({"collectionNames": []}), None).unwrap();
    intercom.delete(&Key::Number(2));

    let mut snapshot = Snapshot::new();
    snapshot.add_database(&db);
    let json = snapshot.to_json().unwrap();

    let mut restored = Snapshot::from_json(&json).unwrap().restore().unwrap();
    let mut restored = restored.pop().unwrap();
    assert_eq!(restored.version(), 1);

    let next = restored
        .store_mut(layout::INTERCOM)
        .unwrap()
        .add(json!({"collectionNames": []}), None)
        .unwrap();
    assert_eq!(next, Key::Number(3));
}

#[test]
fn snapshot_from_garbage_fails() {
    assert!(Snapshot::from_json("{not json").is_err());
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn op_ids_follow_push_order(ops in prop::collection::vec(0u8..3, 0..50)) {
        let mut batch = MutationBatch::new();

        for (i, op) in ops.iter().enumerate() {
            let op = match op {
                0 => MutationType::Create,
                1 => MutationType::Update,
                _ => MutationType::Delete,
            };
            let op_id = batch.push(op, format!("d{i}"), "items", None);
            prop_assert_eq!(op_id, i as u64 + 1);
        }

        prop_assert_eq!(batch.last_op_id(), ops.len() as u64);
        prop_assert!(batch
            .actions()
            .windows(2)
            .all(|pair| pair[0].op_id + 1 == pair[1].op_id));
    }

    #[test]
    fn put_then_get_returns_the_last_write(
        writes in prop::collection::vec(("[a-d]", "[a-z]{0,8}"), 1..30)
    ) {
        let mut db = provisioned();
        let local = db.store_mut(layout::LOCAL).unwrap();
        let mut expected = std::collections::BTreeMap::new();

        for (id, name) in &writes {
            local.put(doc(id, name), None).unwrap();
            expected.insert(id.clone(), name.clone());
        }

        prop_assert_eq!(local.len(), expected.len());
        for (id, name) in expected {
            let stored = local.get(&Key::from(id)).unwrap();
            prop_assert_eq!(stored["name"].as_str(), Some(name.as_str()));
        }
    }
}
