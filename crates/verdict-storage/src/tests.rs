//! Store and transaction tests

use super::*;
use serde_json::json;
use tempfile::tempdir;

fn path(text: &str) -> StoragePath {
    StoragePath::parse(text).expect("path")
}

fn store() -> InMemoryStore {
    InMemoryStore::from_value(json!({
        "users": {"alice": {"roles": ["admin"]}},
        "items": [1, 2, 3]
    }))
}

#[test]
fn test_reads_nested_values_and_reports_missing_paths() {
    let store = store();
    let txn = store.new_transaction(TransactionParams::read()).unwrap();
    assert_eq!(store.read(&txn, &path("/users/alice/roles/0")).unwrap(), json!("admin"));
    assert_eq!(store.read(&txn, &path("/items/2")).unwrap(), json!(3));

    let err = store.read(&txn, &path("/users/bob")).unwrap_err();
    assert!(err.is_not_found());
    assert!(store.read(&txn, &path("/items/x")).unwrap_err().is_not_found());
}

#[test]
fn test_writes_are_isolated_until_commit() {
    let store = store();
    let reader = store.new_transaction(TransactionParams::read()).unwrap();
    let mut writer = store.new_transaction(TransactionParams::write()).unwrap();

    store
        .write(&mut writer, PatchOp::Add, &path("/users/bob"), json!({"roles": []}))
        .unwrap();
    assert!(store.read(&writer, &path("/users/bob")).is_ok());
    assert!(store.read(&reader, &path("/users/bob")).unwrap_err().is_not_found());

    store.commit(writer).unwrap();
    let after = store.new_transaction(TransactionParams::read()).unwrap();
    assert!(store.read(&after, &path("/users/bob")).is_ok());
    // Old snapshot stays stable.
    assert!(store.read(&reader, &path("/users/bob")).is_err());
}

#[test]
fn test_read_only_and_conflicting_transactions_are_rejected() {
    let store = store();
    let mut reader = store.new_transaction(TransactionParams::read()).unwrap();
    let err = store
        .write(&mut reader, PatchOp::Add, &path("/x"), json!(1))
        .unwrap_err();
    assert_eq!(err, StorageError::ReadOnly(reader.id()));

    let mut a = store.new_transaction(TransactionParams::write()).unwrap();
    let mut b = store.new_transaction(TransactionParams::write()).unwrap();
    store.write(&mut a, PatchOp::Add, &path("/a"), json!(1)).unwrap();
    store.write(&mut b, PatchOp::Add, &path("/b"), json!(2)).unwrap();
    store.commit(a).unwrap();
    assert!(matches!(store.commit(b), Err(StorageError::Conflict(_))));
}

#[test]
fn test_patch_ops_on_arrays_and_objects() {
    let store = store();
    let mut txn = store.new_transaction(TransactionParams::write()).unwrap();
    store.write(&mut txn, PatchOp::Add, &path("/items/-"), json!(4)).unwrap();
    store.write(&mut txn, PatchOp::Replace, &path("/items/0"), json!(0)).unwrap();
    store.write(&mut txn, PatchOp::Remove, &path("/users/alice"), json!(null)).unwrap();
    assert!(store
        .write(&mut txn, PatchOp::Replace, &path("/missing/x"), json!(1))
        .unwrap_err()
        .is_not_found());
    store.commit(txn).unwrap();

    assert_eq!(*store.snapshot(), json!({"users": {}, "items": [0, 2, 3, 4]}));
}

#[test]
fn test_snapshot_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        snapshot_path: Some(dir.path().join("data.json")),
    };

    let store = InMemoryStore::open(config.clone()).unwrap();
    let mut txn = store.new_transaction(TransactionParams::write()).unwrap();
    store
        .write(&mut txn, PatchOp::Add, &path("/limits"), json!({"max": 10}))
        .unwrap();
    store.commit(txn).unwrap();
    store.flush().unwrap();

    let reopened = InMemoryStore::open(config).unwrap();
    let txn = reopened.new_transaction(TransactionParams::read()).unwrap();
    assert_eq!(reopened.read(&txn, &path("/limits/max")).unwrap(), json!(10));
}

#[test]
fn test_rejects_non_object_snapshots() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("bad.json");
    std::fs::write(&file, "[1, 2]").unwrap();
    let err = persistence::load_snapshot(&file).unwrap_err();
    assert!(err.to_string().contains("must hold a JSON object"), "{err}");
}

#[test]
fn test_path_parsing() {
    assert!(path("/").is_root());
    assert_eq!(path("a/b").to_string(), "/a/b");
    assert!(StoragePath::parse("/a//b").is_err());
}
