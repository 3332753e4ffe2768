use batchtx::core::SnapshotPolicy;
use batchtx::snapshot::snapshot_index_key;
use batchtx::{
    CaptureMode, FileKeyValueStore, KeyValueStore, OperationItem, SnapshotStore, TransactionId,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

fn catalog(price: u32) -> Vec<OperationItem> {
    vec![
        OperationItem::update("sku-1", "products/1")
            .with_payload(json!({"name": "lamp", "price": price, "tags": ["home"]})),
        OperationItem::update("sku-2", "products/2").with_payload(json!({"name": "desk", "price": 120})),
        OperationItem::create("sku-3", "products/3")
            .with_payload(json!({"name": "chair", "price": 45}))
            .with_dependency("sku-2"),
    ]
}

#[tokio::test]
async fn test_file_backed_snapshots_survive_restart() {
    let dir = tempdir().unwrap();
    let txn = TransactionId::new();

    let first_id = {
        let kv = Arc::new(FileKeyValueStore::open(dir.path()).await.unwrap());
        let store = SnapshotStore::default().with_persistence(kv);
        let full = store
            .capture(txn, &catalog(30), CaptureMode::Full, None)
            .await
            .unwrap();
        store
            .capture(txn, &catalog(35), CaptureMode::Incremental, None)
            .await
            .unwrap();
        full.id
    };

    let kv = Arc::new(FileKeyValueStore::open(dir.path()).await.unwrap());
    assert!(kv.get(&snapshot_index_key(txn)).await.unwrap().is_some());

    let reopened = SnapshotStore::default().with_persistence(kv);
    let loaded = reopened.load_persisted(txn).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].id, first_id);
    assert_eq!(loaded[1].mode, CaptureMode::Incremental);
    assert_eq!(loaded[1].base_snapshot_id, Some(first_id));

    let latest = reopened.get(txn).await.unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(reopened.restore(&latest).await.unwrap(), catalog(35));
    reopened.verify(&latest).await.unwrap();
}

#[tokio::test]
async fn test_derived_modes_restore_the_captured_items() {
    let store = SnapshotStore::default();
    let txn = TransactionId::new();
    let base = store
        .capture(txn, &catalog(30), CaptureMode::Full, None)
        .await
        .unwrap();

    let incremental = store
        .capture(txn, &catalog(31), CaptureMode::Incremental, Some(base.id))
        .await
        .unwrap();
    let differential = store
        .capture(txn, &catalog(32), CaptureMode::Differential, Some(base.id))
        .await
        .unwrap();

    assert_eq!(incremental.mode, CaptureMode::Incremental);
    assert_eq!(differential.mode, CaptureMode::Differential);
    assert_eq!(store.restore(&incremental).await.unwrap(), catalog(31));
    assert_eq!(store.restore(&differential).await.unwrap(), catalog(32));
    assert_eq!(store.history(txn).await.len(), 3);
    assert_eq!(differential.dependencies.dependent_items(), 1);
}

#[tokio::test]
async fn test_incremental_without_base_is_full() {
    let store = SnapshotStore::default();
    let snapshot = store
        .capture(TransactionId::new(), &catalog(10), CaptureMode::Incremental, None)
        .await
        .unwrap();
    assert_eq!(snapshot.mode, CaptureMode::Full);
    assert!(snapshot.base_snapshot_id.is_none());
}

#[tokio::test]
async fn test_empty_capture_restores_nothing() {
    let store = SnapshotStore::default();
    let snapshot = store
        .capture(TransactionId::new(), &[], CaptureMode::Full, None)
        .await
        .unwrap();
    assert_eq!(snapshot.item_count, 0);
    assert!(store.restore(&snapshot).await.unwrap().is_empty());
    store.verify(&snapshot).await.unwrap();
}

#[tokio::test]
async fn test_garbage_collection_skips_pinned_and_bases() {
    let store = SnapshotStore::new(SnapshotPolicy {
        retention_ms: 1_000,
        ..SnapshotPolicy::default()
    });
    let pinned = TransactionId::new();
    let chained = TransactionId::new();
    let loose = TransactionId::new();

    store.capture(pinned, &catalog(1), CaptureMode::Full, None).await.unwrap();
    store.pin(pinned).await;
    let base = store.capture(chained, &catalog(2), CaptureMode::Full, None).await.unwrap();
    let derived = store
        .capture(chained, &catalog(3), CaptureMode::Incremental, None)
        .await
        .unwrap();
    let orphan = store.capture(loose, &catalog(4), CaptureMode::Full, None).await.unwrap();

    let later = Utc::now() + ChronoDuration::seconds(60);
    let evicted = store.collect_garbage(later).await.unwrap();

    assert!(evicted.contains(&orphan.id));
    assert!(evicted.contains(&derived.id));
    assert!(evicted.contains(&base.id));
    let position = |target| evicted.iter().position(|id| *id == target);
    assert!(position(derived.id) < position(base.id));
    assert_eq!(store.len().await, 1);
    assert!(store.get(pinned).await.is_some());

    store.unpin(pinned).await;
    assert_eq!(store.collect_garbage(later).await.unwrap().len(), 1);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_retention_cap_never_evicts_young_snapshots() {
    let store = SnapshotStore::new(SnapshotPolicy {
        max_retained: 1,
        ..SnapshotPolicy::default()
    });
    let first = store
        .capture(TransactionId::new(), &catalog(10), CaptureMode::Full, None)
        .await
        .unwrap();
    let second = store
        .capture(TransactionId::new(), &catalog(11), CaptureMode::Full, None)
        .await
        .unwrap();

    assert!(store.collect_garbage(Utc::now()).await.unwrap().is_empty());
    assert_eq!(store.len().await, 2);
    assert!(store.get_by_id(first.id).await.is_some());

    let later = Utc::now() + ChronoDuration::days(2);
    let evicted = store.collect_garbage(later).await.unwrap();
    assert_eq!(evicted.len(), 2);
    assert!(evicted.contains(&first.id) && evicted.contains(&second.id));
    assert!(store.is_empty().await);
}
