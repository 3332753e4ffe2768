use async_trait::async_trait;
use batchtx::core::{LockPolicy, TransactionPolicy};
use batchtx::{
    ExecutionOutput, OperationExecutor, OperationItem, ResourceLockTable, Result, SnapshotStore,
    TransactionContext, TransactionCoordinator, TransactionId, TransactionOptions,
    TransactionStatus, TxError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_holders_never_overlap() {
    let table = Arc::new(ResourceLockTable::default());
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let table = table.clone();
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        handles.push(tokio::spawn(async move {
            let holder = TransactionId::new();
            table
                .acquire("ledger", holder, Duration::from_secs(5))
                .await
                .unwrap();
            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            assert!(table.release("ledger", holder).await);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(table.active_count().await, 0);
}

#[tokio::test]
async fn test_overlapping_batches_lock_in_one_order() {
    let table = Arc::new(ResourceLockTable::default());
    let a = TransactionId::new();
    let b = TransactionId::new();
    let forward = vec!["doc-1".to_string(), "doc-2".to_string()];
    let backward = vec!["doc-2".to_string(), "doc-1".to_string()];

    let (first, second) = tokio::join!(
        table.acquire_all(&forward, a, Duration::from_millis(500)),
        table.acquire_all(&backward, b, Duration::from_millis(500)),
    );
    let winner = match (first, second) {
        (Ok(_), Err(TxError::LockConflict { .. })) => a,
        (Err(TxError::LockConflict { .. }), Ok(_)) => b,
        (Ok(_), Ok(_)) => panic!("both batches hold the same resources"),
        other => panic!("unexpected result: {other:?}"),
    };

    assert_eq!(table.holder_of("doc-1").await, Some(winner));
    assert_eq!(table.holder_of("doc-2").await, Some(winner));
    assert_eq!(table.release_all(winner).await, 2);
}

#[tokio::test]
async fn test_expired_locks_are_reclaimed_and_purged() {
    let table = ResourceLockTable::new(LockPolicy {
        lock_timeout_ms: 20,
        ..LockPolicy::default()
    });
    let stale = TransactionId::new();
    table.try_acquire("doc-1", stale).await.unwrap();
    table.try_acquire("doc-2", stale).await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(table.holder_of("doc-1").await, None);

    let fresh = TransactionId::new();
    table.try_acquire("doc-1", fresh).await.unwrap();
    assert_eq!(table.purge_expired().await, 1);
    assert_eq!(table.active_count().await, 1);
    assert!(!table.release("doc-1", stale).await);
}

struct Accept;

#[async_trait]
impl OperationExecutor for Accept {
    async fn execute(&self, _item: &OperationItem, _ctx: &TransactionContext) -> Result<ExecutionOutput> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ExecutionOutput::default())
    }
}

#[tokio::test]
async fn test_waiting_begin_proceeds_after_commit() {
    let coordinator = Arc::new(TransactionCoordinator::new(
        TransactionPolicy::default(),
        Arc::new(ResourceLockTable::default()),
        Arc::new(SnapshotStore::default()),
    ));
    let first = coordinator
        .begin(
            "import",
            vec![OperationItem::create("a", "doc-1")],
            TransactionOptions::new(),
        )
        .await
        .unwrap();

    let waiter = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .begin(
                    "import",
                    vec![OperationItem::update("b", "doc-1")],
                    TransactionOptions::new().with_lock_wait(Duration::from_secs(2)),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let outcome = coordinator.execute(first, Arc::new(Accept), None).await.unwrap();
    assert_eq!(outcome.status(), TransactionStatus::Committed);

    let second = waiter.await.unwrap().unwrap();
    assert_eq!(coordinator.locks().holder_of("doc-1").await, Some(second));
}
