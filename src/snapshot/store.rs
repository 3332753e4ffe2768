// ============================================================================
// Snapshot Store
// ============================================================================
//
// Captures, versions and restores the pre-execution state of a transaction's
// items. Snapshots are immutable once stored and are shared as Arc<Snapshot>.
//
// Persisted layout (when a KeyValueStore is attached):
//   snapshot/<transaction_id>/<snapshot_id>   MessagePack of the Snapshot
//   snapshot-index/<transaction_id>           JSON array of snapshot ids
//
// ============================================================================

use super::capture::{
    differential_content, full_content, incremental_content, item_checksums, resolve_content,
    summarize_dependencies,
};
use super::persistence::KeyValueStore;
use super::types::{CaptureMode, Snapshot, SnapshotBody, SnapshotContent};
use crate::core::{
    OperationItem, Result, SnapshotId, SnapshotPolicy, TransactionId, TxError, checksum_of,
    item_checksum,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Level, event};

pub const SNAPSHOT_KEY_PREFIX: &str = "snapshot/";
pub const SNAPSHOT_INDEX_PREFIX: &str = "snapshot-index/";

pub fn snapshot_key(transaction_id: TransactionId, snapshot_id: SnapshotId) -> String {
    format!("{}{}/{}", SNAPSHOT_KEY_PREFIX, transaction_id, snapshot_id)
}

pub fn snapshot_index_key(transaction_id: TransactionId) -> String {
    format!("{}{}", SNAPSHOT_INDEX_PREFIX, transaction_id)
}

#[derive(Default)]
struct SnapshotIndex {
    snapshots: HashMap<SnapshotId, Arc<Snapshot>>,
    by_transaction: HashMap<TransactionId, Vec<SnapshotId>>,
    pinned: HashSet<TransactionId>,
    /// Highest version issued per transaction. Survives eviction so that
    /// versions never repeat.
    versions: HashMap<TransactionId, u32>,
}

impl SnapshotIndex {
    fn insert(&mut self, snapshot: Arc<Snapshot>) {
        let ids = self
            .by_transaction
            .entry(snapshot.transaction_id)
            .or_default();
        if !ids.contains(&snapshot.id) {
            ids.push(snapshot.id);
        }
        let issued = self.versions.entry(snapshot.transaction_id).or_default();
        *issued = (*issued).max(snapshot.version);
        self.snapshots.insert(snapshot.id, snapshot);
    }

    fn next_version(&self, transaction_id: TransactionId) -> u32 {
        self.versions
            .get(&transaction_id)
            .copied()
            .unwrap_or_default()
            .saturating_add(1)
    }

    fn remove(&mut self, snapshot_id: SnapshotId) -> Option<Arc<Snapshot>> {
        let snapshot = self.snapshots.remove(&snapshot_id)?;
        if let Some(ids) = self.by_transaction.get_mut(&snapshot.transaction_id) {
            ids.retain(|id| *id != snapshot_id);
            if ids.is_empty() {
                self.by_transaction.remove(&snapshot.transaction_id);
            }
        }
        Some(snapshot)
    }

    fn latest(&self, transaction_id: TransactionId) -> Option<Arc<Snapshot>> {
        self.by_transaction
            .get(&transaction_id)
            .and_then(|ids| ids.last())
            .and_then(|id| self.snapshots.get(id))
            .cloned()
    }

    /// Snapshot ids referenced as a base by another stored snapshot.
    fn referenced_bases(&self) -> HashSet<SnapshotId> {
        self.snapshots
            .values()
            .filter_map(|snapshot| snapshot.base_snapshot_id)
            .collect()
    }
}

pub struct SnapshotStore {
    policy: SnapshotPolicy,
    index: RwLock<SnapshotIndex>,
    persistence: Option<Arc<dyn KeyValueStore>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(SnapshotPolicy::default())
    }
}

impl SnapshotStore {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            policy,
            index: RwLock::new(SnapshotIndex::default()),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn KeyValueStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Captures the state of `items` for `transaction_id`.
    ///
    /// Incremental and differential capture diff against `base`, or against
    /// the transaction's latest snapshot when `base` is `None`. Without a
    /// usable base the capture degrades to full with no back-reference.
    pub async fn capture(
        &self,
        transaction_id: TransactionId,
        items: &[OperationItem],
        mode: CaptureMode,
        base: Option<SnapshotId>,
    ) -> Result<Arc<Snapshot>> {
        let checksums = item_checksums(items)?;
        let dependencies = summarize_dependencies(items);

        let base_snapshot = match mode {
            CaptureMode::Full => None,
            CaptureMode::Incremental | CaptureMode::Differential => {
                let index = self.index.read().await;
                match base {
                    Some(base_id) => index.snapshots.get(&base_id).cloned(),
                    None => index.latest(transaction_id),
                }
            }
        };
        if mode != CaptureMode::Full && base_snapshot.is_none() {
            event!(
                Level::DEBUG,
                transaction_id = %transaction_id,
                requested_mode = %mode,
                "no base snapshot available, capturing full"
            );
        }

        let content = match (&base_snapshot, mode) {
            (Some(base), CaptureMode::Incremental) => {
                incremental_content(&base.item_checksums, items, &checksums)
            }
            (Some(base), CaptureMode::Differential) => {
                let reference = self.restore(base).await?;
                differential_content(&reference, items)?
            }
            _ => full_content(items),
        };

        let mode = content.mode();
        let checksum = checksum_of(&content)?;
        let (body, size_bytes) = self.encode_body(content)?;

        let snapshot = {
            let mut index = self.index.write().await;
            let version = index.next_version(transaction_id);
            let snapshot = Arc::new(Snapshot {
                id: SnapshotId::new(),
                transaction_id,
                version,
                mode,
                created_at: Utc::now(),
                base_snapshot_id: base_snapshot.as_ref().map(|base| base.id),
                body,
                item_checksums: checksums,
                dependencies,
                checksum,
                size_bytes,
                item_count: items.len(),
            });
            index.insert(snapshot.clone());
            if index.snapshots.len() > self.policy.max_retained {
                event!(
                    Level::WARN,
                    retained = index.snapshots.len(),
                    max_retained = self.policy.max_retained,
                    "snapshot store above its retention cap"
                );
            }
            snapshot
        };

        if let Err(err) = self.persist(&snapshot).await {
            self.index.write().await.remove(snapshot.id);
            event!(Level::ERROR, error = %err, snapshot_id = %snapshot.id, "failed to persist snapshot");
            return Err(err);
        }

        event!(
            Level::DEBUG,
            transaction_id = %transaction_id,
            snapshot_id = %snapshot.id,
            mode = %snapshot.mode,
            size_bytes = snapshot.size_bytes,
            compressed = snapshot.is_compressed(),
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Picks the stored form of `content`: plain JSON when it fits the
    /// ceiling, MessagePack otherwise.
    fn encode_body(&self, content: SnapshotContent) -> Result<(SnapshotBody, usize)> {
        let limit_bytes = self.policy.max_snapshot_bytes;
        let plain = serde_json::to_vec(&content)
            .map_err(|err| TxError::Serialization(format!("encode snapshot: {}", err)))?;
        if plain.len() <= limit_bytes {
            return Ok((SnapshotBody::Plain(content), plain.len()));
        }

        let packed = rmp_serde::to_vec_named(&content)
            .map_err(|err| TxError::Serialization(format!("pack snapshot: {}", err)))?;
        if packed.len() > limit_bytes {
            return Err(TxError::SnapshotTooLarge {
                size_bytes: packed.len(),
                limit_bytes,
            });
        }
        event!(
            Level::DEBUG,
            plain_bytes = plain.len(),
            packed_bytes = packed.len(),
            "snapshot compressed to fit ceiling"
        );
        let size = packed.len();
        Ok((SnapshotBody::Packed(packed), size))
    }

    /// Latest snapshot captured for `transaction_id`.
    pub async fn get(&self, transaction_id: TransactionId) -> Option<Arc<Snapshot>> {
        self.index.read().await.latest(transaction_id)
    }

    pub async fn get_by_id(&self, snapshot_id: SnapshotId) -> Option<Arc<Snapshot>> {
        self.index.read().await.snapshots.get(&snapshot_id).cloned()
    }

    /// Every retained snapshot of `transaction_id`, oldest first.
    pub async fn history(&self, transaction_id: TransactionId) -> Vec<Arc<Snapshot>> {
        let index = self.index.read().await;
        index
            .by_transaction
            .get(&transaction_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.snapshots.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.snapshots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Base chain of `snapshot`, ordered from the full snapshot at its root
    /// up to `snapshot` itself.
    async fn chain(&self, snapshot: &Snapshot) -> Result<Vec<Arc<Snapshot>>> {
        let index = self.index.read().await;
        let mut chain = vec![Arc::new(snapshot.clone())];
        let mut seen = HashSet::from([snapshot.id]);
        let mut next = snapshot.base_snapshot_id;
        while let Some(base_id) = next {
            if !seen.insert(base_id) {
                return Err(TxError::Validation(format!(
                    "snapshot {} has a cyclic base chain",
                    snapshot.id
                )));
            }
            let base = index
                .snapshots
                .get(&base_id)
                .cloned()
                .ok_or_else(|| TxError::SnapshotNotFound(base_id.to_string()))?;
            next = base.base_snapshot_id;
            chain.push(base);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Rebuilds the exact item list the snapshot captured.
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<Vec<OperationItem>> {
        let chain = self.chain(snapshot).await?;
        let mut resolved: Option<Vec<OperationItem>> = None;
        for link in &chain {
            link.verify_checksum()?;
            resolved = Some(resolve_content(&link.content()?, resolved)?);
        }
        resolved.ok_or_else(|| TxError::SnapshotNotFound(snapshot.id.to_string()))
    }

    /// Verifies the checksum of every link of the base chain and that the
    /// resolved items match the recorded per-item checksums.
    pub async fn verify(&self, snapshot: &Snapshot) -> Result<()> {
        let items = self.restore(snapshot).await?;
        if items.len() != snapshot.item_checksums.len() {
            return Err(TxError::Validation(format!(
                "snapshot {} resolves to {} items, {} recorded",
                snapshot.id,
                items.len(),
                snapshot.item_checksums.len()
            )));
        }
        for item in &items {
            let actual = item_checksum(item)?;
            let expected = snapshot.item_checksums.get(&item.id).copied();
            if expected != Some(actual) {
                return Err(TxError::ChecksumMismatch {
                    snapshot_id: format!("{}:{}", snapshot.id, item.id),
                    expected: expected.unwrap_or_default(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Protects a transaction's snapshots from garbage collection while the
    /// transaction is live.
    pub async fn pin(&self, transaction_id: TransactionId) {
        self.index.write().await.pinned.insert(transaction_id);
    }

    pub async fn unpin(&self, transaction_id: TransactionId) {
        self.index.write().await.pinned.remove(&transaction_id);
    }

    /// Drops every snapshot of `transaction_id`, in memory and persisted.
    /// Returns how many were removed.
    pub async fn remove_transaction(&self, transaction_id: TransactionId) -> Result<usize> {
        let removed: Vec<Arc<Snapshot>> = {
            let mut index = self.index.write().await;
            index.pinned.remove(&transaction_id);
            index.versions.remove(&transaction_id);
            let ids = index
                .by_transaction
                .get(&transaction_id)
                .cloned()
                .unwrap_or_default();
            ids.into_iter()
                .filter_map(|snapshot_id| index.remove(snapshot_id))
                .collect()
        };
        if let Some(persistence) = &self.persistence {
            for snapshot in &removed {
                persistence
                    .delete(&snapshot_key(transaction_id, snapshot.id))
                    .await?;
            }
            self.write_index(transaction_id).await?;
        }
        Ok(removed.len())
    }

    /// Evicts snapshots older than the retention window. Pinned transactions
    /// and snapshots still used as a base are never evicted, whatever the
    /// retained count. Returns the evicted ids, dependents before their base.
    pub async fn collect_garbage(&self, now: DateTime<Utc>) -> Result<Vec<SnapshotId>> {
        let retention_ms = i64::try_from(self.policy.retention_ms).unwrap_or(i64::MAX);
        let (evicted, retained): (Vec<Arc<Snapshot>>, usize) = {
            let mut index = self.index.write().await;
            let mut evicted = Vec::new();
            loop {
                let referenced = index.referenced_bases();
                let mut round: Vec<&Arc<Snapshot>> = index
                    .snapshots
                    .values()
                    .filter(|snapshot| {
                        snapshot.age_ms(now) > retention_ms
                            && !referenced.contains(&snapshot.id)
                            && !index.pinned.contains(&snapshot.transaction_id)
                    })
                    .collect();
                round.sort_by_key(|snapshot| snapshot.created_at);
                let round: Vec<SnapshotId> = round.into_iter().map(|snapshot| snapshot.id).collect();

                if round.is_empty() {
                    break;
                }
                for snapshot_id in round {
                    if let Some(snapshot) = index.remove(snapshot_id) {
                        evicted.push(snapshot);
                    }
                }
            }
            (evicted, index.snapshots.len())
        };

        if let Some(persistence) = &self.persistence {
            let mut touched = HashSet::new();
            for snapshot in &evicted {
                persistence
                    .delete(&snapshot_key(snapshot.transaction_id, snapshot.id))
                    .await?;
                touched.insert(snapshot.transaction_id);
            }
            for transaction_id in touched {
                self.write_index(transaction_id).await?;
            }
        }

        if !evicted.is_empty() {
            event!(Level::INFO, evicted = evicted.len(), "snapshot garbage collected");
        }
        if retained > self.policy.max_retained {
            event!(
                Level::WARN,
                retained,
                max_retained = self.policy.max_retained,
                "retained snapshots exceed the retention cap after collection"
            );
        }
        Ok(evicted.into_iter().map(|snapshot| snapshot.id).collect())
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let bytes = encode_snapshot(snapshot)?;
        persistence
            .put(&snapshot_key(snapshot.transaction_id, snapshot.id), bytes)
            .await?;
        self.write_index(snapshot.transaction_id).await
    }

    async fn write_index(&self, transaction_id: TransactionId) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let ids: Vec<SnapshotId> = self
            .index
            .read()
            .await
            .by_transaction
            .get(&transaction_id)
            .cloned()
            .unwrap_or_default();
        let key = snapshot_index_key(transaction_id);
        if ids.is_empty() {
            return persistence.delete(&key).await;
        }
        let bytes = serde_json::to_vec(&ids)
            .map_err(|err| TxError::Serialization(format!("encode snapshot index: {}", err)))?;
        persistence.put(&key, bytes).await
    }

    /// Reloads a transaction's persisted snapshots into memory. Each loaded
    /// snapshot has its checksum verified.
    pub async fn load_persisted(&self, transaction_id: TransactionId) -> Result<Vec<Arc<Snapshot>>> {
        let Some(persistence) = &self.persistence else {
            return Ok(Vec::new());
        };
        let Some(index_bytes) = persistence.get(&snapshot_index_key(transaction_id)).await? else {
            return Ok(Vec::new());
        };
        let ids: Vec<SnapshotId> = serde_json::from_slice(&index_bytes)
            .map_err(|err| TxError::Serialization(format!("decode snapshot index: {}", err)))?;

        let mut loaded = Vec::with_capacity(ids.len());
        for snapshot_id in ids {
            let bytes = persistence
                .get(&snapshot_key(transaction_id, snapshot_id))
                .await?
                .ok_or_else(|| TxError::SnapshotNotFound(snapshot_id.to_string()))?;
            let snapshot = decode_snapshot(&bytes)?;
            snapshot.verify_checksum()?;
            loaded.push(Arc::new(snapshot));
        }

        let mut index = self.index.write().await;
        for snapshot in &loaded {
            index.insert(snapshot.clone());
        }
        Ok(loaded)
    }
}

/// Encodes a snapshot record for persistence.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(snapshot)
        .map_err(|err| TxError::Serialization(format!("encode snapshot: {}", err)))
}

/// Decodes a persisted snapshot record.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    rmp_serde::from_slice(bytes)
        .map_err(|err| TxError::Serialization(format!("decode snapshot: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::persistence::InMemoryKeyValueStore;
    use serde_json::json;

    fn items() -> Vec<OperationItem> {
        vec![
            OperationItem::create("a", "doc-a").with_payload(json!({"title": "A"})),
            OperationItem::update("b", "doc-b").with_payload(json!({"title": "B"})),
        ]
    }

    #[tokio::test]
    async fn test_full_capture_restores_exact_items() {
        let store = SnapshotStore::default();
        let txn = TransactionId::new();
        let snapshot = store
            .capture(txn, &items(), CaptureMode::Full, None)
            .await
            .unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(store.restore(&snapshot).await.unwrap(), items());
        store.verify(&snapshot).await.unwrap();
    }

    #[tokio::test]
    async fn test_incremental_without_base_degrades_to_full() {
        let store = SnapshotStore::default();
        let snapshot = store
            .capture(TransactionId::new(), &items(), CaptureMode::Incremental, None)
            .await
            .unwrap();
        assert_eq!(snapshot.mode, CaptureMode::Full);
        assert_eq!(snapshot.base_snapshot_id, None);
    }

    #[tokio::test]
    async fn test_oversized_capture_is_packed_or_rejected() {
        let payload = "x".repeat(64);
        let many: Vec<OperationItem> = (0..20)
            .map(|i| OperationItem::create(format!("i{}", i), "doc").with_payload(json!({"body": payload})))
            .collect();
        let plain = serde_json::to_vec(&full_content(&many)).unwrap().len();

        let store = SnapshotStore::new(SnapshotPolicy {
            max_snapshot_bytes: plain - 1,
            ..SnapshotPolicy::default()
        });
        let snapshot = store
            .capture(TransactionId::new(), &many, CaptureMode::Full, None)
            .await
            .unwrap();
        assert!(snapshot.is_compressed());
        assert_eq!(store.restore(&snapshot).await.unwrap(), many);

        let tiny = SnapshotStore::new(SnapshotPolicy {
            max_snapshot_bytes: 16,
            ..SnapshotPolicy::default()
        });
        let err = tiny
            .capture(TransactionId::new(), &many, CaptureMode::Full, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::SnapshotTooLarge { .. }));
        assert!(tiny.is_empty().await);
    }

    #[tokio::test]
    async fn test_versions_keep_counting_after_eviction() {
        let store = SnapshotStore::default();
        let txn = TransactionId::new();
        store.capture(txn, &items(), CaptureMode::Full, None).await.unwrap();
        store.capture(txn, &items(), CaptureMode::Full, None).await.unwrap();

        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(store.collect_garbage(later).await.unwrap().len(), 2);

        let next = store.capture(txn, &items(), CaptureMode::Full, None).await.unwrap();
        assert_eq!(next.version, 3);
    }

    #[tokio::test]
    async fn test_packed_body_is_stored_as_binary() {
        let many: Vec<OperationItem> = (0..40)
            .map(|i| OperationItem::update(format!("i{}", i), "doc").with_payload(json!({"n": i})))
            .collect();
        let plain = serde_json::to_vec(&full_content(&many)).unwrap().len();
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let store = SnapshotStore::new(SnapshotPolicy {
            max_snapshot_bytes: plain - 1,
            ..SnapshotPolicy::default()
        })
        .with_persistence(kv.clone());
        let txn = TransactionId::new();
        let snapshot = store.capture(txn, &many, CaptureMode::Full, None).await.unwrap();
        assert!(snapshot.is_compressed());

        let record = kv.get(&snapshot_key(txn, snapshot.id)).await.unwrap().unwrap();
        assert!(record.len() < snapshot.size_bytes * 2);
        assert_eq!(decode_snapshot(&record).unwrap(), *snapshot);
    }

    #[tokio::test]
    async fn test_remove_transaction_drops_persisted_records() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let store = SnapshotStore::default().with_persistence(kv.clone());
        let txn = TransactionId::new();
        store.capture(txn, &items(), CaptureMode::Full, None).await.unwrap();

        assert_eq!(store.remove_transaction(txn).await.unwrap(), 1);
        assert!(store.is_empty().await);
        assert_eq!(kv.len().await, 0);
    }

    #[tokio::test]
    async fn test_persisted_snapshots_reload() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let store = SnapshotStore::default().with_persistence(kv.clone());
        let txn = TransactionId::new();
        let snapshot = store
            .capture(txn, &items(), CaptureMode::Full, None)
            .await
            .unwrap();

        let fresh = SnapshotStore::default().with_persistence(kv.clone());
        let loaded = fresh.load_persisted(txn).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, snapshot.id);
        assert_eq!(fresh.get(txn).await.unwrap().item_checksums, snapshot.item_checksums);
    }
}
