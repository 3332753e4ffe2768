use crate::core::{OperationItem, Result, SnapshotId, TransactionId, TxError, checksum_of};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a snapshot records its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Deep copy of every item.
    Full,
    /// Items added, modified or removed relative to a base snapshot.
    Incremental,
    /// Field-level changes relative to a reference snapshot.
    Differential,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::Full => write!(f, "full"),
            CaptureMode::Incremental => write!(f, "incremental"),
            CaptureMode::Differential => write!(f, "differential"),
        }
    }
}

/// One changed field inside an item, addressed by its JSON path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub path: Vec<String>,
    /// Value in the reference snapshot; `None` when the field was added.
    pub before: Option<serde_json::Value>,
    /// Value at capture time; `None` when the field was removed.
    pub after: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFieldDiff {
    pub item_id: String,
    pub changes: Vec<FieldDiff>,
}

/// Captured item data, shaped by the capture mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotContent {
    Full {
        items: Vec<OperationItem>,
    },
    Incremental {
        /// Item ids in their captured order.
        order: Vec<String>,
        added: Vec<OperationItem>,
        modified: Vec<OperationItem>,
        removed: Vec<String>,
    },
    Differential {
        order: Vec<String>,
        added: Vec<OperationItem>,
        removed: Vec<String>,
        diffs: Vec<ItemFieldDiff>,
    },
}

impl SnapshotContent {
    pub fn mode(&self) -> CaptureMode {
        match self {
            SnapshotContent::Full { .. } => CaptureMode::Full,
            SnapshotContent::Incremental { .. } => CaptureMode::Incremental,
            SnapshotContent::Differential { .. } => CaptureMode::Differential,
        }
    }

    /// Number of items in the resolved state this content describes.
    pub fn item_count(&self) -> usize {
        match self {
            SnapshotContent::Full { items } => items.len(),
            SnapshotContent::Incremental { order, .. } => order.len(),
            SnapshotContent::Differential { order, .. } => order.len(),
        }
    }
}

/// Stored form of the content. Oversized content is packed with MessagePack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum SnapshotBody {
    Plain(SnapshotContent),
    Packed(#[serde(with = "packed_bytes")] Vec<u8>),
}

/// Packed bodies go through `serialize_bytes`, so MessagePack stores them as
/// one binary value rather than an array of integers.
mod packed_bytes {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("packed snapshot bytes")
        }

        fn visit_bytes<E: Error>(self, bytes: &[u8]) -> Result<Self::Value, E> {
            Ok(bytes.to_vec())
        }

        fn visit_byte_buf<E: Error>(self, bytes: Vec<u8>) -> Result<Self::Value, E> {
            Ok(bytes)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or_default());
            while let Some(byte) = seq.next_element::<u8>()? {
                bytes.push(byte);
            }
            Ok(bytes)
        }
    }
}

/// Which items depend on which, as declared at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencySummary {
    /// Item id to the ids it depends on, for items with dependencies.
    pub edges: BTreeMap<String, Vec<String>>,
    /// Dependency ids that do not name an item of the set.
    pub external: Vec<String>,
}

impl DependencySummary {
    pub fn dependent_items(&self) -> usize {
        self.edges.len()
    }
}

/// Versioned, checksummed pre-execution state of one transaction's items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub transaction_id: TransactionId,
    /// Sequence of this snapshot among the transaction's snapshots, from 1.
    pub version: u32,
    pub mode: CaptureMode,
    pub created_at: DateTime<Utc>,
    pub base_snapshot_id: Option<SnapshotId>,
    pub body: SnapshotBody,
    /// Checksum of every item of the resolved state, keyed by item id.
    pub item_checksums: BTreeMap<String, u64>,
    pub dependencies: DependencySummary,
    /// Hash of the captured content.
    pub checksum: u64,
    /// Stored size of the body in bytes.
    pub size_bytes: usize,
    pub item_count: usize,
}

impl Snapshot {
    pub fn is_compressed(&self) -> bool {
        matches!(self.body, SnapshotBody::Packed(_))
    }

    /// Captured content, unpacked when stored compressed.
    pub fn content(&self) -> Result<SnapshotContent> {
        match &self.body {
            SnapshotBody::Plain(content) => Ok(content.clone()),
            SnapshotBody::Packed(bytes) => rmp_serde::from_slice(bytes).map_err(|err| {
                TxError::Serialization(format!("unpack snapshot {}: {}", self.id, err))
            }),
        }
    }

    /// Recomputes the content hash and compares it with the stored one.
    pub fn verify_checksum(&self) -> Result<()> {
        let actual = checksum_of(&self.content()?)?;
        if actual != self.checksum {
            return Err(TxError::ChecksumMismatch {
                snapshot_id: self.id.to_string(),
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds()
    }
}
