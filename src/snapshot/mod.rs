// ============================================================================
// Snapshot Module
// ============================================================================
//
// Versioned, checksummed capture of a transaction's items before execution,
// with full, incremental and differential modes and optional persistence
// through an injected key-value store.
//
// ============================================================================

pub mod capture;
pub mod persistence;
pub mod store;
pub mod types;

pub use persistence::{FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore};
pub use store::{
    SNAPSHOT_INDEX_PREFIX, SNAPSHOT_KEY_PREFIX, SnapshotStore, decode_snapshot, encode_snapshot,
    snapshot_index_key, snapshot_key,
};
pub use types::{
    CaptureMode, DependencySummary, FieldDiff, ItemFieldDiff, Snapshot, SnapshotBody,
    SnapshotContent,
};
