use super::state::TransactionProgress;
use crate::core::TransactionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stage a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    /// One forward item was processed.
    Executing,
    /// Inverse or compensation operations started.
    RollingBack,
    /// Snapshot restoration started.
    Restoring,
    /// Dependent transactions are being rolled back.
    Cascading,
    /// Rollback finished.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub transaction_id: TransactionId,
    pub phase: ProgressPhase,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Item the event is about; set for `Executing` events.
    pub item_id: Option<String>,
    pub percentage: f64,
}

impl ProgressEvent {
    pub(crate) fn new(
        transaction_id: TransactionId,
        phase: ProgressPhase,
        progress: TransactionProgress,
        item_id: Option<String>,
    ) -> Self {
        Self {
            transaction_id,
            phase,
            total: progress.total,
            processed: progress.processed,
            succeeded: progress.succeeded,
            failed: progress.failed,
            item_id,
            percentage: progress.percentage(),
        }
    }
}

/// Caller-supplied progress observer.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

pub(crate) fn emit(callback: Option<&ProgressCallback>, event: ProgressEvent) {
    if let Some(callback) = callback {
        callback(&event);
    }
}
