// ============================================================================
// Transaction State Management
// ============================================================================
//
// Lifecycle of one batch transaction:
//
// ```text
// PENDING ──begin──> RUNNING ──> COMMITTED
//                       │──────> ROLLED_BACK
//                       │──────> FAILED
//                       └──────> TIMEOUT
// ```
//
// Status only moves forward; a terminal status is final.
//
// ============================================================================

use super::change::InverseOperation;
use super::options::TransactionOptions;
use crate::core::{OperationItem, Result, SnapshotId, TransactionId, TxError};
use crate::lock::LockGrant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, locks and snapshot not yet in place
    Pending,

    /// Locked, snapshotted and accepting execution
    Running,

    Committed,

    /// Undone after an operation failure or an abort
    RolledBack,

    /// The rollback itself failed; needs manual attention
    Failed,

    /// Deadline reached while running; rolled back
    TimedOut,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::Failed
                | TransactionStatus::TimedOut
        )
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        match self {
            TransactionStatus::Pending => matches!(next, TransactionStatus::Running),
            TransactionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Running => write!(f, "RUNNING"),
            TransactionStatus::Committed => write!(f, "COMMITTED"),
            TransactionStatus::RolledBack => write!(f, "ROLLED_BACK"),
            TransactionStatus::Failed => write!(f, "FAILED"),
            TransactionStatus::TimedOut => write!(f, "TIMEOUT"),
        }
    }
}

/// Item counters of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TransactionProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 / self.total as f64 * 100.0
    }

    /// Succeeded items over all items of the transaction.
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.processed == self.total
    }
}

/// Result of executing one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded {
        item_id: String,
        result: serde_json::Value,
    },
    Failed {
        item_id: String,
        message: String,
    },
}

impl ItemOutcome {
    pub fn item_id(&self) -> &str {
        match self {
            ItemOutcome::Succeeded { item_id, .. } => item_id,
            ItemOutcome::Failed { item_id, .. } => item_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded { .. })
    }
}

/// A batch transaction owned by the coordinator.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    kind: String,
    status: TransactionStatus,
    items: Vec<OperationItem>,
    options: TransactionOptions,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    timeout: Duration,
    progress: TransactionProgress,
    lock_grants: Vec<LockGrant>,
    inverse_operations: Vec<InverseOperation>,
    outcomes: Vec<ItemOutcome>,
    snapshot_id: Option<SnapshotId>,
    abort_reason: Option<String>,
    compensated_by: Option<TransactionId>,
}

impl Transaction {
    pub fn new(
        id: TransactionId,
        kind: impl Into<String>,
        items: Vec<OperationItem>,
        options: TransactionOptions,
        timeout: Duration,
    ) -> Self {
        let progress = TransactionProgress {
            total: items.len(),
            ..TransactionProgress::default()
        };
        Self {
            id,
            kind: kind.into(),
            status: TransactionStatus::Pending,
            items,
            options,
            started_at: Utc::now(),
            ended_at: None,
            timeout,
            progress,
            lock_grants: Vec::new(),
            inverse_operations: Vec::new(),
            outcomes: Vec::new(),
            snapshot_id: None,
            abort_reason: None,
            compensated_by: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn items(&self) -> &[OperationItem] {
        &self.items
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn progress(&self) -> TransactionProgress {
        self.progress
    }

    pub fn lock_grants(&self) -> &[LockGrant] {
        &self.lock_grants
    }

    pub fn inverse_operations(&self) -> &[InverseOperation] {
        &self.inverse_operations
    }

    pub fn outcomes(&self) -> &[ItemOutcome] {
        &self.outcomes
    }

    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.snapshot_id
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn compensated_by(&self) -> Option<TransactionId> {
        self.compensated_by
    }

    pub fn depends_on(&self) -> &[TransactionId] {
        &self.options.depends_on
    }

    /// Items processed so far, in execution order.
    pub fn processed_items(&self) -> &[OperationItem] {
        &self.items[..self.progress.processed.min(self.items.len())]
    }

    pub fn failed_item_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .map(|outcome| outcome.item_id().to_string())
            .collect()
    }

    pub fn succeeded_item_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .map(|outcome| outcome.item_id().to_string())
            .collect()
    }

    pub(crate) fn attach_snapshot(&mut self, snapshot_id: SnapshotId) {
        self.snapshot_id = Some(snapshot_id);
    }

    pub(crate) fn attach_locks(&mut self, grants: Vec<LockGrant>) {
        self.lock_grants = grants;
    }

    pub(crate) fn set_abort_reason(&mut self, reason: impl Into<String>) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason.into());
        }
    }

    pub(crate) fn mark_compensated(&mut self, by: TransactionId) {
        self.compensated_by = Some(by);
    }

    /// Moves the transaction to `next`.
    ///
    /// # Errors
    /// Returns a validation error for a backward or repeated transition.
    pub fn transition(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TxError::Validation(format!(
                "transaction {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records a successful item and the inverse the executor returned.
    ///
    /// # Errors
    /// Returns an error if the transaction is not running.
    pub fn record_success(
        &mut self,
        item_id: &str,
        result: serde_json::Value,
        inverse: Option<OperationItem>,
    ) -> Result<()> {
        self.ensure_running("record an item result")?;
        self.progress.processed += 1;
        self.progress.succeeded += 1;
        if let Some(operation) = inverse {
            let sequence = self.inverse_operations.len();
            self.inverse_operations.push(InverseOperation {
                item_id: item_id.to_string(),
                sequence,
                operation,
            });
        }
        self.outcomes.push(ItemOutcome::Succeeded {
            item_id: item_id.to_string(),
            result,
        });
        Ok(())
    }

    /// Records a failed item.
    ///
    /// # Errors
    /// Returns an error if the transaction is not running.
    pub fn record_failure(&mut self, item_id: &str, message: impl Into<String>) -> Result<()> {
        self.ensure_running("record an item failure")?;
        self.progress.processed += 1;
        self.progress.failed += 1;
        self.outcomes.push(ItemOutcome::Failed {
            item_id: item_id.to_string(),
            message: message.into(),
        });
        Ok(())
    }

    fn ensure_running(&self, action: &str) -> Result<()> {
        if self.status != TransactionStatus::Running {
            return Err(TxError::ExecutionError(format!(
                "Cannot {}: transaction {} is {}",
                action, self.id, self.status
            )));
        }
        Ok(())
    }

    /// Read-only summary of the transaction.
    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            kind: self.kind.clone(),
            status: self.status,
            progress: self.progress,
            started_at: self.started_at,
            ended_at: self.ended_at,
            timeout_ms: self.timeout.as_millis() as u64,
            locked_resources: self
                .lock_grants
                .iter()
                .map(|grant| grant.resource.clone())
                .collect(),
            inverse_operations: self.inverse_operations.len(),
            snapshot_id: self.snapshot_id,
            depends_on: self.options.depends_on.clone(),
            abort_reason: self.abort_reason.clone(),
            compensated_by: self.compensated_by,
            errors: self
                .outcomes
                .iter()
                .filter_map(|outcome| match outcome {
                    ItemOutcome::Failed { item_id, message } => {
                        Some(format!("{}: {}", item_id, message))
                    }
                    ItemOutcome::Succeeded { .. } => None,
                })
                .collect(),
        }
    }
}

/// Snapshot of a transaction's state for callers and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub kind: String,
    pub status: TransactionStatus,
    pub progress: TransactionProgress,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub locked_resources: Vec<String>,
    pub inverse_operations: usize,
    pub snapshot_id: Option<SnapshotId>,
    pub depends_on: Vec<TransactionId>,
    pub abort_reason: Option<String>,
    /// Set when a committed transaction was undone by a cascade from this root.
    pub compensated_by: Option<TransactionId>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction() -> Transaction {
        Transaction::new(
            TransactionId::new(),
            "import",
            vec![
                OperationItem::create("a", "doc-a"),
                OperationItem::create("b", "doc-b"),
            ],
            TransactionOptions::default(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut txn = transaction();
        assert_eq!(txn.status(), TransactionStatus::Pending);
        assert!(!txn.status().is_terminal());

        txn.transition(TransactionStatus::Running).unwrap();
        txn.record_success("a", serde_json::Value::Null, None).unwrap();
        txn.transition(TransactionStatus::Committed).unwrap();
        assert!(txn.status().is_terminal());
        assert!(txn.info().ended_at.is_some());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut txn = transaction();
        assert!(txn.transition(TransactionStatus::Committed).is_err());
        txn.transition(TransactionStatus::Running).unwrap();
        assert!(txn.transition(TransactionStatus::Pending).is_err());
        txn.transition(TransactionStatus::RolledBack).unwrap();
        for next in [
            TransactionStatus::Running,
            TransactionStatus::Committed,
            TransactionStatus::Failed,
            TransactionStatus::RolledBack,
        ] {
            assert!(txn.transition(next).is_err());
        }
    }

    #[test]
    fn test_cannot_record_after_terminal() {
        let mut txn = transaction();
        assert!(txn.record_failure("a", "boom").is_err());
        txn.transition(TransactionStatus::Running).unwrap();
        txn.record_failure("a", "boom").unwrap();
        txn.transition(TransactionStatus::RolledBack).unwrap();
        assert!(txn.record_success("b", serde_json::Value::Null, None).is_err());
        assert_eq!(txn.failed_item_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_inverse_operations_keep_sequence() {
        let mut txn = transaction();
        txn.transition(TransactionStatus::Running).unwrap();
        txn.record_success("a", serde_json::Value::Null, Some(OperationItem::delete("a:inv", "doc-a")))
            .unwrap();
        txn.record_success("b", serde_json::Value::Null, Some(OperationItem::delete("b:inv", "doc-b")))
            .unwrap();
        let sequences: Vec<usize> = txn.inverse_operations().iter().map(|op| op.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(txn.progress().success_ratio(), 1.0);
    }
}
