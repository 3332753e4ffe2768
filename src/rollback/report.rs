use super::selector::PartialSelection;
use super::strategy::RollbackStrategyChoice;
use crate::cascade::CascadeReport;
use crate::core::{RollbackStrategy, TransactionId};
use crate::transaction::{TransactionProgress, TransactionStatus};
use serde::{Deserialize, Serialize};

/// What a rollback did and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub transaction_id: TransactionId,
    /// Final status of the transaction.
    pub status: TransactionStatus,
    /// What triggered the rollback.
    pub reason: String,
    pub choice: RollbackStrategyChoice,
    /// Strategy actually run. Differs from `choice.strategy` when a partial
    /// selection was rejected and the rollback fell back to immediate.
    pub executed: RollbackStrategy,
    pub selection: Option<PartialSelection>,
    pub selection_error: Option<String>,
    /// Items undone through recorded inverse operations, in replay order.
    pub undone_items: Vec<String>,
    /// Items undone through derived compensations, in replay order.
    pub compensated_items: Vec<String>,
    /// Items written back from the snapshot.
    pub restored_items: Vec<String>,
    pub cascade: Option<CascadeReport>,
    pub progress: TransactionProgress,
    /// Forward item failures recorded before the rollback.
    pub item_errors: Vec<String>,
}
