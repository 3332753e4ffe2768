use crate::core::{OperationItem, Result, TransactionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Why the executor is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Applying the caller's item.
    Forward,
    /// Replaying an inverse recorded during the forward pass.
    Inverse,
    /// Running a semantic compensation derived from the item.
    Compensation,
    /// Restoring items from their snapshot.
    Restore,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionPhase::Forward => "forward",
            ExecutionPhase::Inverse => "inverse",
            ExecutionPhase::Compensation => "compensation",
            ExecutionPhase::Restore => "restore",
        };
        f.write_str(label)
    }
}

/// Context handed to the executor with every call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionContext {
    pub transaction_id: TransactionId,
    /// Type tag the caller gave the transaction.
    pub kind: String,
    pub phase: ExecutionPhase,
    /// Position of the item in the forward order, when the call is for one.
    pub item_index: Option<usize>,
    pub total_items: usize,
}

impl TransactionContext {
    pub(crate) fn new(
        transaction_id: TransactionId,
        kind: impl Into<String>,
        phase: ExecutionPhase,
        total_items: usize,
    ) -> Self {
        Self {
            transaction_id,
            kind: kind.into(),
            phase,
            item_index: None,
            total_items,
        }
    }

    pub(crate) fn at(&self, phase: ExecutionPhase, item_index: Option<usize>) -> Self {
        Self {
            phase,
            item_index,
            ..self.clone()
        }
    }
}

/// Result of applying one item.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionOutput {
    pub result: serde_json::Value,
    /// Operation that undoes this item, when the executor can provide one.
    pub inverse: Option<OperationItem>,
}

impl ExecutionOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            inverse: None,
        }
    }

    pub fn with_inverse(mut self, inverse: OperationItem) -> Self {
        self.inverse = Some(inverse);
        self
    }
}

/// Performs item mutations on behalf of the coordinator.
///
/// `execute` is called once per forward item and once per inverse or
/// compensation during rollback. A returned error counts as a failure of
/// that call.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        item: &OperationItem,
        ctx: &TransactionContext,
    ) -> Result<ExecutionOutput>;

    /// Writes the snapshot state of `items` back to their targets.
    async fn restore(&self, _items: &[OperationItem], _ctx: &TransactionContext) -> Result<()> {
        Ok(())
    }
}
