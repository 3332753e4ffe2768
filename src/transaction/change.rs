// ============================================================================
// Inverse Operations
// ============================================================================
//
// Command Pattern for reversible batch items. The executor hands back an
// inverse for every item it can undo literally; the coordinator replays the
// recorded inverses most-recent-first during rollback.
//
// ============================================================================

use crate::core::OperationItem;
use serde::{Deserialize, Serialize};

/// Undo command recorded for one successfully executed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOperation {
    /// Item this inverse undoes.
    pub item_id: String,
    /// Position in the recording order; rollback walks it backwards.
    pub sequence: usize,
    pub operation: OperationItem,
}

impl InverseOperation {
    pub fn target(&self) -> &str {
        &self.operation.target
    }
}

/// Orders `operations` for replay: most recent first.
pub fn replay_order(operations: &[InverseOperation]) -> Vec<&InverseOperation> {
    let mut ordered: Vec<&InverseOperation> = operations.iter().collect();
    ordered.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_order_is_reverse_of_recording() {
        let operations: Vec<InverseOperation> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(sequence, id)| InverseOperation {
                item_id: id.to_string(),
                sequence,
                operation: OperationItem::delete(format!("{}:inverse", id), format!("doc-{}", id)),
            })
            .collect();

        let order: Vec<&str> = replay_order(&operations)
            .iter()
            .map(|op| op.item_id.as_str())
            .collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(operations[0].target(), "doc-a");
    }
}
