// Semantic inverses for items that have no recorded undo.
//
//   create -> delete of the same target
//   delete -> create carrying the `previous` payload
//   update -> update back to the `previous` payload
//   move   -> move back to the `from` location

use crate::core::{OperationItem, OperationType, Result, TxError};
use serde_json::json;

pub const COMPENSATION_SUFFIX: &str = ":compensate";

#[derive(Debug, Clone, Copy, Default)]
pub struct CompensationPlanner;

impl CompensationPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn is_compensable(&self, item: &OperationItem) -> bool {
        self.plan(item).is_some()
    }

    /// Compensating item for `item`, or `None` when the payload lacks the
    /// state needed to reverse it.
    pub fn plan(&self, item: &OperationItem) -> Option<OperationItem> {
        let id = format!("{}{}", item.id, COMPENSATION_SUFFIX);
        match item.operation {
            OperationType::Create => Some(
                OperationItem::delete(id, item.target.clone())
                    .with_payload(json!({ "compensates": item.id })),
            ),
            OperationType::Delete => item.previous_state().map(|previous| {
                OperationItem::create(id, item.target.clone()).with_payload(previous.clone())
            }),
            OperationType::Update => item.previous_state().map(|previous| {
                OperationItem::update(id, item.target.clone()).with_payload(json!({
                    "compensates": item.id,
                    "value": previous,
                }))
            }),
            OperationType::Move => item.move_origin().map(|origin| {
                OperationItem::moved(id, origin.to_string()).with_payload(json!({
                    "compensates": item.id,
                    "from": item.target,
                }))
            }),
        }
    }

    /// Compensations for `items`, most recent first.
    ///
    /// # Errors
    /// Fails on the first item that cannot be compensated.
    pub fn plan_all(&self, items: &[OperationItem]) -> Result<Vec<OperationItem>> {
        items
            .iter()
            .rev()
            .map(|item| {
                self.plan(item).ok_or_else(|| {
                    TxError::Validation(format!(
                        "item '{}' ({}) has no semantic inverse",
                        item.id, item.operation
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_compensates_with_delete() {
        let planner = CompensationPlanner::new();
        let plan = planner.plan(&OperationItem::create("a", "doc-a")).unwrap();
        assert_eq!(plan.operation, OperationType::Delete);
        assert_eq!(plan.target, "doc-a");
        assert_eq!(plan.id, "a:compensate");
    }

    #[test]
    fn test_delete_needs_previous_state() {
        let planner = CompensationPlanner::new();
        assert!(!planner.is_compensable(&OperationItem::delete("d", "doc-d")));

        let item = OperationItem::delete("d", "doc-d")
            .with_payload(json!({"previous": {"title": "kept"}}));
        let plan = planner.plan(&item).unwrap();
        assert_eq!(plan.operation, OperationType::Create);
        assert_eq!(plan.payload, json!({"title": "kept"}));
    }

    #[test]
    fn test_move_goes_back_to_origin() {
        let planner = CompensationPlanner::new();
        let item = OperationItem::moved("m", "folder-b/doc").with_payload(json!({"from": "folder-a/doc"}));
        let plan = planner.plan(&item).unwrap();
        assert_eq!(plan.target, "folder-a/doc");
        assert_eq!(plan.payload["from"], json!("folder-b/doc"));
    }

    #[test]
    fn test_plan_all_reverses_order() {
        let planner = CompensationPlanner::new();
        let items = vec![
            OperationItem::create("a", "doc-a"),
            OperationItem::create("b", "doc-b"),
        ];
        let plans = planner.plan_all(&items).unwrap();
        assert_eq!(plans[0].id, "b:compensate");
        assert_eq!(plans[1].id, "a:compensate");

        let mut with_gap = items.clone();
        with_gap.push(OperationItem::update("u", "doc-u"));
        assert!(planner.plan_all(&with_gap).is_err());
    }
}
