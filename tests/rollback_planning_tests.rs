use batchtx::core::{SelectionPolicy, StrategyPolicy};
use batchtx::rollback::{
    CompensationPlanner, PartialRollbackSelector, ProcessedItem, RollbackStrategyEngine,
    StrategyContext,
};
use batchtx::{OperationItem, RiskLevel, RollbackStrategy, TxError, Urgency};
use serde_json::json;

fn overloaded_single_failure() -> StrategyContext {
    StrategyContext {
        processed_items: 1,
        failed_items: 1,
        active_transactions: 100,
        ..StrategyContext::default()
    }
}

#[test]
fn test_only_valid_strategy_wins() {
    let engine = RollbackStrategyEngine::default();
    let choice = engine.choose(&overloaded_single_failure());

    assert_eq!(choice.strategy, RollbackStrategy::Compensating);
    assert!(!choice.fallback);
    let rejected: Vec<RollbackStrategy> = choice
        .candidates
        .iter()
        .filter(|candidate| !candidate.valid)
        .map(|candidate| candidate.strategy)
        .collect();
    assert_eq!(
        rejected,
        vec![
            RollbackStrategy::Immediate,
            RollbackStrategy::Partial,
            RollbackStrategy::Cascade
        ]
    );
    assert!(choice.rationale.contains("immediate rejected"));
}

#[test]
fn test_nothing_valid_uses_configured_default() {
    let engine = RollbackStrategyEngine::new(StrategyPolicy {
        default_strategy: RollbackStrategy::Partial,
        ..StrategyPolicy::default()
    });
    let ctx = StrategyContext {
        processed_items: 600,
        succeeded_items: 600,
        compensable_items: 10,
        ..StrategyContext::default()
    };

    let choice = engine.choose(&ctx);
    assert!(choice.fallback);
    assert_eq!(choice.strategy, RollbackStrategy::Partial);
    assert!(choice.rationale.starts_with("no strategy validated"));
    assert!(choice.candidates.iter().all(|candidate| !candidate.valid));
}

#[test]
fn test_dependents_make_cascade_a_candidate() {
    let engine = RollbackStrategyEngine::default();
    let ctx = StrategyContext {
        processed_items: 4,
        succeeded_items: 3,
        failed_items: 1,
        compensable_items: 3,
        dependent_transactions: 2,
        active_transactions: 3,
        urgency: Urgency::High,
        ..StrategyContext::default()
    };

    let choice = engine.choose(&ctx);
    let cascade = choice
        .candidates
        .iter()
        .find(|candidate| candidate.strategy == RollbackStrategy::Cascade)
        .unwrap();
    assert!(cascade.valid);
    assert_eq!(engine.choose(&ctx), choice);

    let forced = engine.forced(RollbackStrategy::Immediate, &ctx);
    assert!(forced.forced);
    assert!(forced.candidates.is_empty());
}

#[test]
fn test_explicit_risk_overrides_assessment() {
    let ctx = StrategyContext {
        risk: Some(RiskLevel::Critical),
        ..overloaded_single_failure()
    };
    let choice = RollbackStrategyEngine::default().choose(&ctx);
    assert_eq!(choice.risk, RiskLevel::Critical);
}

fn batch() -> Vec<ProcessedItem> {
    vec![
        ProcessedItem::new(OperationItem::create("i0", "doc-0"), false),
        ProcessedItem::new(OperationItem::create("i1", "doc-1"), false),
        ProcessedItem::new(OperationItem::update("i2", "doc-2"), false),
        ProcessedItem::new(OperationItem::update("i3", "doc-3"), true),
        ProcessedItem::new(OperationItem::update("i4", "doc-4").with_dependency("i3"), false),
        ProcessedItem::new(OperationItem::update("i5", "doc-5").with_dependency("i4"), false),
        ProcessedItem::new(OperationItem::create("i6", "doc-6"), false),
        ProcessedItem::new(OperationItem::create("i7", "doc-7"), false),
        ProcessedItem::new(OperationItem::create("i8", "doc-8"), false),
        ProcessedItem::new(OperationItem::create("i9", "doc-9"), false),
    ]
}

#[test]
fn test_selection_follows_failures_and_their_dependents() {
    let selector = PartialRollbackSelector::default();
    let selection = selector.select(&batch()).unwrap();

    assert_eq!(selection.limit, 5);
    assert!(selection.items.len() <= selection.limit);
    for id in ["i3", "i4", "i5"] {
        assert!(selection.contains(id), "{id} should be selected");
    }
    assert_eq!(selection.items[0], "i4");
    assert_eq!(selection.padded, 0);
    assert_eq!(selection.heuristics.len(), 5);
}

#[test]
fn test_selection_bounds_are_enforced() {
    let strict = PartialRollbackSelector::new(SelectionPolicy {
        min_selection_count: 3,
        ..SelectionPolicy::default()
    });
    let small: Vec<ProcessedItem> = batch().into_iter().take(4).collect();
    assert!(matches!(strict.select(&small), Err(TxError::Validation(_))));

    let capped = PartialRollbackSelector::new(SelectionPolicy {
        max_absolute_selection: 1,
        ..SelectionPolicy::default()
    });
    let selection = capped.select(&batch()).unwrap();
    assert_eq!(selection.items, vec!["i4"]);
}

#[test]
fn test_compensation_requires_prior_state() {
    let planner = CompensationPlanner::new();
    let restorable = vec![
        OperationItem::create("a", "doc-a"),
        OperationItem::delete("b", "doc-b").with_payload(json!({"previous": {"title": "B"}})),
    ];
    let plan = planner.plan_all(&restorable).unwrap();
    assert_eq!(plan[0].target, "doc-b");
    assert_eq!(plan[0].payload, json!({"title": "B"}));
    assert_eq!(plan[1].id, "a:compensate");

    let lossy = vec![OperationItem::delete("c", "doc-c")];
    assert!(!planner.is_compensable(&lossy[0]));
    assert!(planner.plan_all(&lossy).is_err());
}
