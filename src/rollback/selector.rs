// ============================================================================
// Partial-Rollback Selector
// ============================================================================
//
// Independent heuristics each propose a subset of the processed items with a
// confidence. Every item accumulates weight * confidence over the heuristics
// that chose it; the ranked top-K is the selection, where
//
//   K = min(floor(max_selection_ratio * total), max_absolute_selection)
//
// and the result holds at least min_selection_count items whenever
// total >= min_selection_count.
//
// ============================================================================

use crate::core::{HeuristicWeights, OperationItem, Result, SelectionPolicy, TxError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// An item that went through the forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedItem {
    pub item: OperationItem,
    pub failed: bool,
}

impl ProcessedItem {
    pub fn new(item: OperationItem, failed: bool) -> Self {
        Self { item, failed }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionHeuristic {
    ByFailure,
    ByPriority,
    ByDependency,
    ByImpact,
    ByRisk,
}

impl SelectionHeuristic {
    pub const ALL: [SelectionHeuristic; 5] = [
        SelectionHeuristic::ByFailure,
        SelectionHeuristic::ByPriority,
        SelectionHeuristic::ByDependency,
        SelectionHeuristic::ByImpact,
        SelectionHeuristic::ByRisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionHeuristic::ByFailure => "by_failure",
            SelectionHeuristic::ByPriority => "by_priority",
            SelectionHeuristic::ByDependency => "by_dependency",
            SelectionHeuristic::ByImpact => "by_impact",
            SelectionHeuristic::ByRisk => "by_risk",
        }
    }

    pub fn weight(&self, weights: &HeuristicWeights) -> f64 {
        match self {
            SelectionHeuristic::ByFailure => weights.failure,
            SelectionHeuristic::ByPriority => weights.priority,
            SelectionHeuristic::ByDependency => weights.dependency,
            SelectionHeuristic::ByImpact => weights.impact,
            SelectionHeuristic::ByRisk => weights.risk,
        }
    }

    fn confidence(&self) -> f64 {
        match self {
            SelectionHeuristic::ByFailure => 0.9,
            SelectionHeuristic::ByPriority => 0.6,
            SelectionHeuristic::ByDependency => 0.85,
            SelectionHeuristic::ByImpact => 0.7,
            SelectionHeuristic::ByRisk => 0.5,
        }
    }

    /// Indices into `processed` this heuristic selects.
    fn select(&self, processed: &[ProcessedItem], policy: &SelectionPolicy) -> Vec<usize> {
        match self {
            SelectionHeuristic::ByFailure => {
                // Failed items plus items sharing a target or a direct
                // dependency edge with one of them.
                let failed: Vec<&OperationItem> = processed
                    .iter()
                    .filter(|p| p.failed)
                    .map(|p| &p.item)
                    .collect();
                let targets: HashSet<&str> = failed.iter().map(|i| i.target.as_str()).collect();
                let ids: HashSet<&str> = failed.iter().map(|i| i.id.as_str()).collect();
                processed
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.failed
                            || targets.contains(p.item.target.as_str())
                            || p.item.dependencies.iter().any(|d| ids.contains(d.as_str()))
                            || failed
                                .iter()
                                .any(|f| f.dependencies.iter().any(|d| d == &p.item.id))
                    })
                    .map(|(index, _)| index)
                    .collect()
            }
            SelectionHeuristic::ByPriority => processed
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    p.item
                        .priority()
                        .is_some_and(|priority| priority >= policy.high_priority_threshold)
                })
                .map(|(index, _)| index)
                .collect(),
            SelectionHeuristic::ByDependency => {
                // Transitive dependents of failed items.
                let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
                for (index, p) in processed.iter().enumerate() {
                    for dependency in &p.item.dependencies {
                        dependents.entry(dependency.as_str()).or_default().push(index);
                    }
                }
                let mut queue: VecDeque<&str> = processed
                    .iter()
                    .filter(|p| p.failed)
                    .map(|p| p.item.id.as_str())
                    .collect();
                let mut seen: HashSet<usize> = HashSet::new();
                while let Some(id) = queue.pop_front() {
                    for index in dependents.get(id).into_iter().flatten() {
                        if seen.insert(*index) {
                            queue.push_back(processed[*index].item.id.as_str());
                        }
                    }
                }
                let mut selected: Vec<usize> = seen.into_iter().collect();
                selected.sort_unstable();
                selected
            }
            SelectionHeuristic::ByImpact => {
                let mut dependent_counts: HashMap<&str, usize> = HashMap::new();
                for p in processed {
                    for dependency in &p.item.dependencies {
                        *dependent_counts.entry(dependency.as_str()).or_default() += 1;
                    }
                }
                processed
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.item.operation.is_destructive()
                            || dependent_counts
                                .get(p.item.id.as_str())
                                .is_some_and(|count| *count >= 2)
                    })
                    .map(|(index, _)| index)
                    .collect()
            }
            SelectionHeuristic::ByRisk => processed
                .iter()
                .enumerate()
                .filter(|(_, p)| p.item.operation.risk_weight() > 0.5)
                .map(|(index, _)| index)
                .collect(),
        }
    }
}

/// What one heuristic proposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicResult {
    pub heuristic: SelectionHeuristic,
    pub selected: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSelection {
    /// Selected item ids, highest score first.
    pub items: Vec<String>,
    /// Accumulated score per selected item, same order as `items`.
    pub scores: Vec<f64>,
    pub heuristics: Vec<HeuristicResult>,
    /// Upper bound K that applied.
    pub limit: usize,
    /// Items added only to reach the minimum count.
    pub padded: usize,
}

impl PartialSelection {
    pub fn contains(&self, item_id: &str) -> bool {
        self.items.iter().any(|id| id == item_id)
    }
}

pub struct PartialRollbackSelector {
    policy: SelectionPolicy,
}

impl Default for PartialRollbackSelector {
    fn default() -> Self {
        Self::new(SelectionPolicy::default())
    }
}

impl PartialRollbackSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Upper bound on the selection size for `total` items.
    pub fn limit_for(&self, total: usize) -> usize {
        let by_ratio = (self.policy.max_selection_ratio * total as f64).floor() as usize;
        by_ratio.min(self.policy.max_absolute_selection)
    }

    /// Selects the items to roll back.
    ///
    /// # Errors
    /// Returns a validation error when the bounds cannot hold the minimum
    /// count or when nothing would be selected.
    pub fn select(&self, processed: &[ProcessedItem]) -> Result<PartialSelection> {
        let total = processed.len();
        let limit = self.limit_for(total);
        let minimum = self.policy.min_selection_count;

        if total >= minimum && limit < minimum {
            return Err(TxError::Validation(format!(
                "selection limit {} for {} items is below the minimum of {}",
                limit, total, minimum
            )));
        }

        let mut scores = vec![0.0_f64; total];
        let mut heuristics = Vec::with_capacity(SelectionHeuristic::ALL.len());
        for heuristic in SelectionHeuristic::ALL {
            let selected = heuristic.select(processed, &self.policy);
            let contribution = heuristic.weight(&self.policy.weights) * heuristic.confidence();
            for index in &selected {
                scores[*index] += contribution;
            }
            heuristics.push(HeuristicResult {
                heuristic,
                selected: selected
                    .iter()
                    .map(|index| processed[*index].item.id.clone())
                    .collect(),
                confidence: heuristic.confidence(),
            });
        }

        let mut ranked: Vec<usize> = (0..total).filter(|index| scores[*index] > 0.0).collect();
        ranked.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]).then(a.cmp(b)));
        ranked.truncate(limit);

        // Pad with the most recently processed items up to the minimum.
        let mut padded = 0;
        if total >= minimum && ranked.len() < minimum {
            let chosen: HashSet<usize> = ranked.iter().copied().collect();
            for index in (0..total).rev() {
                if ranked.len() >= minimum {
                    break;
                }
                if !chosen.contains(&index) {
                    ranked.push(index);
                    padded += 1;
                }
            }
        }

        if ranked.is_empty() {
            return Err(TxError::Validation(
                "partial rollback selected no items".to_string(),
            ));
        }

        Ok(PartialSelection {
            items: ranked
                .iter()
                .map(|index| processed[*index].item.id.clone())
                .collect(),
            scores: ranked.iter().map(|index| scores[*index]).collect(),
            heuristics,
            limit,
            padded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processed() -> Vec<ProcessedItem> {
        vec![
            ProcessedItem::new(OperationItem::create("a", "doc-a"), false),
            ProcessedItem::new(OperationItem::update("b", "doc-b"), true),
            ProcessedItem::new(OperationItem::update("c", "doc-c").with_dependency("b"), false),
            ProcessedItem::new(OperationItem::create("d", "doc-d").with_dependency("c"), false),
            ProcessedItem::new(
                OperationItem::create("e", "doc-e").with_payload(json!({"priority": 9})),
                false,
            ),
            ProcessedItem::new(OperationItem::create("f", "doc-f"), false),
        ]
    }

    #[test]
    fn test_merge_ranks_by_accumulated_score() {
        let selector = PartialRollbackSelector::default();
        let selection = selector.select(&processed()).unwrap();
        // c is picked by both the failure and dependency heuristics.
        assert_eq!(selection.items, vec!["c", "b", "d"]);
        assert_eq!(selection.limit, 3);
        assert!(selection.scores.windows(2).all(|pair| pair[0] >= pair[1]));
        assert!(!selection.contains("e"));
    }

    #[test]
    fn test_dependency_heuristic_is_transitive() {
        let selected = SelectionHeuristic::ByDependency
            .select(&processed(), &SelectionPolicy::default());
        assert_eq!(selected, vec![2, 3]);
    }

    #[test]
    fn test_selection_respects_ratio_and_minimum() {
        let selector = PartialRollbackSelector::new(SelectionPolicy {
            max_selection_ratio: 0.34,
            min_selection_count: 2,
            ..SelectionPolicy::default()
        });
        let selection = selector.select(&processed()).unwrap();
        assert_eq!(selection.limit, 2);
        assert_eq!(selection.items.len(), 2);
    }

    #[test]
    fn test_minimum_above_limit_is_rejected() {
        let selector = PartialRollbackSelector::new(SelectionPolicy {
            max_selection_ratio: 0.1,
            min_selection_count: 1,
            ..SelectionPolicy::default()
        });
        let err = selector.select(&processed()).unwrap_err();
        assert!(matches!(err, TxError::Validation(_)));
    }

    #[test]
    fn test_padding_uses_most_recent_items() {
        let items: Vec<ProcessedItem> = (0..4)
            .map(|i| ProcessedItem::new(OperationItem::create(format!("i{}", i), format!("doc-{}", i)), false))
            .collect();
        let selector = PartialRollbackSelector::new(SelectionPolicy {
            min_selection_count: 2,
            ..SelectionPolicy::default()
        });
        let selection = selector.select(&items).unwrap();
        assert_eq!(selection.items, vec!["i3".to_string(), "i2".to_string()]);
        assert_eq!(selection.padded, 2);
    }

    #[test]
    fn test_empty_selection_is_rejected() {
        let selector = PartialRollbackSelector::new(SelectionPolicy {
            min_selection_count: 0,
            ..SelectionPolicy::default()
        });
        let items = vec![ProcessedItem::new(OperationItem::create("a", "doc-a"), false)];
        assert!(selector.select(&items).is_err());
    }
}
