use super::{Result, RollbackStrategy, TxError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the resource lock table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPolicy {
    /// A lock expires this many milliseconds after acquisition.
    pub lock_timeout_ms: u64,
    /// How long `begin` waits for a held lock before reporting a conflict.
    pub acquire_wait_ms: u64,
    /// Poll interval while waiting for a held lock.
    pub retry_interval_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            acquire_wait_ms: 0,
            retry_interval_ms: 10,
        }
    }
}

impl LockPolicy {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }
}

/// Limits and defaults for batch transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPolicy {
    /// Upper bound on items per transaction.
    pub max_items: usize,
    /// Deadline applied when the caller does not set one.
    pub default_timeout_ms: u64,
    /// Share of items that must succeed for a commit.
    pub min_success_ratio: f64,
    /// Number of terminal transactions kept for inspection and cascades.
    pub history_limit: usize,
    /// Number of ids remembered after leaving the history, so that `abort`
    /// still treats them as terminal.
    pub retired_limit: usize,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            max_items: 1_000,
            default_timeout_ms: 30_000,
            min_success_ratio: 0.8,
            history_limit: 512,
            retired_limit: 8_192,
        }
    }
}

/// Capture ceiling and retention for snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Serialized size above which capture forces a compression pass.
    pub max_snapshot_bytes: usize,
    /// Snapshots older than this are eligible for eviction.
    pub retention_ms: u64,
    /// Soft cap on retained snapshots. Exceeding it is logged; it never
    /// evicts a snapshot inside the retention window.
    pub max_retained: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            max_snapshot_bytes: 1024 * 1024,
            retention_ms: 24 * 60 * 60 * 1_000,
            max_retained: 256,
        }
    }
}

/// Weights of the strategy scoring function. They should sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub success: f64,
    pub time: f64,
    pub resource: f64,
    pub fit: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            success: 0.4,
            time: 0.2,
            resource: 0.2,
            fit: 0.2,
        }
    }
}

/// Inputs of the rollback strategy engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPolicy {
    /// Used when no candidate strategy validates.
    pub default_strategy: RollbackStrategy,
    /// Immediate rollback is rejected above this many processed items.
    pub immediate_max_items: usize,
    /// Immediate rollback is rejected above this system load (0..1).
    pub immediate_max_load: f64,
    /// Estimated cost of undoing one item, in milliseconds.
    pub item_cost_ms: f64,
    /// Concurrent transactions at which the engine counts as fully loaded.
    pub capacity_transactions: usize,
    pub weights: ScoringWeights,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self {
            default_strategy: RollbackStrategy::Immediate,
            immediate_max_items: 500,
            immediate_max_load: 0.85,
            item_cost_ms: 10.0,
            capacity_transactions: 64,
            weights: ScoringWeights::default(),
        }
    }
}

/// Per-heuristic weights used when merging partial selections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicWeights {
    pub failure: f64,
    pub priority: f64,
    pub dependency: f64,
    pub impact: f64,
    pub risk: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            failure: 1.0,
            priority: 0.6,
            dependency: 0.8,
            impact: 0.7,
            risk: 0.5,
        }
    }
}

/// Bounds of the partial-rollback selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub max_selection_ratio: f64,
    pub max_absolute_selection: usize,
    pub min_selection_count: usize,
    /// Payload priority at or above which an item counts as high priority.
    pub high_priority_threshold: f64,
    pub weights: HeuristicWeights,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            max_selection_ratio: 0.5,
            max_absolute_selection: 100,
            min_selection_count: 1,
            high_priority_threshold: 5.0,
            weights: HeuristicWeights::default(),
        }
    }
}

/// Execution limits of cascading rollbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadePolicy {
    /// Concurrency cap within one level for parallel execution.
    pub max_concurrency: usize,
    /// Hybrid mode runs a level in parallel when it has more members than this.
    pub hybrid_parallel_threshold: usize,
    pub adaptive_seed_concurrency: usize,
    pub adaptive_max_concurrency: usize,
    /// A batch failure rate above this lowers adaptive concurrency.
    pub adaptive_failure_threshold: f64,
    /// An all-success batch faster than this raises adaptive concurrency.
    pub adaptive_low_latency_ms: u64,
    /// Stop after the first level with a failure; remaining members are
    /// recorded as failed instead of being attempted.
    pub halt_on_level_failure: bool,
    /// Graph traversal depth limit.
    pub max_depth: usize,
}

impl Default for CascadePolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            hybrid_parallel_threshold: 3,
            adaptive_seed_concurrency: 2,
            adaptive_max_concurrency: 8,
            adaptive_failure_threshold: 0.25,
            adaptive_low_latency_ms: 50,
            halt_on_level_failure: true,
            max_depth: 32,
        }
    }
}

/// Two-phase-commit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedPolicy {
    /// Deadline covering the prepare and commit phases.
    pub timeout_ms: u64,
}

impl Default for DistributedPolicy {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub lock: LockPolicy,
    #[serde(default)]
    pub transaction: TransactionPolicy,
    #[serde(default)]
    pub snapshot: SnapshotPolicy,
    #[serde(default)]
    pub strategy: StrategyPolicy,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub cascade: CascadePolicy,
    #[serde(default)]
    pub distributed: DistributedPolicy,
}

impl EngineConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transaction.max_items == 0 {
            return Err(TxError::Validation(
                "transaction.max_items must be greater than zero".to_string(),
            ));
        }
        if self.snapshot.max_snapshot_bytes == 0 {
            return Err(TxError::Validation(
                "snapshot.max_snapshot_bytes must be greater than zero".to_string(),
            ));
        }
        if self.lock.lock_timeout_ms == 0 {
            return Err(TxError::Validation(
                "lock.lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.selection.max_absolute_selection < self.selection.min_selection_count {
            return Err(TxError::Validation(format!(
                "selection.max_absolute_selection ({}) is below min_selection_count ({})",
                self.selection.max_absolute_selection, self.selection.min_selection_count
            )));
        }
        let weights = &self.strategy.weights;
        let sum = weights.success + weights.time + weights.resource + weights.fit;
        if !(0.99..=1.01).contains(&sum) {
            return Err(TxError::Validation(format!(
                "strategy.weights must sum to 1.0, got {:.3}",
                sum
            )));
        }
        Ok(())
    }
}

/// Clamps out-of-range values into their usable domain.
pub fn normalize_engine_config(mut config: EngineConfig) -> EngineConfig {
    config.transaction.min_success_ratio = config.transaction.min_success_ratio.clamp(0.0, 1.0);
    config.strategy.immediate_max_load = config.strategy.immediate_max_load.clamp(0.0, 1.0);
    config.strategy.capacity_transactions = config.strategy.capacity_transactions.max(1);
    config.selection.max_selection_ratio = config.selection.max_selection_ratio.clamp(0.0, 1.0);
    config.cascade.max_concurrency = config.cascade.max_concurrency.max(1);
    config.cascade.adaptive_max_concurrency = config.cascade.adaptive_max_concurrency.max(1);
    config.cascade.adaptive_seed_concurrency = config
        .cascade
        .adaptive_seed_concurrency
        .clamp(1, config.cascade.adaptive_max_concurrency);
    config.cascade.adaptive_failure_threshold =
        config.cascade.adaptive_failure_threshold.clamp(0.0, 1.0);
    config.cascade.max_depth = config.cascade.max_depth.max(1);
    config.lock.retry_interval_ms = config.lock.retry_interval_ms.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_normalize_clamps_ranges() {
        let mut config = EngineConfig::default();
        config.transaction.min_success_ratio = 1.7;
        config.cascade.max_concurrency = 0;
        config.cascade.adaptive_seed_concurrency = 50;
        let config = normalize_engine_config(config);
        assert_eq!(config.transaction.min_success_ratio, 1.0);
        assert_eq!(config.cascade.max_concurrency, 1);
        assert_eq!(config.cascade.adaptive_seed_concurrency, 8);
    }

    #[test]
    fn test_validate_rejects_unbalanced_weights() {
        let mut config = EngineConfig::default();
        config.strategy.weights.success = 0.9;
        assert!(matches!(config.validate(), Err(TxError::Validation(_))));
    }

    #[test]
    fn test_config_deserializes_with_missing_sections() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"lock": {"lock_timeout_ms": 500, "acquire_wait_ms": 0, "retry_interval_ms": 5}}"#)
                .unwrap();
        assert_eq!(config.lock.lock_timeout_ms, 500);
        assert_eq!(config.transaction.max_items, 1_000);
    }
}
