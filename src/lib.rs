// ============================================================================
// batchtx Library
// ============================================================================
//
// Batch-operation transactions with snapshot-based rollback, strategy
// selection, cascading rollback of dependent transactions and two-phase
// commit across participants.
//
// ============================================================================

pub mod cascade;
pub mod core;
pub mod distributed;
pub mod lock;
pub mod rollback;
pub mod snapshot;
pub mod transaction;

pub use crate::core::{
    BusinessPriority, DistributedTransactionId, EngineConfig, OperationItem, OperationType,
    Result, RiskLevel, RollbackStrategy, SnapshotId, TransactionId, TxError, Urgency,
};
pub use cascade::{CascadeMode, CascadePlan, CascadeReport};
pub use distributed::{
    DistributedCoordinator, DistributedOutcome, DistributedPhase, Participant, ParticipantBuilder,
    ParticipantStatus, RecordingParticipant,
};
pub use lock::ResourceLockTable;
pub use rollback::{PartialSelection, RollbackReport, RollbackStrategyChoice};
pub use snapshot::{
    CaptureMode, FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore, Snapshot, SnapshotStore,
};
pub use transaction::{
    ExecutionOutcome, ExecutionOutput, OperationExecutor, ProgressCallback, ProgressEvent,
    ProgressPhase, TransactionContext, TransactionCoordinator, TransactionInfo, TransactionOptions,
    TransactionStatus,
};

use cascade::{CascadeExecutor, CascadePlanner};
use chrono::Utc;
use rollback::{PartialRollbackSelector, RollbackStrategyEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, event};

// ============================================================================
// Engine facade
// ============================================================================

/// Counters and gauges across every engine component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub active_transactions: usize,
    pub retained_transactions: usize,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub live_locks: usize,
    pub retained_snapshots: usize,
    pub in_flight_distributed: usize,
}

/// Every engine service built from one configuration.
///
/// Nothing is global: two engines share no state.
///
/// # Examples
///
/// ```no_run
/// use batchtx::{BatchEngine, EngineConfig, OperationItem, TransactionOptions};
/// # use batchtx::{ExecutionOutput, OperationExecutor, TransactionContext};
/// # use std::sync::Arc;
/// # struct Store;
/// # #[async_trait::async_trait]
/// # impl OperationExecutor for Store {
/// #     async fn execute(&self, _: &OperationItem, _: &TransactionContext) -> batchtx::Result<ExecutionOutput> {
/// #         Ok(ExecutionOutput::default())
/// #     }
/// # }
/// # async fn demo() -> batchtx::Result<()> {
/// let engine = BatchEngine::new(EngineConfig::default())?;
/// let outcome = engine
///     .run(
///         "import",
///         vec![OperationItem::create("a", "doc-a")],
///         TransactionOptions::new().with_fail_fast(true),
///         Arc::new(Store),
///         None,
///     )
///     .await?;
/// println!("{}", outcome.status());
/// # Ok(())
/// # }
/// ```
pub struct BatchEngine {
    config: EngineConfig,
    locks: Arc<ResourceLockTable>,
    snapshots: Arc<SnapshotStore>,
    strategies: Arc<RollbackStrategyEngine>,
    selector: Arc<PartialRollbackSelector>,
    cascade_planner: Arc<CascadePlanner>,
    coordinator: Arc<TransactionCoordinator>,
    distributed: Arc<DistributedCoordinator>,
}

impl BatchEngine {
    /// Builds an engine with in-memory snapshots only.
    ///
    /// # Errors
    /// Returns a validation error for an unusable configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Builds an engine that also persists snapshots to `persistence`.
    pub fn with_persistence(config: EngineConfig, persistence: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::build(config, Some(persistence))
    }

    fn build(config: EngineConfig, persistence: Option<Arc<dyn KeyValueStore>>) -> Result<Self> {
        let config = crate::core::normalize_engine_config(config);
        config.validate()?;

        let locks = Arc::new(ResourceLockTable::new(config.lock.clone()));
        let mut snapshots = SnapshotStore::new(config.snapshot.clone());
        if let Some(persistence) = persistence {
            snapshots = snapshots.with_persistence(persistence);
        }
        let snapshots = Arc::new(snapshots);
        let strategies = Arc::new(RollbackStrategyEngine::new(config.strategy.clone()));
        let selector = Arc::new(PartialRollbackSelector::new(config.selection.clone()));
        let cascade_planner = Arc::new(CascadePlanner::new(config.cascade.clone()));
        let cascade_executor = Arc::new(CascadeExecutor::new(config.cascade.clone()));

        let coordinator = Arc::new(
            TransactionCoordinator::new(config.transaction.clone(), locks.clone(), snapshots.clone())
                .with_strategy_engine(strategies.clone())
                .with_selector(selector.clone())
                .with_cascade(cascade_planner.clone(), cascade_executor),
        );
        let distributed = Arc::new(DistributedCoordinator::new(config.distributed.clone()));

        event!(
            Level::DEBUG,
            max_items = config.transaction.max_items,
            default_strategy = %config.strategy.default_strategy,
            "batch engine ready"
        );
        Ok(Self {
            config,
            locks,
            snapshots,
            strategies,
            selector,
            cascade_planner,
            coordinator,
            distributed,
        })
    }

    /// Normalized configuration the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn begin(
        &self,
        kind: impl Into<String>,
        items: Vec<OperationItem>,
        options: TransactionOptions,
    ) -> Result<TransactionId> {
        self.coordinator.begin(kind, items, options).await
    }

    pub async fn execute(
        &self,
        transaction_id: TransactionId,
        executor: Arc<dyn OperationExecutor>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutcome> {
        self.coordinator
            .execute(transaction_id, executor, on_progress)
            .await
    }

    /// `begin` followed by `execute`.
    pub async fn run(
        &self,
        kind: impl Into<String>,
        items: Vec<OperationItem>,
        options: TransactionOptions,
        executor: Arc<dyn OperationExecutor>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutcome> {
        let transaction_id = self.begin(kind, items, options).await?;
        self.execute(transaction_id, executor, on_progress).await
    }

    pub async fn abort(&self, transaction_id: TransactionId, reason: impl Into<String>) -> Result<()> {
        self.coordinator.abort(transaction_id, reason).await
    }

    pub async fn transaction(&self, transaction_id: TransactionId) -> Option<TransactionInfo> {
        self.coordinator.transaction(transaction_id).await
    }

    /// Evicts expired snapshots and reclaims expired locks.
    pub async fn collect_garbage(&self) -> Result<Vec<SnapshotId>> {
        let reclaimed = self.locks.purge_expired().await;
        let evicted = self.snapshots.collect_garbage(Utc::now()).await?;
        event!(
            Level::DEBUG,
            reclaimed_locks = reclaimed,
            evicted_snapshots = evicted.len(),
            "garbage collected"
        );
        Ok(evicted)
    }

    pub async fn stats(&self) -> EngineStats {
        let transactions = self.coordinator.stats().await;
        EngineStats {
            active_transactions: transactions.active,
            retained_transactions: transactions.retained,
            committed: transactions.committed,
            rolled_back: transactions.rolled_back,
            failed: transactions.failed,
            timed_out: transactions.timed_out,
            live_locks: self.locks.active_count().await,
            retained_snapshots: self.snapshots.len().await,
            in_flight_distributed: self.distributed.in_flight_count().await,
        }
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn distributed(&self) -> &Arc<DistributedCoordinator> {
        &self.distributed
    }

    pub fn locks(&self) -> &Arc<ResourceLockTable> {
        &self.locks
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn strategies(&self) -> &Arc<RollbackStrategyEngine> {
        &self.strategies
    }

    pub fn selector(&self) -> &Arc<PartialRollbackSelector> {
        &self.selector
    }

    pub fn cascade_planner(&self) -> &Arc<CascadePlanner> {
        &self.cascade_planner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.transaction.max_items = 0;
        assert!(matches!(BatchEngine::new(config), Err(TxError::Validation(_))));
    }

    #[tokio::test]
    async fn test_engine_normalizes_config() {
        let mut config = EngineConfig::default();
        config.cascade.max_concurrency = 0;
        let engine = BatchEngine::new(config).unwrap();
        assert_eq!(engine.config().cascade.max_concurrency, 1);
        assert_eq!(engine.stats().await, EngineStats::default());
    }
}
