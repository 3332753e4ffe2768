// ============================================================================
// Transaction Coordinator
// ============================================================================
//
// Owns every batch transaction from `begin` to its terminal status:
//
//   begin    validate -> locks -> snapshot -> RUNNING -> deadline timer
//   execute  items in caller order -> commit, or choose a strategy and undo
//   abort    stop a running transaction after its current item
//
// Terminal transitions always release locks, cancel the timer and unpin the
// snapshot. Terminal transactions stay in a bounded history so a committed
// transaction can still be undone when something it builds on cascades.
//
// The registry lock is never held across an executor call, a lock-table
// wait or a snapshot store call.
//
// ============================================================================

use super::change::{InverseOperation, replay_order};
use super::executor::{ExecutionPhase, OperationExecutor, TransactionContext};
use super::options::TransactionOptions;
use super::progress::{ProgressCallback, ProgressEvent, ProgressPhase, emit};
use super::state::{ItemOutcome, Transaction, TransactionInfo, TransactionProgress, TransactionStatus};
use super::timer::{AbortCause, AbortSignal, TimeoutGuard};
use crate::cascade::{
    CascadeExecutor, CascadePlanner, CascadeReport, CascadeRollbackHandler, DependencyGraph,
    DependencySource,
};
use crate::core::{
    OperationItem, Result, RollbackStrategy, SnapshotId, TransactionId, TransactionPolicy, TxError,
};
use crate::lock::ResourceLockTable;
use crate::rollback::{
    CompensationPlanner, PartialRollbackSelector, ProcessedItem, RollbackReport,
    RollbackStrategyChoice, RollbackStrategyEngine, StrategyContext,
};
use crate::snapshot::{Snapshot, SnapshotStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{Instrument, Level, event, info_span};

/// Result of a committed `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub progress: TransactionProgress,
    pub outcomes: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Committed(ExecutionReport),
    RolledBack(RollbackReport),
}

impl ExecutionOutcome {
    pub fn status(&self) -> TransactionStatus {
        match self {
            ExecutionOutcome::Committed(report) => report.status,
            ExecutionOutcome::RolledBack(report) => report.status,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, ExecutionOutcome::Committed(_))
    }

    pub fn rollback_report(&self) -> Option<&RollbackReport> {
        match self {
            ExecutionOutcome::RolledBack(report) => Some(report),
            ExecutionOutcome::Committed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub active: usize,
    pub retained: usize,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub timed_out: u64,
}

struct TransactionEntry {
    transaction: Transaction,
    signal: Arc<AbortSignal>,
    timer: Option<TimeoutGuard>,
    status: watch::Sender<TransactionStatus>,
    /// Set while `execute` or a rollback owns the transaction.
    executing: bool,
    /// Executor of the last `execute`, kept to undo a committed transaction
    /// during a cascade.
    executor: Option<Arc<dyn OperationExecutor>>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<TransactionId, TransactionEntry>,
    /// Terminal transactions, oldest first.
    history: VecDeque<TransactionId>,
    /// Terminal transactions dropped from `history`, oldest first.
    retired: VecDeque<TransactionId>,
    retired_ids: HashSet<TransactionId>,
}

impl Registry {
    fn retire(&mut self, transaction_id: TransactionId, limit: usize) {
        self.entries.remove(&transaction_id);
        if self.retired_ids.insert(transaction_id) {
            self.retired.push_back(transaction_id);
        }
        while self.retired.len() > limit {
            if let Some(forgotten) = self.retired.pop_front() {
                self.retired_ids.remove(&forgotten);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Items undone by one undo pass.
#[derive(Debug, Clone, Default)]
struct UndoSummary {
    undone: Vec<String>,
    compensated: Vec<String>,
    restored: Vec<String>,
}

/// Everything an undo pass needs, captured while the registry lock is held.
#[derive(Clone)]
struct UndoInput {
    transaction_id: TransactionId,
    context: TransactionContext,
    executor: Arc<dyn OperationExecutor>,
    items: Vec<OperationItem>,
    processed: Vec<OperationItem>,
    failed_ids: HashSet<String>,
    succeeded_ids: Vec<String>,
    inverses: Vec<InverseOperation>,
    snapshot_id: Option<SnapshotId>,
    options: TransactionOptions,
    progress: TransactionProgress,
}

impl UndoInput {
    fn from_transaction(transaction: &Transaction, executor: Arc<dyn OperationExecutor>) -> Self {
        Self {
            transaction_id: transaction.id(),
            context: TransactionContext::new(
                transaction.id(),
                transaction.kind(),
                ExecutionPhase::Inverse,
                transaction.items().len(),
            ),
            executor,
            items: transaction.items().to_vec(),
            processed: transaction.processed_items().to_vec(),
            failed_ids: transaction.failed_item_ids().into_iter().collect(),
            succeeded_ids: transaction.succeeded_item_ids(),
            inverses: transaction.inverse_operations().to_vec(),
            snapshot_id: transaction.snapshot_id(),
            options: transaction.options().clone(),
            progress: transaction.progress(),
        }
    }

    fn index_of(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == item_id)
    }
}

pub struct TransactionCoordinator {
    policy: TransactionPolicy,
    locks: Arc<ResourceLockTable>,
    snapshots: Arc<SnapshotStore>,
    strategies: Arc<RollbackStrategyEngine>,
    selector: Arc<PartialRollbackSelector>,
    cascade_planner: Arc<CascadePlanner>,
    cascade_executor: Arc<CascadeExecutor>,
    compensation: CompensationPlanner,
    registry: RwLock<Registry>,
    counters: Counters,
}

impl TransactionCoordinator {
    pub fn new(
        policy: TransactionPolicy,
        locks: Arc<ResourceLockTable>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            policy,
            locks,
            snapshots,
            strategies: Arc::new(RollbackStrategyEngine::default()),
            selector: Arc::new(PartialRollbackSelector::default()),
            cascade_planner: Arc::new(CascadePlanner::default()),
            cascade_executor: Arc::new(CascadeExecutor::default()),
            compensation: CompensationPlanner::new(),
            registry: RwLock::new(Registry::default()),
            counters: Counters::default(),
        }
    }

    pub fn with_strategy_engine(mut self, strategies: Arc<RollbackStrategyEngine>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_selector(mut self, selector: Arc<PartialRollbackSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_cascade(
        mut self,
        planner: Arc<CascadePlanner>,
        executor: Arc<CascadeExecutor>,
    ) -> Self {
        self.cascade_planner = planner;
        self.cascade_executor = executor;
        self
    }

    pub fn policy(&self) -> &TransactionPolicy {
        &self.policy
    }

    pub fn locks(&self) -> &Arc<ResourceLockTable> {
        &self.locks
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    // ------------------------------------------------------------------
    // begin
    // ------------------------------------------------------------------

    /// Opens a transaction: takes every target lock, captures the snapshot
    /// and starts the deadline timer. A failed begin leaves neither locks
    /// nor a snapshot behind.
    ///
    /// # Errors
    /// `Validation` for an unusable item set, `SnapshotTooLarge` when the
    /// capture cannot fit the ceiling, `LockConflict` when a target is held.
    pub async fn begin(
        self: &Arc<Self>,
        kind: impl Into<String>,
        items: Vec<OperationItem>,
        options: TransactionOptions,
    ) -> Result<TransactionId> {
        let kind = kind.into();
        let span = info_span!("batchtx.transaction.begin", kind = %kind, items = items.len());
        self.begin_inner(kind, items, options).instrument(span).await
    }

    async fn begin_inner(
        self: &Arc<Self>,
        kind: String,
        items: Vec<OperationItem>,
        options: TransactionOptions,
    ) -> Result<TransactionId> {
        self.validate_items(&items, &options).await?;

        let id = TransactionId::new();
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.policy.default_timeout_ms));
        let mut transaction = Transaction::new(id, kind, items, options, timeout);

        let targets: Vec<String> = transaction
            .items()
            .iter()
            .map(|item| item.target.clone())
            .collect();
        let wait = transaction
            .options()
            .lock_wait
            .unwrap_or_else(|| self.locks.policy().acquire_wait());
        let grants = self
            .locks
            .acquire_all(&targets, id, wait)
            .await
            .inspect_err(|err| {
                event!(Level::WARN, error = %err, transaction_id = %id, "begin failed to lock targets");
            })?;

        let snapshot = match self
            .snapshots
            .capture(
                id,
                transaction.items(),
                transaction.options().snapshot_mode,
                transaction.options().base_snapshot,
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.locks.release_all(id).await;
                event!(Level::WARN, error = %err, transaction_id = %id, "begin failed to capture snapshot");
                return Err(err);
            }
        };
        self.snapshots.pin(id).await;

        transaction.attach_snapshot(snapshot.id);
        transaction.attach_locks(grants);
        transaction.transition(TransactionStatus::Running)?;

        let (status, _) = watch::channel(TransactionStatus::Running);
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut registry = self.registry.write().await;
        let timer = TimeoutGuard::spawn(timeout, move || async move {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.handle_timeout(id).await;
            }
        });
        registry.entries.insert(
            id,
            TransactionEntry {
                transaction,
                signal: Arc::new(AbortSignal::new()),
                timer: Some(timer),
                status,
                executing: false,
                executor: None,
            },
        );
        drop(registry);

        event!(Level::INFO, transaction_id = %id, snapshot_id = %snapshot.id, "transaction started");
        Ok(id)
    }

    async fn validate_items(&self, items: &[OperationItem], options: &TransactionOptions) -> Result<()> {
        if items.is_empty() {
            return Err(TxError::Validation("transaction has no items".to_string()));
        }
        if items.len() > self.policy.max_items {
            return Err(TxError::Validation(format!(
                "transaction has {} items, the limit is {}",
                items.len(),
                self.policy.max_items
            )));
        }
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if item.id.is_empty() || item.target.is_empty() {
                return Err(TxError::Validation(
                    "every item needs an id and a target".to_string(),
                ));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(TxError::Validation(format!(
                    "duplicate item id '{}'",
                    item.id
                )));
            }
        }
        if let Some(ratio) = options.min_success_ratio
            && !(0.0..=1.0).contains(&ratio)
        {
            return Err(TxError::Validation(format!(
                "min_success_ratio {} is outside 0..=1",
                ratio
            )));
        }
        let registry = self.registry.read().await;
        for upstream in &options.depends_on {
            if !registry.entries.contains_key(upstream) {
                return Err(TxError::Validation(format!(
                    "unknown upstream transaction {}",
                    upstream
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // execute
    // ------------------------------------------------------------------

    /// Runs every item through `executor`, then commits or rolls back.
    ///
    /// # Errors
    /// `RollbackFailure` when the rollback itself failed; the transaction is
    /// then FAILED. Calling `execute` on a transaction that is not idle and
    /// RUNNING is an execution error.
    pub async fn execute(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        executor: Arc<dyn OperationExecutor>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutcome> {
        let span = info_span!("batchtx.transaction.execute", transaction_id = %transaction_id);
        self.execute_inner(transaction_id, executor, on_progress)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        executor: Arc<dyn OperationExecutor>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ExecutionOutcome> {
        let (items, options, signal, context) = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .entries
                .get_mut(&transaction_id)
                .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
            let status = entry.transaction.status();
            if status != TransactionStatus::Running || entry.executing {
                return Err(TxError::ExecutionError(format!(
                    "Cannot execute: transaction {} is {}{}",
                    transaction_id,
                    status,
                    if entry.executing { " and already executing" } else { "" }
                )));
            }
            entry.executing = true;
            entry.executor = Some(executor.clone());
            let transaction = &entry.transaction;
            (
                transaction.items().to_vec(),
                transaction.options().clone(),
                entry.signal.clone(),
                TransactionContext::new(
                    transaction_id,
                    transaction.kind(),
                    ExecutionPhase::Forward,
                    transaction.items().len(),
                ),
            )
        };

        let mut stop_reason: Option<String> = None;
        for (index, item) in items.iter().enumerate() {
            if signal.is_triggered() {
                break;
            }
            let result = executor
                .execute(item, &context.at(ExecutionPhase::Forward, Some(index)))
                .await;
            let failure = result.as_ref().err().map(|err| err.to_string());

            let progress = {
                let mut registry = self.registry.write().await;
                let entry = registry
                    .entries
                    .get_mut(&transaction_id)
                    .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
                match result {
                    Ok(output) => {
                        entry
                            .transaction
                            .record_success(&item.id, output.result, output.inverse)?
                    }
                    Err(err) => entry.transaction.record_failure(&item.id, err.to_string())?,
                }
                entry.transaction.progress()
            };

            event!(
                Level::DEBUG,
                item_id = %item.id,
                processed = progress.processed,
                failed = progress.failed,
                "item processed"
            );
            emit(
                on_progress.as_ref(),
                ProgressEvent::new(
                    transaction_id,
                    ProgressPhase::Executing,
                    progress,
                    Some(item.id.clone()),
                ),
            );

            if let Some(message) = failure {
                event!(Level::ERROR, error = %message, item_id = %item.id, "item failed");
                if options.fail_fast {
                    stop_reason = Some(format!("item '{}' failed: {}", item.id, message));
                    break;
                }
            }
        }

        let progress = self.progress_of(transaction_id).await?;
        let required = options.effective_success_ratio(self.policy.min_success_ratio);
        let (reason, final_status) = match signal.cause() {
            Some(AbortCause::TimedOut) => (
                Some(AbortCause::TimedOut.to_string()),
                TransactionStatus::TimedOut,
            ),
            Some(cause) => (Some(cause.to_string()), TransactionStatus::RolledBack),
            None if stop_reason.is_some() => (stop_reason, TransactionStatus::RolledBack),
            None if progress.success_ratio() + f64::EPSILON < required => (
                Some(format!(
                    "success ratio {:.2} is below the required {:.2}",
                    progress.success_ratio(),
                    required
                )),
                TransactionStatus::RolledBack,
            ),
            None => (None, TransactionStatus::Committed),
        };

        match reason {
            None => {
                let report = self.commit(transaction_id).await?;
                Ok(ExecutionOutcome::Committed(report))
            }
            Some(reason) => {
                let report = self
                    .roll_back(transaction_id, reason, final_status, executor, on_progress)
                    .await?;
                Ok(ExecutionOutcome::RolledBack(report))
            }
        }
    }

    async fn commit(&self, transaction_id: TransactionId) -> Result<ExecutionReport> {
        self.transition(transaction_id, TransactionStatus::Committed)
            .await?;
        let report = {
            let registry = self.registry.read().await;
            let entry = registry
                .entries
                .get(&transaction_id)
                .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
            ExecutionReport {
                transaction_id,
                status: entry.transaction.status(),
                progress: entry.transaction.progress(),
                outcomes: entry.transaction.outcomes().to_vec(),
            }
        };
        self.finish(transaction_id).await;
        event!(
            Level::INFO,
            transaction_id = %transaction_id,
            succeeded = report.progress.succeeded,
            failed = report.progress.failed,
            "transaction committed"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // rollback
    // ------------------------------------------------------------------

    async fn roll_back(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        reason: String,
        final_status: TransactionStatus,
        executor: Arc<dyn OperationExecutor>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<RollbackReport> {
        let span = info_span!("batchtx.transaction.rollback", transaction_id = %transaction_id);
        self.roll_back_inner(transaction_id, reason, final_status, executor, on_progress)
            .instrument(span)
            .await
    }

    async fn roll_back_inner(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        reason: String,
        final_status: TransactionStatus,
        executor: Arc<dyn OperationExecutor>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<RollbackReport> {
        let input = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .entries
                .get_mut(&transaction_id)
                .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
            entry.transaction.set_abort_reason(reason.clone());
            UndoInput::from_transaction(&entry.transaction, executor)
        };

        let dependents = self.dependents(transaction_id).await;
        let choice = self.choose_strategy(&input, dependents.len()).await;
        event!(
            Level::INFO,
            strategy = %choice.strategy,
            score = choice.score,
            risk = %choice.risk,
            reason = %reason,
            "rolling back"
        );
        emit(
            on_progress.as_ref(),
            ProgressEvent::new(transaction_id, ProgressPhase::RollingBack, input.progress, None),
        );

        let mut report = RollbackReport {
            transaction_id,
            status: final_status,
            reason,
            choice: choice.clone(),
            executed: choice.strategy,
            selection: None,
            selection_error: None,
            undone_items: Vec::new(),
            compensated_items: Vec::new(),
            restored_items: Vec::new(),
            cascade: None,
            progress: input.progress,
            item_errors: Vec::new(),
        };

        let outcome = self
            .run_strategy(&input, &choice, &mut report, on_progress.as_ref())
            .await;

        {
            let registry = self.registry.read().await;
            if let Some(entry) = registry.entries.get(&transaction_id) {
                report.item_errors = entry.transaction.info().errors;
            }
        }

        match outcome {
            Ok(summary) => {
                report.undone_items = summary.undone;
                report.compensated_items = summary.compensated;
                report.restored_items = summary.restored;
                self.transition(transaction_id, final_status).await?;
                self.finish(transaction_id).await;
                emit(
                    on_progress.as_ref(),
                    ProgressEvent::new(transaction_id, ProgressPhase::Completed, input.progress, None),
                );
                event!(
                    Level::INFO,
                    transaction_id = %transaction_id,
                    status = %final_status,
                    executed = %report.executed,
                    "transaction rolled back"
                );
                Ok(report)
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, transaction_id = %transaction_id, "rollback failed");
                self.transition(transaction_id, TransactionStatus::Failed)
                    .await?;
                self.finish(transaction_id).await;
                Err(TxError::RollbackFailure {
                    transaction_id: transaction_id.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn choose_strategy(&self, input: &UndoInput, dependents: usize) -> RollbackStrategyChoice {
        let succeeded: Vec<&OperationItem> = input
            .processed
            .iter()
            .filter(|item| !input.failed_ids.contains(&item.id))
            .collect();
        let ctx = StrategyContext {
            processed_items: input.processed.len(),
            succeeded_items: succeeded.len(),
            failed_items: input.failed_ids.len(),
            compensable_items: succeeded
                .iter()
                .filter(|item| self.compensation.is_compensable(item))
                .count(),
            destructive_items: input
                .processed
                .iter()
                .filter(|item| item.operation.is_destructive())
                .count(),
            dependent_transactions: dependents,
            active_transactions: self.active_count().await,
            priority: input.options.priority,
            urgency: input.options.urgency,
            risk: input.options.risk,
        };
        match input.options.forced_strategy {
            Some(strategy) => self.strategies.forced(strategy, &ctx),
            None => self.strategies.choose(&ctx),
        }
    }

    async fn run_strategy(
        self: &Arc<Self>,
        input: &UndoInput,
        choice: &RollbackStrategyChoice,
        report: &mut RollbackReport,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<UndoSummary> {
        match choice.strategy {
            RollbackStrategy::Immediate => self.undo(input, None, on_progress).await,
            RollbackStrategy::Partial => {
                let processed: Vec<ProcessedItem> = input
                    .processed
                    .iter()
                    .map(|item| ProcessedItem::new(item.clone(), input.failed_ids.contains(&item.id)))
                    .collect();
                match self.selector.select(&processed) {
                    Ok(selection) => {
                        let selected: HashSet<String> = selection.items.iter().cloned().collect();
                        report.selection = Some(selection);
                        self.undo(input, Some(&selected), on_progress).await
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "partial selection rejected, undoing everything");
                        report.selection_error = Some(err.to_string());
                        report.executed = RollbackStrategy::Immediate;
                        self.undo(input, None, on_progress).await
                    }
                }
            }
            RollbackStrategy::Compensating => self.compensate(input, on_progress).await,
            RollbackStrategy::Cascade => {
                let (summary, cascade) = self.cascade(input, choice, on_progress).await?;
                report.cascade = Some(cascade);
                Ok(summary)
            }
        }
    }

    /// Replays recorded inverses most recent first, then writes the snapshot
    /// state of the processed items back. `only` narrows both steps to the
    /// given item ids.
    async fn undo(
        &self,
        input: &UndoInput,
        only: Option<&HashSet<String>>,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<UndoSummary> {
        let selected = |item_id: &str| only.is_none_or(|ids| ids.contains(item_id));
        let mut summary = UndoSummary::default();

        for inverse in replay_order(&input.inverses) {
            if !selected(&inverse.item_id) {
                continue;
            }
            let ctx = input
                .context
                .at(ExecutionPhase::Inverse, input.index_of(&inverse.item_id));
            input
                .executor
                .execute(&inverse.operation, &ctx)
                .await
                .map_err(|err| TxError::OperationFailure {
                    item_id: inverse.operation.id.clone(),
                    message: err.to_string(),
                })?;
            summary.undone.push(inverse.item_id.clone());
        }

        let processed: HashSet<&str> = input
            .processed
            .iter()
            .map(|item| item.id.as_str())
            .filter(|id| selected(*id))
            .collect();
        if processed.is_empty() {
            return Ok(summary);
        }
        summary.restored = self
            .restore_from_snapshot(input, &processed, on_progress)
            .await?;
        Ok(summary)
    }

    async fn restore_from_snapshot(
        &self,
        input: &UndoInput,
        item_ids: &HashSet<&str>,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<Vec<String>> {
        let snapshot = self.snapshot_of(input).await?;

        let restored: Vec<OperationItem> = self
            .snapshots
            .restore(&snapshot)
            .await?
            .into_iter()
            .filter(|item| item_ids.contains(item.id.as_str()))
            .collect();
        if restored.is_empty() {
            return Ok(Vec::new());
        }

        emit(
            on_progress,
            ProgressEvent::new(
                input.transaction_id,
                ProgressPhase::Restoring,
                input.progress,
                None,
            ),
        );
        input
            .executor
            .restore(&restored, &input.context.at(ExecutionPhase::Restore, None))
            .await?;
        Ok(restored.into_iter().map(|item| item.id).collect())
    }

    /// Snapshot captured by `begin`, reloaded from persistence when it is no
    /// longer held in memory.
    async fn snapshot_of(&self, input: &UndoInput) -> Result<Arc<Snapshot>> {
        let missing = || {
            TxError::SnapshotNotFound(
                input
                    .snapshot_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| input.transaction_id.to_string()),
            )
        };
        let snapshot_id = input.snapshot_id.ok_or_else(missing)?;
        if let Some(snapshot) = self.snapshots.get_by_id(snapshot_id).await {
            return Ok(snapshot);
        }
        event!(
            Level::DEBUG,
            transaction_id = %input.transaction_id,
            snapshot_id = %snapshot_id,
            "snapshot not in memory, loading persisted copy"
        );
        self.snapshots
            .load_persisted(input.transaction_id)
            .await?
            .into_iter()
            .find(|snapshot| snapshot.id == snapshot_id)
            .ok_or_else(|| {
                event!(
                    Level::ERROR,
                    transaction_id = %input.transaction_id,
                    snapshot_id = %snapshot_id,
                    "snapshot no longer retained, cannot restore"
                );
                missing()
            })
    }

    /// Runs derived compensations for succeeded items, most recent first,
    /// and restores failed items from the snapshot.
    async fn compensate(
        &self,
        input: &UndoInput,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<UndoSummary> {
        let succeeded: Vec<OperationItem> = input
            .processed
            .iter()
            .filter(|item| input.succeeded_ids.contains(&item.id))
            .cloned()
            .collect();
        let plan = self.compensation.plan_all(&succeeded)?;

        let mut summary = UndoSummary::default();
        for (compensation, original) in plan.iter().zip(succeeded.iter().rev()) {
            let ctx = input
                .context
                .at(ExecutionPhase::Compensation, input.index_of(&original.id));
            input
                .executor
                .execute(compensation, &ctx)
                .await
                .map_err(|err| TxError::OperationFailure {
                    item_id: compensation.id.clone(),
                    message: err.to_string(),
                })?;
            summary.compensated.push(original.id.clone());
        }

        let failed: HashSet<&str> = input.failed_ids.iter().map(String::as_str).collect();
        if !failed.is_empty() {
            summary.restored = self
                .restore_from_snapshot(input, &failed, on_progress)
                .await?;
        }
        Ok(summary)
    }

    async fn cascade(
        self: &Arc<Self>,
        input: &UndoInput,
        choice: &RollbackStrategyChoice,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<(UndoSummary, CascadeReport)> {
        let root = input.transaction_id;
        let graph = DependencyGraph::build(
            root,
            &**self,
            self.cascade_planner.policy().max_depth,
        )
        .await?;
        let plan = self
            .cascade_planner
            .plan(&graph, choice.risk, input.options.forced_cascade_mode);
        if plan.has_cycles() {
            event!(
                Level::WARN,
                cycles = plan.cycles.len(),
                "dependency cycles found, running cyclic members sequentially"
            );
        }

        emit(
            on_progress,
            ProgressEvent::new(root, ProgressPhase::Cascading, input.progress, None),
        );
        let handler = Arc::new(CascadeHandler {
            coordinator: Arc::clone(self),
            root: input.clone(),
            on_progress: on_progress.cloned(),
            root_summary: Mutex::new(None),
        });
        let report = self.cascade_executor.execute(&plan, handler.clone()).await;
        if !report.is_success() {
            let failed: Vec<String> = report.failed().iter().map(ToString::to_string).collect();
            return Err(TxError::ExecutionError(format!(
                "cascade could not roll back {}",
                failed.join(", ")
            )));
        }
        let summary = handler.root_summary.lock().await.take().unwrap_or_default();
        Ok((summary, report))
    }

    /// Rolls back one dependent of a cascade according to its status.
    async fn roll_back_dependent(&self, root: TransactionId, dependent: TransactionId) -> Result<()> {
        let reason = format!("cascade rollback of {}", root);
        let mut waited = false;
        loop {
            let (status, executing, signal, watcher, timeout) = {
                let mut registry = self.registry.write().await;
                let entry = registry
                    .entries
                    .get_mut(&dependent)
                    .ok_or_else(|| TxError::TransactionNotFound(dependent.to_string()))?;
                let status = entry.transaction.status();
                let executing = entry.executing;
                if status == TransactionStatus::Running && !executing {
                    entry.executing = true;
                }
                (
                    status,
                    executing,
                    entry.signal.clone(),
                    entry.status.subscribe(),
                    entry.transaction.timeout(),
                )
            };

            match status {
                TransactionStatus::Running if executing && !waited => {
                    signal.trigger(AbortCause::Requested(reason.clone()));
                    self.wait_terminal(dependent, watcher, timeout).await?;
                    waited = true;
                }
                TransactionStatus::Running if executing => {
                    return Err(TxError::RollbackFailure {
                        transaction_id: dependent.to_string(),
                        message: "still running after its abort".to_string(),
                    });
                }
                TransactionStatus::Running | TransactionStatus::Pending => {
                    signal.trigger(AbortCause::Requested(reason.clone()));
                    return self
                        .close_idle(dependent, &reason, TransactionStatus::RolledBack)
                        .await;
                }
                TransactionStatus::Committed => return self.undo_committed(root, dependent).await,
                TransactionStatus::RolledBack | TransactionStatus::TimedOut => return Ok(()),
                TransactionStatus::Failed => {
                    return Err(TxError::RollbackFailure {
                        transaction_id: dependent.to_string(),
                        message: "its own rollback already failed".to_string(),
                    });
                }
            }
        }
    }

    async fn wait_terminal(
        &self,
        transaction_id: TransactionId,
        mut watcher: watch::Receiver<TransactionStatus>,
        limit: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(limit, watcher.wait_for(|status| status.is_terminal())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TxError::TransactionNotFound(transaction_id.to_string())),
            Err(_) => Err(TxError::Timeout(transaction_id.to_string())),
        }
    }

    /// Undoes a committed transaction with the executor it ran with.
    async fn undo_committed(&self, root: TransactionId, transaction_id: TransactionId) -> Result<()> {
        let input = {
            let registry = self.registry.read().await;
            let entry = registry
                .entries
                .get(&transaction_id)
                .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
            if entry.transaction.compensated_by().is_some() {
                return Ok(());
            }
            let executor = entry.executor.clone().ok_or_else(|| TxError::RollbackFailure {
                transaction_id: transaction_id.to_string(),
                message: "no executor recorded for the committed transaction".to_string(),
            })?;
            UndoInput::from_transaction(&entry.transaction, executor)
        };

        let summary = self.undo(&input, None, None).await?;
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.entries.get_mut(&transaction_id) {
            entry.transaction.mark_compensated(root);
        }
        event!(
            Level::INFO,
            transaction_id = %transaction_id,
            root = %root,
            undone = summary.undone.len(),
            restored = summary.restored.len(),
            "committed dependent undone"
        );
        Ok(())
    }

    /// Ends a RUNNING transaction that never started executing.
    async fn close_idle(
        &self,
        transaction_id: TransactionId,
        reason: &str,
        status: TransactionStatus,
    ) -> Result<()> {
        {
            let mut registry = self.registry.write().await;
            if let Some(entry) = registry.entries.get_mut(&transaction_id) {
                entry.transaction.set_abort_reason(reason);
            }
        }
        self.transition(transaction_id, status).await?;
        self.finish(transaction_id).await;
        event!(Level::INFO, transaction_id = %transaction_id, status = %status, reason = %reason, "idle transaction closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // abort and timeout
    // ------------------------------------------------------------------

    /// Stops a running transaction after its current item. A transaction
    /// that was never executed is rolled back right away; a terminal one is
    /// left untouched, including one already dropped from the history.
    /// Ids pushed out of the retired set report `TransactionNotFound`.
    pub async fn abort(&self, transaction_id: TransactionId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let idle = {
            let mut registry = self.registry.write().await;
            if registry.retired_ids.contains(&transaction_id) {
                event!(Level::DEBUG, transaction_id = %transaction_id, "abort ignored for retired transaction");
                return Ok(());
            }
            let entry = registry
                .entries
                .get_mut(&transaction_id)
                .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
            if entry.transaction.status().is_terminal() {
                event!(
                    Level::DEBUG,
                    transaction_id = %transaction_id,
                    status = %entry.transaction.status(),
                    "abort ignored for terminal transaction"
                );
                return Ok(());
            }
            entry.signal.trigger(AbortCause::Requested(reason.clone()));
            entry.transaction.set_abort_reason(reason.clone());
            let idle = !entry.executing;
            entry.executing = true;
            idle
        };

        if idle {
            self.close_idle(transaction_id, &reason, TransactionStatus::RolledBack)
                .await?;
        } else {
            event!(Level::INFO, transaction_id = %transaction_id, reason = %reason, "abort requested");
        }
        Ok(())
    }

    async fn handle_timeout(&self, transaction_id: TransactionId) {
        let idle = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.entries.get_mut(&transaction_id) else {
                return;
            };
            if entry.transaction.status().is_terminal() {
                return;
            }
            if !entry.signal.trigger(AbortCause::TimedOut) {
                return;
            }
            entry.transaction.set_abort_reason(AbortCause::TimedOut.to_string());
            let idle = !entry.executing;
            entry.executing = true;
            idle
        };

        event!(Level::WARN, transaction_id = %transaction_id, "transaction deadline exceeded");
        if idle
            && let Err(err) = self
                .close_idle(
                    transaction_id,
                    &AbortCause::TimedOut.to_string(),
                    TransactionStatus::TimedOut,
                )
                .await
        {
            event!(Level::ERROR, error = %err, transaction_id = %transaction_id, "timeout cleanup failed");
        }
    }

    // ------------------------------------------------------------------
    // bookkeeping
    // ------------------------------------------------------------------

    async fn transition(&self, transaction_id: TransactionId, next: TransactionStatus) -> Result<()> {
        {
            let mut registry = self.registry.write().await;
            let entry = registry
                .entries
                .get_mut(&transaction_id)
                .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
            entry.transaction.transition(next)?;
            entry.status.send_replace(next);
        }
        let counter = match next {
            TransactionStatus::Committed => Some(&self.counters.committed),
            TransactionStatus::RolledBack => Some(&self.counters.rolled_back),
            TransactionStatus::Failed => Some(&self.counters.failed),
            TransactionStatus::TimedOut => Some(&self.counters.timed_out),
            TransactionStatus::Pending | TransactionStatus::Running => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Cleanup after a terminal transition.
    async fn finish(&self, transaction_id: TransactionId) {
        let timer = {
            let mut registry = self.registry.write().await;
            let timer = registry.entries.get_mut(&transaction_id).and_then(|entry| {
                entry.executing = false;
                entry.timer.take()
            });
            registry.history.push_back(transaction_id);
            while registry.history.len() > self.policy.history_limit {
                if let Some(evicted) = registry.history.pop_front() {
                    registry.retire(evicted, self.policy.retired_limit);
                }
            }
            timer
        };
        drop(timer);
        let released = self.locks.release_all(transaction_id).await;
        self.snapshots.unpin(transaction_id).await;
        event!(Level::DEBUG, transaction_id = %transaction_id, released, "transaction resources released");
    }

    async fn progress_of(&self, transaction_id: TransactionId) -> Result<TransactionProgress> {
        let registry = self.registry.read().await;
        registry
            .entries
            .get(&transaction_id)
            .map(|entry| entry.transaction.progress())
            .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    pub async fn transaction(&self, transaction_id: TransactionId) -> Option<TransactionInfo> {
        let registry = self.registry.read().await;
        registry
            .entries
            .get(&transaction_id)
            .map(|entry| entry.transaction.info())
    }

    /// Ids of transactions that are not terminal yet.
    pub async fn active_transactions(&self) -> Vec<TransactionId> {
        let registry = self.registry.read().await;
        let mut active: Vec<&Transaction> = registry
            .entries
            .values()
            .map(|entry| &entry.transaction)
            .filter(|transaction| !transaction.status().is_terminal())
            .collect();
        active.sort_by_key(|transaction| (transaction.started_at(), transaction.id()));
        active.iter().map(|transaction| transaction.id()).collect()
    }

    pub async fn active_count(&self) -> usize {
        let registry = self.registry.read().await;
        registry
            .entries
            .values()
            .filter(|entry| !entry.transaction.status().is_terminal())
            .count()
    }

    /// Transactions whose effects still stand and that declared
    /// `transaction_id` as upstream, oldest first.
    pub async fn dependents(&self, transaction_id: TransactionId) -> Vec<TransactionId> {
        let registry = self.registry.read().await;
        let mut dependents: Vec<&Transaction> = registry
            .entries
            .values()
            .map(|entry| &entry.transaction)
            .filter(|transaction| transaction.depends_on().contains(&transaction_id))
            .filter(|transaction| match transaction.status() {
                TransactionStatus::Pending | TransactionStatus::Running => true,
                TransactionStatus::Committed => transaction.compensated_by().is_none(),
                TransactionStatus::RolledBack
                | TransactionStatus::Failed
                | TransactionStatus::TimedOut => false,
            })
            .collect();
        dependents.sort_by_key(|transaction| (transaction.started_at(), transaction.id()));
        dependents.iter().map(|transaction| transaction.id()).collect()
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let registry = self.registry.read().await;
        CoordinatorStats {
            active: registry
                .entries
                .values()
                .filter(|entry| !entry.transaction.status().is_terminal())
                .count(),
            retained: registry.history.len(),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DependencySource for TransactionCoordinator {
    async fn dependents_of(&self, transaction_id: TransactionId) -> Result<Vec<TransactionId>> {
        Ok(self.dependents(transaction_id).await)
    }
}

/// Bridges cascade execution back into the coordinator. The root is undone
/// in place; every other member goes through its own status.
struct CascadeHandler {
    coordinator: Arc<TransactionCoordinator>,
    root: UndoInput,
    on_progress: Option<ProgressCallback>,
    root_summary: Mutex<Option<UndoSummary>>,
}

#[async_trait]
impl CascadeRollbackHandler for CascadeHandler {
    async fn rollback_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        if transaction_id == self.root.transaction_id {
            let summary = self
                .coordinator
                .undo(&self.root, None, self.on_progress.as_ref())
                .await?;
            *self.root_summary.lock().await = Some(summary);
            return Ok(());
        }
        self.coordinator
            .roll_back_dependent(self.root.transaction_id, transaction_id)
            .await
    }
}
