// ============================================================================
// Cascade Executor
// ============================================================================
//
// Runs a cascade plan level by level through a rollback handler. Concurrency
// only ever applies inside one level; the next level starts after every
// member of the current one has finished. Every planned transaction ends up
// with an outcome, including the ones skipped after a halt.
//
// ============================================================================

use super::planner::{CascadeMode, CascadePlan};
use crate::core::{CascadePolicy, Result, TransactionId};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, Level, event, info_span};

/// Rolls back one transaction of a cascade.
#[async_trait]
pub trait CascadeRollbackHandler: Send + Sync {
    async fn rollback_transaction(&self, transaction_id: TransactionId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeNodeOutcome {
    pub transaction_id: TransactionId,
    /// Index of the level the transaction ran in; the cyclic group comes
    /// after the last level.
    pub level: usize,
    pub attempted: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl CascadeNodeOutcome {
    pub fn is_success(&self) -> bool {
        self.attempted && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub root: TransactionId,
    pub mode: CascadeMode,
    pub outcomes: Vec<CascadeNodeOutcome>,
    pub cycles: Vec<Vec<TransactionId>>,
    /// Concurrency used by each batch, in execution order.
    pub concurrency_trace: Vec<usize>,
    /// Level after which execution stopped because of failures.
    pub halted_at_level: Option<usize>,
}

impl CascadeReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(CascadeNodeOutcome::is_success)
    }

    pub fn succeeded(&self) -> Vec<TransactionId> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .map(|outcome| outcome.transaction_id)
            .collect()
    }

    pub fn failed(&self) -> Vec<TransactionId> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .map(|outcome| outcome.transaction_id)
            .collect()
    }

    pub fn outcome_for(&self, transaction_id: TransactionId) -> Option<&CascadeNodeOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.transaction_id == transaction_id)
    }
}

pub struct CascadeExecutor {
    policy: CascadePolicy,
}

impl Default for CascadeExecutor {
    fn default() -> Self {
        Self::new(CascadePolicy::default())
    }
}

impl CascadeExecutor {
    pub fn new(policy: CascadePolicy) -> Self {
        Self { policy }
    }

    pub async fn execute(
        &self,
        plan: &CascadePlan,
        handler: Arc<dyn CascadeRollbackHandler>,
    ) -> CascadeReport {
        let span = info_span!(
            "batchtx.cascade.execute",
            root = %plan.root,
            mode = %plan.mode,
            nodes = plan.node_count()
        );
        self.run(plan, handler).instrument(span).await
    }

    async fn run(&self, plan: &CascadePlan, handler: Arc<dyn CascadeRollbackHandler>) -> CascadeReport {
        let mut report = CascadeReport {
            root: plan.root,
            mode: plan.mode,
            outcomes: Vec::with_capacity(plan.node_count()),
            cycles: plan.cycles.clone(),
            concurrency_trace: Vec::new(),
            halted_at_level: None,
        };
        let mut adaptive = self.policy.adaptive_seed_concurrency.max(1);

        let mut groups: Vec<&[TransactionId]> = plan.levels.iter().map(Vec::as_slice).collect();
        let cyclic_level = groups.len();
        if !plan.cyclic.is_empty() {
            groups.push(&plan.cyclic);
        }

        for (level, members) in groups.iter().enumerate() {
            if let Some(halted) = report.halted_at_level {
                report.outcomes.extend(members.iter().map(|id| CascadeNodeOutcome {
                    transaction_id: *id,
                    level,
                    attempted: false,
                    error: Some(format!("not attempted: level {} had failures", halted)),
                    elapsed_ms: 0,
                }));
                continue;
            }

            let outcomes = if level == cyclic_level {
                self.run_sequential(&handler, members, level, &mut report.concurrency_trace)
                    .await
            } else {
                match plan.mode {
                    CascadeMode::Sequential => {
                        self.run_sequential(&handler, members, level, &mut report.concurrency_trace)
                            .await
                    }
                    CascadeMode::Parallel => {
                        self.run_parallel(&handler, members, level, &mut report.concurrency_trace)
                            .await
                    }
                    CascadeMode::Hybrid if members.len() > self.policy.hybrid_parallel_threshold => {
                        self.run_parallel(&handler, members, level, &mut report.concurrency_trace)
                            .await
                    }
                    CascadeMode::Hybrid => {
                        self.run_sequential(&handler, members, level, &mut report.concurrency_trace)
                            .await
                    }
                    CascadeMode::Adaptive => {
                        self.run_adaptive(
                            &handler,
                            members,
                            level,
                            &mut adaptive,
                            &mut report.concurrency_trace,
                        )
                        .await
                    }
                }
            };

            let failures = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
            report.outcomes.extend(outcomes);
            if failures > 0 {
                event!(Level::WARN, level_index = level, failures, "cascade level had failures");
                if self.policy.halt_on_level_failure {
                    report.halted_at_level = Some(level);
                }
            }
        }

        event!(
            Level::INFO,
            succeeded = report.succeeded().len(),
            failed = report.failed().len(),
            "cascade rollback finished"
        );
        report
    }

    async fn run_sequential(
        &self,
        handler: &Arc<dyn CascadeRollbackHandler>,
        members: &[TransactionId],
        level: usize,
        trace: &mut Vec<usize>,
    ) -> Vec<CascadeNodeOutcome> {
        let mut outcomes = Vec::with_capacity(members.len());
        for id in members {
            trace.push(1);
            outcomes.push(run_one(handler.clone(), *id, level).await);
        }
        outcomes
    }

    async fn run_parallel(
        &self,
        handler: &Arc<dyn CascadeRollbackHandler>,
        members: &[TransactionId],
        level: usize,
        trace: &mut Vec<usize>,
    ) -> Vec<CascadeNodeOutcome> {
        let cap = self.policy.max_concurrency.max(1);
        trace.push(cap.min(members.len()));
        run_batch(handler, members, level, cap).await
    }

    async fn run_adaptive(
        &self,
        handler: &Arc<dyn CascadeRollbackHandler>,
        members: &[TransactionId],
        level: usize,
        concurrency: &mut usize,
        trace: &mut Vec<usize>,
    ) -> Vec<CascadeNodeOutcome> {
        let max = self.policy.adaptive_max_concurrency.max(1);
        let low_latency = Duration::from_millis(self.policy.adaptive_low_latency_ms);
        let mut outcomes = Vec::with_capacity(members.len());
        let mut offset = 0;
        while offset < members.len() {
            let width = (*concurrency).clamp(1, max);
            let batch = &members[offset..(offset + width).min(members.len())];
            trace.push(width);

            let started = Instant::now();
            let results = run_batch(handler, batch, level, width).await;
            let elapsed = started.elapsed();

            let failures = results.iter().filter(|outcome| !outcome.is_success()).count();
            let failure_rate = failures as f64 / batch.len() as f64;
            if failure_rate > self.policy.adaptive_failure_threshold {
                *concurrency = (width / 2).max(1);
            } else if failures == 0 && elapsed < low_latency {
                *concurrency = (width + 1).min(max);
            }

            offset += batch.len();
            outcomes.extend(results);
        }
        outcomes
    }
}

/// Runs `members` with at most `concurrency` in flight, keeping their order
/// in the returned outcomes.
async fn run_batch(
    handler: &Arc<dyn CascadeRollbackHandler>,
    members: &[TransactionId],
    level: usize,
    concurrency: usize,
) -> Vec<CascadeNodeOutcome> {
    stream::iter(members.iter().copied())
        .map(|id| run_one(handler.clone(), id, level))
        .buffered(concurrency.max(1))
        .collect()
        .await
}

async fn run_one(
    handler: Arc<dyn CascadeRollbackHandler>,
    transaction_id: TransactionId,
    level: usize,
) -> CascadeNodeOutcome {
    let started = Instant::now();
    let result = handler.rollback_transaction(transaction_id).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if let Err(err) = &result {
        event!(Level::ERROR, error = %err, transaction_id = %transaction_id, "cascade member rollback failed");
    }
    CascadeNodeOutcome {
        transaction_id,
        level,
        attempted: true,
        error: result.err().map(|err| err.to_string()),
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::graph::{DependencyGraph, StaticDependencies};
    use crate::cascade::planner::CascadePlanner;
    use crate::core::{RiskLevel, TxError};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        order: Mutex<Vec<TransactionId>>,
        failing: HashSet<TransactionId>,
    }

    #[async_trait]
    impl CascadeRollbackHandler for Recorder {
        async fn rollback_transaction(&self, transaction_id: TransactionId) -> Result<()> {
            self.order.lock().unwrap().push(transaction_id);
            if self.failing.contains(&transaction_id) {
                return Err(TxError::ExecutionError("undo failed".into()));
            }
            Ok(())
        }
    }

    async fn chain_plan(mode: CascadeMode) -> (Vec<TransactionId>, CascadePlan) {
        let t: Vec<TransactionId> = (0..3).map(|_| TransactionId::new()).collect();
        let mut source = StaticDependencies::new();
        source.add(t[0], t[1]).add(t[1], t[2]);
        let graph = DependencyGraph::build(t[0], &source, 8).await.unwrap();
        let plan = CascadePlanner::default().plan(&graph, RiskLevel::Low, Some(mode));
        (t, plan)
    }

    #[tokio::test]
    async fn test_levels_run_in_order() {
        let (t, plan) = chain_plan(CascadeMode::Parallel).await;
        let recorder = Arc::new(Recorder::default());
        let report = CascadeExecutor::default()
            .execute(&plan, recorder.clone())
            .await;
        assert!(report.is_success());
        assert_eq!(*recorder.order.lock().unwrap(), vec![t[2], t[1], t[0]]);
    }

    #[tokio::test]
    async fn test_halt_records_remaining_as_not_attempted() {
        let (t, plan) = chain_plan(CascadeMode::Sequential).await;
        let recorder = Arc::new(Recorder {
            failing: HashSet::from([t[2]]),
            ..Recorder::default()
        });
        let report = CascadeExecutor::default()
            .execute(&plan, recorder.clone())
            .await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.halted_at_level, Some(0));
        let root = report.outcome_for(t[0]).unwrap();
        assert!(!root.attempted);
        assert!(!root.is_success());
        assert_eq!(recorder.order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_adaptive_grows_after_fast_successes() {
        let root = TransactionId::new();
        let mut source = StaticDependencies::new();
        for _ in 0..9 {
            source.add(root, TransactionId::new());
        }
        let graph = DependencyGraph::build(root, &source, 8).await.unwrap();
        let plan = CascadePlanner::default().plan(&graph, RiskLevel::Low, Some(CascadeMode::Adaptive));

        let report = CascadeExecutor::default()
            .execute(&plan, Arc::new(Recorder::default()))
            .await;
        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 10);
        // 9 dependents: batches of 2, 3, 4, then the root alone.
        assert_eq!(report.concurrency_trace, vec![2, 3, 4, 5]);
    }
}
