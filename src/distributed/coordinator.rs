// ============================================================================
// Two-Phase Commit Coordinator
// ============================================================================
//
// prepare -> commit, or prepare -> abort. Each phase is broadcast to every
// participant concurrently and all results are collected before the next
// decision. Abort only reaches participants that prepared. A participant
// whose abort fails is marked failed and the transaction is reported as
// inconsistent instead of being retried.
//
// ============================================================================

use super::participant::{
    DistributedPhase, Participant, ParticipantBuilder, ParticipantRegistry, ParticipantStatus,
};
use crate::core::{DistributedPolicy, DistributedTransactionId, Result, TxError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, Level, event, info_span};

pub const TWO_PHASE_COMMIT: &str = "2pc";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub participant_id: String,
    pub status: ParticipantStatus,
    /// Last error the participant returned, if any.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTransaction {
    pub id: DistributedTransactionId,
    pub protocol: String,
    pub phase: DistributedPhase,
    pub participants: Vec<ParticipantState>,
    /// Every phase entered, in order.
    pub phase_history: Vec<DistributedPhase>,
    pub started_at: DateTime<Utc>,
}

impl DistributedTransaction {
    fn new(id: DistributedTransactionId, participant_ids: Vec<String>) -> Self {
        Self {
            id,
            protocol: TWO_PHASE_COMMIT.to_string(),
            phase: DistributedPhase::Prepare,
            participants: participant_ids
                .into_iter()
                .map(|participant_id| ParticipantState {
                    participant_id,
                    status: ParticipantStatus::Preparing,
                    error: None,
                })
                .collect(),
            phase_history: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Moves to `next`. Prepare is entered once and only first.
    fn enter(&mut self, next: DistributedPhase) -> Result<()> {
        let allowed = match (self.phase_history.last(), next) {
            (None, DistributedPhase::Prepare) => true,
            (Some(DistributedPhase::Prepare), DistributedPhase::Commit | DistributedPhase::Abort) => true,
            (Some(DistributedPhase::Commit), DistributedPhase::Abort) => true,
            _ => false,
        };
        if !allowed {
            return Err(TxError::Validation(format!(
                "Cannot enter {}: distributed transaction {} is in {}",
                next, self.id, self.phase
            )));
        }
        self.phase = next;
        self.phase_history.push(next);
        Ok(())
    }

    pub fn status_of(&self, participant_id: &str) -> Option<ParticipantStatus> {
        self.participants
            .iter()
            .find(|state| state.participant_id == participant_id)
            .map(|state| state.status)
    }

    fn with_status(&self, status: ParticipantStatus) -> Vec<String> {
        self.participants
            .iter()
            .filter(|state| state.status == status)
            .map(|state| state.participant_id.clone())
            .collect()
    }

    pub fn all_in(&self, status: ParticipantStatus) -> bool {
        self.participants.iter().all(|state| state.status == status)
    }
}

/// Final state of a distributed transaction that ended consistently.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributedOutcome {
    Committed(DistributedTransaction),
    Aborted(DistributedTransaction),
}

impl DistributedOutcome {
    pub fn transaction(&self) -> &DistributedTransaction {
        match self {
            DistributedOutcome::Committed(transaction) => transaction,
            DistributedOutcome::Aborted(transaction) => transaction,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, DistributedOutcome::Committed(_))
    }
}

enum CallResult {
    Ok,
    Failed(String),
}

pub struct DistributedCoordinator {
    policy: DistributedPolicy,
    registry: RwLock<ParticipantRegistry>,
    in_flight: RwLock<HashMap<DistributedTransactionId, DistributedTransaction>>,
}

impl Default for DistributedCoordinator {
    fn default() -> Self {
        Self::new(DistributedPolicy::default())
    }
}

impl DistributedCoordinator {
    pub fn new(policy: DistributedPolicy) -> Self {
        Self {
            policy,
            registry: RwLock::new(ParticipantRegistry::new()),
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &DistributedPolicy {
        &self.policy
    }

    pub async fn register(
        &self,
        participant_id: impl Into<String>,
        participant: Arc<dyn Participant>,
    ) -> Result<()> {
        let participant_id = participant_id.into();
        self.registry
            .write()
            .await
            .register(participant_id.clone(), participant)?;
        event!(Level::DEBUG, participant_id = %participant_id, "participant registered");
        Ok(())
    }

    /// Registers a closure-built participant.
    ///
    /// # Errors
    /// Fails when the builder lacks a capability or the id is taken.
    pub async fn register_closures(
        &self,
        participant_id: impl Into<String>,
        builder: ParticipantBuilder,
    ) -> Result<()> {
        let participant = builder.build()?;
        self.register(participant_id, Arc::new(participant)).await
    }

    pub async fn unregister(&self, participant_id: &str) -> bool {
        self.registry.write().await.unregister(participant_id)
    }

    pub async fn participant_ids(&self) -> Vec<String> {
        self.registry.read().await.ids()
    }

    /// Opens a distributed transaction over registered participants.
    pub async fn begin(&self, participant_ids: &[&str]) -> Result<DistributedTransactionId> {
        if participant_ids.is_empty() {
            return Err(TxError::Validation(
                "distributed transaction needs at least one participant".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        {
            let registry = self.registry.read().await;
            for participant_id in participant_ids {
                if !seen.insert(*participant_id) {
                    return Err(TxError::Validation(format!(
                        "participant '{}' listed twice",
                        participant_id
                    )));
                }
                if !registry.contains(participant_id) {
                    return Err(TxError::Validation(format!(
                        "participant '{}' is not registered",
                        participant_id
                    )));
                }
            }
        }

        let id = DistributedTransactionId::new();
        let transaction = DistributedTransaction::new(
            id,
            participant_ids.iter().map(|id| id.to_string()).collect(),
        );
        self.in_flight.write().await.insert(id, transaction);
        Ok(id)
    }

    /// Runs both phases and cleans the transaction up.
    ///
    /// # Errors
    /// `DistributedInconsistency` when participants did not all end
    /// committed or all end aborted.
    pub async fn run(&self, transaction_id: DistributedTransactionId) -> Result<DistributedOutcome> {
        let span = info_span!("batchtx.distributed.run", transaction_id = %transaction_id);
        self.run_inner(transaction_id).instrument(span).await
    }

    /// `begin` followed by `run`.
    pub async fn execute(&self, participant_ids: &[&str]) -> Result<DistributedOutcome> {
        let transaction_id = self.begin(participant_ids).await?;
        self.run(transaction_id).await
    }

    async fn run_inner(&self, transaction_id: DistributedTransactionId) -> Result<DistributedOutcome> {
        let mut transaction = self
            .in_flight
            .read()
            .await
            .get(&transaction_id)
            .cloned()
            .ok_or_else(|| TxError::TransactionNotFound(transaction_id.to_string()))?;
        let handles = self.handles(&transaction).await?;
        let deadline = Instant::now() + Duration::from_millis(self.policy.timeout_ms);

        // Phase 1
        transaction.enter(DistributedPhase::Prepare)?;
        self.publish(&transaction).await;
        let results = self
            .broadcast(&handles, transaction_id, DistributedPhase::Prepare, deadline)
            .await;
        for (state, result) in transaction.participants.iter_mut().zip(results) {
            match result {
                CallResult::Ok => state.status = ParticipantStatus::Prepared,
                CallResult::Failed(message) => {
                    event!(Level::ERROR, error = %message, participant_id = %state.participant_id, "prepare failed");
                    state.status = ParticipantStatus::Aborted;
                    state.error = Some(message);
                }
            }
        }

        // Phase 2
        if transaction.all_in(ParticipantStatus::Prepared) {
            transaction.enter(DistributedPhase::Commit)?;
            self.publish(&transaction).await;
            let results = self
                .broadcast(&handles, transaction_id, DistributedPhase::Commit, deadline)
                .await;
            for (state, result) in transaction.participants.iter_mut().zip(results) {
                match result {
                    CallResult::Ok => state.status = ParticipantStatus::Committed,
                    CallResult::Failed(message) => {
                        event!(Level::ERROR, error = %message, participant_id = %state.participant_id, "commit failed");
                        state.error = Some(message);
                    }
                }
            }
            if transaction.all_in(ParticipantStatus::Committed) {
                self.cleanup(transaction_id).await;
                event!(Level::INFO, participants = transaction.participants.len(), "distributed transaction committed");
                return Ok(DistributedOutcome::Committed(transaction));
            }
        }

        self.abort_prepared(&mut transaction, &handles).await?;
        self.cleanup(transaction_id).await;

        let failed = transaction.with_status(ParticipantStatus::Failed);
        let committed = transaction.with_status(ParticipantStatus::Committed);
        if !failed.is_empty() || !committed.is_empty() {
            let mut participants = failed;
            participants.extend(committed);
            event!(
                Level::ERROR,
                participants = %participants.join(", "),
                "distributed transaction left participants inconsistent"
            );
            return Err(TxError::DistributedInconsistency {
                transaction_id: transaction_id.to_string(),
                participants,
            });
        }
        event!(Level::INFO, "distributed transaction aborted");
        Ok(DistributedOutcome::Aborted(transaction))
    }

    /// Best-effort abort of every participant still prepared.
    async fn abort_prepared(
        &self,
        transaction: &mut DistributedTransaction,
        handles: &[(String, Arc<dyn Participant>)],
    ) -> Result<()> {
        transaction.enter(DistributedPhase::Abort)?;
        self.publish(transaction).await;

        let targets: Vec<usize> = transaction
            .participants
            .iter()
            .enumerate()
            .filter(|(_, state)| state.status == ParticipantStatus::Prepared)
            .map(|(index, _)| index)
            .collect();
        let target_handles: Vec<(String, Arc<dyn Participant>)> =
            targets.iter().map(|index| handles[*index].clone()).collect();
        let deadline = Instant::now() + Duration::from_millis(self.policy.timeout_ms);
        let results = self
            .broadcast(&target_handles, transaction.id, DistributedPhase::Abort, deadline)
            .await;

        for (index, result) in targets.into_iter().zip(results) {
            let state = &mut transaction.participants[index];
            match result {
                CallResult::Ok => state.status = ParticipantStatus::Aborted,
                CallResult::Failed(message) => {
                    event!(Level::WARN, error = %message, participant_id = %state.participant_id, "abort failed");
                    state.status = ParticipantStatus::Failed;
                    state.error = Some(message);
                }
            }
        }
        Ok(())
    }

    /// Calls `phase` on every handle at once and returns the results in
    /// handle order. Every error comes back as a `ParticipantFailure`.
    async fn broadcast(
        &self,
        handles: &[(String, Arc<dyn Participant>)],
        transaction_id: DistributedTransactionId,
        phase: DistributedPhase,
        deadline: Instant,
    ) -> Vec<CallResult> {
        let calls = handles.iter().map(|(participant_id, participant)| {
            let participant = participant.clone();
            async move {
                let call = async {
                    match phase {
                        DistributedPhase::Prepare => participant.prepare(transaction_id).await,
                        DistributedPhase::Commit => participant.commit(transaction_id).await,
                        DistributedPhase::Abort => participant.abort(transaction_id).await,
                    }
                };
                let result = match timeout_at(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(TxError::Timeout(format!("{} {}", phase, transaction_id))),
                };
                match result {
                    Ok(()) => CallResult::Ok,
                    Err(err) => CallResult::Failed(participant_failure(participant_id, phase, err).to_string()),
                }
            }
        });
        join_all(calls).await
    }

    async fn handles(
        &self,
        transaction: &DistributedTransaction,
    ) -> Result<Vec<(String, Arc<dyn Participant>)>> {
        let registry = self.registry.read().await;
        transaction
            .participants
            .iter()
            .map(|state| {
                registry
                    .get(&state.participant_id)
                    .map(|participant| (state.participant_id.clone(), participant))
                    .ok_or_else(|| {
                        TxError::Validation(format!(
                            "participant '{}' is not registered",
                            state.participant_id
                        ))
                    })
            })
            .collect()
    }

    async fn publish(&self, transaction: &DistributedTransaction) {
        if let Some(entry) = self.in_flight.write().await.get_mut(&transaction.id) {
            *entry = transaction.clone();
        }
    }

    async fn cleanup(&self, transaction_id: DistributedTransactionId) {
        self.in_flight.write().await.remove(&transaction_id);
    }

    /// Current state of an in-flight transaction.
    pub async fn transaction(&self, transaction_id: DistributedTransactionId) -> Option<DistributedTransaction> {
        self.in_flight.read().await.get(&transaction_id).cloned()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }
}

fn participant_failure(participant_id: &str, phase: DistributedPhase, err: TxError) -> TxError {
    match err {
        TxError::ParticipantFailure { .. } => err,
        other => TxError::ParticipantFailure {
            participant_id: participant_id.to_string(),
            phase: phase.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::RecordingParticipant;

    #[test]
    fn test_prepare_is_never_reentered() {
        let mut transaction =
            DistributedTransaction::new(DistributedTransactionId::new(), vec!["a".into()]);
        assert!(transaction.enter(DistributedPhase::Commit).is_err());
        transaction.enter(DistributedPhase::Prepare).unwrap();
        assert!(transaction.enter(DistributedPhase::Prepare).is_err());
        transaction.enter(DistributedPhase::Commit).unwrap();
        transaction.enter(DistributedPhase::Abort).unwrap();
        assert!(transaction.enter(DistributedPhase::Prepare).is_err());
    }

    #[tokio::test]
    async fn test_all_prepared_commits() {
        let coordinator = DistributedCoordinator::default();
        let a = Arc::new(RecordingParticipant::new("a"));
        let b = Arc::new(RecordingParticipant::new("b"));
        coordinator.register("a", a.clone()).await.unwrap();
        coordinator.register("b", b.clone()).await.unwrap();

        let outcome = coordinator.execute(&["a", "b"]).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(
            outcome.transaction().phase_history,
            vec![DistributedPhase::Prepare, DistributedPhase::Commit]
        );
        assert_eq!(a.calls().await, vec![DistributedPhase::Prepare, DistributedPhase::Commit]);
        assert_eq!(coordinator.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_prepare_timeout_forces_abort() {
        let coordinator = DistributedCoordinator::new(DistributedPolicy { timeout_ms: 20 });
        let slow = Arc::new(
            RecordingParticipant::new("slow")
                .delayed_on(DistributedPhase::Prepare, Duration::from_millis(200)),
        );
        let fast = Arc::new(RecordingParticipant::new("fast"));
        coordinator.register("slow", slow.clone()).await.unwrap();
        coordinator.register("fast", fast.clone()).await.unwrap();

        let outcome = coordinator.execute(&["slow", "fast"]).await.unwrap();
        assert!(!outcome.is_committed());
        assert!(fast.received(DistributedPhase::Abort).await);
        assert!(!slow.received(DistributedPhase::Abort).await);
        assert!(!slow.received(DistributedPhase::Commit).await);
    }

    #[test]
    fn test_participant_errors_are_attributed() {
        let err = participant_failure(
            "ledger",
            DistributedPhase::Commit,
            TxError::IoError("disk full".into()),
        );
        match err {
            TxError::ParticipantFailure { participant_id, phase, message } => {
                assert_eq!(participant_id, "ledger");
                assert_eq!(phase, DistributedPhase::Commit.to_string());
                assert_eq!(message, "I/O error: disk full");
            }
            other => panic!("unexpected error: {other}"),
        }

        let scripted = TxError::ParticipantFailure {
            participant_id: "cache".into(),
            phase: "prepare".into(),
            message: "scripted failure".into(),
        };
        let kept = participant_failure("cache", DistributedPhase::Prepare, scripted);
        assert_eq!(
            kept.to_string(),
            "Participant 'cache' failed during prepare: scripted failure"
        );
    }

    #[tokio::test]
    async fn test_abort_failure_is_reported_as_inconsistency() {
        let coordinator = DistributedCoordinator::default();
        let stubborn = Arc::new(RecordingParticipant::new("stubborn").failing_on(DistributedPhase::Abort));
        let broken = Arc::new(RecordingParticipant::new("broken").failing_on(DistributedPhase::Prepare));
        coordinator.register("stubborn", stubborn).await.unwrap();
        coordinator.register("broken", broken).await.unwrap();

        let err = coordinator.execute(&["stubborn", "broken"]).await.unwrap_err();
        match err {
            TxError::DistributedInconsistency { participants, .. } => {
                assert_eq!(participants, vec!["stubborn".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coordinator.in_flight_count().await, 0);
    }
}
