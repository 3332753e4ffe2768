use crate::core::{DistributedTransactionId, Result, TxError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Protocol phase of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedPhase {
    Prepare,
    Commit,
    Abort,
}

impl DistributedPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributedPhase::Prepare => "prepare",
            DistributedPhase::Commit => "commit",
            DistributedPhase::Abort => "abort",
        }
    }
}

impl std::fmt::Display for DistributedPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one participant stands inside a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Preparing,
    Prepared,
    Committed,
    Aborted,
    /// Abort failed; the participant may hold prepared state.
    Failed,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ParticipantStatus::Preparing => "preparing",
            ParticipantStatus::Prepared => "prepared",
            ParticipantStatus::Committed => "committed",
            ParticipantStatus::Aborted => "aborted",
            ParticipantStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Resource manager taking part in two-phase commit.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Makes the participant's part durable enough to commit later.
    async fn prepare(&self, transaction_id: DistributedTransactionId) -> Result<()>;

    async fn commit(&self, transaction_id: DistributedTransactionId) -> Result<()>;

    /// Discards prepared state.
    async fn abort(&self, transaction_id: DistributedTransactionId) -> Result<()>;
}

/// Registered participants by id.
#[derive(Default, Clone)]
pub struct ParticipantRegistry {
    participants: BTreeMap<String, Arc<dyn Participant>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant_id: impl Into<String>, participant: Arc<dyn Participant>) -> Result<()> {
        let participant_id = participant_id.into();
        if participant_id.trim().is_empty() {
            return Err(TxError::Validation(
                "participant_id must not be empty".to_string(),
            ));
        }
        if self.participants.contains_key(&participant_id) {
            return Err(TxError::Validation(format!(
                "participant '{}' is already registered",
                participant_id
            )));
        }
        self.participants.insert(participant_id, participant);
        Ok(())
    }

    pub fn unregister(&mut self, participant_id: &str) -> bool {
        self.participants.remove(participant_id).is_some()
    }

    pub fn get(&self, participant_id: &str) -> Option<Arc<dyn Participant>> {
        self.participants.get(participant_id).cloned()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.participants.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

type PhaseFn = Arc<dyn Fn(DistributedTransactionId) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn boxed<F, Fut>(f: F) -> PhaseFn
where
    F: Fn(DistributedTransactionId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |transaction_id| Box::pin(f(transaction_id)))
}

/// Builds a participant from three closures.
///
/// ```ignore
/// let participant = ParticipantBuilder::new()
///     .on_prepare(|_| async { Ok(()) })
///     .on_commit(|_| async { Ok(()) })
///     .on_abort(|_| async { Ok(()) })
///     .build()?;
/// ```
#[derive(Default)]
pub struct ParticipantBuilder {
    prepare: Option<PhaseFn>,
    commit: Option<PhaseFn>,
    abort: Option<PhaseFn>,
}

impl ParticipantBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_prepare<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DistributedTransactionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.prepare = Some(boxed(f));
        self
    }

    pub fn on_commit<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DistributedTransactionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.commit = Some(boxed(f));
        self
    }

    pub fn on_abort<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DistributedTransactionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.abort = Some(boxed(f));
        self
    }

    /// # Errors
    /// Fails when any of the three capabilities is missing.
    pub fn build(self) -> Result<ClosureParticipant> {
        let missing: Vec<&str> = [
            ("prepare", self.prepare.is_none()),
            ("commit", self.commit.is_none()),
            ("abort", self.abort.is_none()),
        ]
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| name)
        .collect();

        match (self.prepare, self.commit, self.abort) {
            (Some(prepare), Some(commit), Some(abort)) => Ok(ClosureParticipant {
                prepare,
                commit,
                abort,
            }),
            _ => Err(TxError::Validation(format!(
                "participant is missing required capabilities: {}",
                missing.join(", ")
            ))),
        }
    }
}

/// Participant backed by closures; see [`ParticipantBuilder`].
pub struct ClosureParticipant {
    prepare: PhaseFn,
    commit: PhaseFn,
    abort: PhaseFn,
}

#[async_trait]
impl Participant for ClosureParticipant {
    async fn prepare(&self, transaction_id: DistributedTransactionId) -> Result<()> {
        (self.prepare)(transaction_id).await
    }

    async fn commit(&self, transaction_id: DistributedTransactionId) -> Result<()> {
        (self.commit)(transaction_id).await
    }

    async fn abort(&self, transaction_id: DistributedTransactionId) -> Result<()> {
        (self.abort)(transaction_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_missing_capability() {
        let err = ParticipantBuilder::new()
            .on_prepare(|_| async { Ok(()) })
            .on_commit(|_| async { Ok(()) })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TxError::Validation(ref message) if message.contains("abort")));
    }

    #[tokio::test]
    async fn test_closure_participant_dispatches_phases() {
        let participant = ParticipantBuilder::new()
            .on_prepare(|_| async { Ok(()) })
            .on_commit(|_| async { Err(TxError::ExecutionError("disk full".into())) })
            .on_abort(|_| async { Ok(()) })
            .build()
            .unwrap();
        let id = DistributedTransactionId::new();
        assert!(participant.prepare(id).await.is_ok());
        assert!(participant.commit(id).await.is_err());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_blank_ids() {
        let participant: Arc<dyn Participant> = Arc::new(
            ParticipantBuilder::new()
                .on_prepare(|_| async { Ok(()) })
                .on_commit(|_| async { Ok(()) })
                .on_abort(|_| async { Ok(()) })
                .build()
                .unwrap(),
        );
        let mut registry = ParticipantRegistry::new();
        registry.register("orders", participant.clone()).unwrap();
        assert!(registry.register("orders", participant.clone()).is_err());
        assert!(registry.register("  ", participant).is_err());
        assert_eq!(registry.ids(), vec!["orders".to_string()]);
    }
}
