use super::participant::{DistributedPhase, Participant};
use crate::core::{DistributedTransactionId, Result, TxError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

/// In-memory participant that records every call it receives.
///
/// Phases can be scripted to fail or to stall, which is enough to drive the
/// coordinator through its abort and timeout paths without a real resource.
#[derive(Default)]
pub struct RecordingParticipant {
    participant_id: String,
    calls: Mutex<Vec<(DistributedTransactionId, DistributedPhase)>>,
    failing: HashSet<DistributedPhase>,
    delays: HashMap<DistributedPhase, Duration>,
}

impl RecordingParticipant {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            ..Self::default()
        }
    }

    pub fn failing_on(mut self, phase: DistributedPhase) -> Self {
        self.failing.insert(phase);
        self
    }

    pub fn delayed_on(mut self, phase: DistributedPhase, delay: Duration) -> Self {
        self.delays.insert(phase, delay);
        self
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Phases received so far, in call order.
    pub async fn calls(&self) -> Vec<DistributedPhase> {
        self.calls.lock().await.iter().map(|(_, phase)| *phase).collect()
    }

    pub async fn received(&self, phase: DistributedPhase) -> bool {
        self.calls.lock().await.iter().any(|(_, seen)| *seen == phase)
    }

    async fn handle(&self, transaction_id: DistributedTransactionId, phase: DistributedPhase) -> Result<()> {
        self.calls.lock().await.push((transaction_id, phase));
        if let Some(delay) = self.delays.get(&phase) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&phase) {
            return Err(TxError::ParticipantFailure {
                participant_id: self.participant_id.clone(),
                phase: phase.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Participant for RecordingParticipant {
    async fn prepare(&self, transaction_id: DistributedTransactionId) -> Result<()> {
        self.handle(transaction_id, DistributedPhase::Prepare).await
    }

    async fn commit(&self, transaction_id: DistributedTransactionId) -> Result<()> {
        self.handle(transaction_id, DistributedPhase::Commit).await
    }

    async fn abort(&self, transaction_id: DistributedTransactionId) -> Result<()> {
        self.handle(transaction_id, DistributedPhase::Abort).await
    }
}
