// ============================================================================
// Distributed Module
// ============================================================================
//
// Two-phase commit across independently registered participants.
//
// ============================================================================

pub mod coordinator;
pub mod participant;
pub mod recording;

pub use coordinator::{
    DistributedCoordinator, DistributedOutcome, DistributedTransaction, ParticipantState,
    TWO_PHASE_COMMIT,
};
pub use participant::{
    ClosureParticipant, DistributedPhase, Participant, ParticipantBuilder, ParticipantRegistry,
    ParticipantStatus,
};
pub use recording::RecordingParticipant;
