// ============================================================================
// Transaction Module
// ============================================================================
//
// Batch transactions and their coordinator.
//
// - State Pattern: status machine PENDING -> RUNNING -> terminal
// - Command Pattern: inverse operations recorded per item, replayed in reverse
// - Snapshot restore: pre-execution state written back after the inverses
//
// ============================================================================

pub mod change;
pub mod coordinator;
pub mod executor;
pub mod options;
pub mod progress;
pub mod state;
pub mod timer;

pub use change::{InverseOperation, replay_order};
pub use coordinator::{CoordinatorStats, ExecutionOutcome, ExecutionReport, TransactionCoordinator};
pub use executor::{ExecutionOutput, ExecutionPhase, OperationExecutor, TransactionContext};
pub use options::TransactionOptions;
pub use progress::{ProgressCallback, ProgressEvent, ProgressPhase};
pub use state::{ItemOutcome, Transaction, TransactionInfo, TransactionProgress, TransactionStatus};
pub use timer::{AbortCause, AbortSignal, TimeoutGuard};
