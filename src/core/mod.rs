pub mod checksum;
pub mod error;
pub mod policy;
pub mod types;

pub use checksum::{checksum_of, fnv1a64, item_checksum};
pub use error::{Result, TxError};
pub use policy::{
    CascadePolicy, DistributedPolicy, EngineConfig, HeuristicWeights, LockPolicy,
    ScoringWeights, SelectionPolicy, SnapshotPolicy, StrategyPolicy, TransactionPolicy,
    normalize_engine_config,
};
pub use types::{
    BusinessPriority, DistributedTransactionId, OperationItem, OperationType, RiskLevel,
    RollbackStrategy, SnapshotId, TransactionId, Urgency,
};
