// ============================================================================
// Rollback Module
// ============================================================================
//
// Decides how a failed transaction is undone: strategy scoring, partial item
// selection and semantic compensation planning.
//
// ============================================================================

pub mod compensation;
pub mod report;
pub mod selector;
pub mod strategy;

pub use compensation::{COMPENSATION_SUFFIX, CompensationPlanner};
pub use report::RollbackReport;
pub use selector::{
    HeuristicResult, PartialRollbackSelector, PartialSelection, ProcessedItem, SelectionHeuristic,
};
pub use strategy::{
    RollbackStrategyChoice, RollbackStrategyEngine, StrategyCandidate, StrategyContext,
    StrategyEstimate,
};
