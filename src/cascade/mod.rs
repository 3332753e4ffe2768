// ============================================================================
// Cascade Module
// ============================================================================
//
// Rolls back a transaction together with every transaction that builds on
// it: graph construction, level planning with mode scoring, and execution.
//
// ============================================================================

pub mod executor;
pub mod graph;
pub mod planner;

pub use executor::{CascadeExecutor, CascadeNodeOutcome, CascadeReport, CascadeRollbackHandler};
pub use graph::{DependencyGraph, DependencySource, GraphNode, StaticDependencies};
pub use planner::{CascadeMode, CascadePlan, CascadePlanner, ModeScore};
