use super::graph::DependencyGraph;
use crate::core::{CascadePolicy, RiskLevel, TransactionId};
use serde::{Deserialize, Serialize};

/// How the members of one level are rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    /// One transaction at a time.
    Sequential,
    /// Up to `max_concurrency` transactions of a level at once.
    Parallel,
    /// Parallel for levels above the hybrid threshold, sequential otherwise.
    Hybrid,
    /// Concurrency tuned after every batch from observed latency and failures.
    Adaptive,
}

impl CascadeMode {
    pub const ALL: [CascadeMode; 4] = [
        CascadeMode::Sequential,
        CascadeMode::Parallel,
        CascadeMode::Hybrid,
        CascadeMode::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeMode::Sequential => "sequential",
            CascadeMode::Parallel => "parallel",
            CascadeMode::Hybrid => "hybrid",
            CascadeMode::Adaptive => "adaptive",
        }
    }

    fn safety(&self) -> f64 {
        match self {
            CascadeMode::Sequential => 1.0,
            CascadeMode::Hybrid => 0.85,
            CascadeMode::Adaptive => 0.8,
            CascadeMode::Parallel => 0.65,
        }
    }
}

impl std::fmt::Display for CascadeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeScore {
    pub mode: CascadeMode,
    pub valid: bool,
    pub rejection: Option<String>,
    /// Expected number of sequential rounds across all levels.
    pub rounds: usize,
    pub score: f64,
}

/// Ordered rollback plan for a root and its dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadePlan {
    pub root: TransactionId,
    /// Level batches; a level starts only after the previous one finished.
    pub levels: Vec<Vec<TransactionId>>,
    /// Members on or behind a cycle, run one at a time after the levels.
    pub cyclic: Vec<TransactionId>,
    pub cycles: Vec<Vec<TransactionId>>,
    pub mode: CascadeMode,
    pub forced: bool,
    pub scores: Vec<ModeScore>,
    pub depth: usize,
    pub risk: RiskLevel,
}

impl CascadePlan {
    pub fn node_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum::<usize>() + self.cyclic.len()
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Every planned transaction in execution order.
    pub fn execution_order(&self) -> Vec<TransactionId> {
        self.levels
            .iter()
            .flatten()
            .chain(self.cyclic.iter())
            .copied()
            .collect()
    }
}

pub struct CascadePlanner {
    policy: CascadePolicy,
}

impl Default for CascadePlanner {
    fn default() -> Self {
        Self::new(CascadePolicy::default())
    }
}

impl CascadePlanner {
    pub fn new(policy: CascadePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CascadePolicy {
        &self.policy
    }

    pub fn plan(
        &self,
        graph: &DependencyGraph,
        risk: RiskLevel,
        forced: Option<CascadeMode>,
    ) -> CascadePlan {
        let cycles = graph.find_cycles();
        let (levels, cyclic) = graph.levels();
        let depth = graph.depth();
        let scores = self.score_modes(&levels, !cycles.is_empty(), risk, graph.dependent_count(), depth);

        let mode = match forced {
            Some(mode) => mode,
            None => scores
                .iter()
                .filter(|score| score.valid)
                .fold(None::<&ModeScore>, |best, candidate| match best {
                    Some(current) if current.score >= candidate.score => Some(current),
                    _ => Some(candidate),
                })
                .map(|score| score.mode)
                .unwrap_or(CascadeMode::Sequential),
        };

        CascadePlan {
            root: graph.root(),
            levels,
            cyclic,
            cycles,
            mode,
            forced: forced.is_some(),
            scores,
            depth,
            risk,
        }
    }

    fn rounds(&self, mode: CascadeMode, levels: &[Vec<TransactionId>]) -> usize {
        let cap = self.policy.max_concurrency.max(1);
        let seed = self.policy.adaptive_seed_concurrency.max(1);
        levels
            .iter()
            .map(|level| {
                let size = level.len();
                match mode {
                    CascadeMode::Sequential => size,
                    CascadeMode::Parallel => size.div_ceil(cap),
                    CascadeMode::Hybrid if size > self.policy.hybrid_parallel_threshold => {
                        size.div_ceil(cap)
                    }
                    CascadeMode::Hybrid => size,
                    CascadeMode::Adaptive => size.div_ceil(seed),
                }
            })
            .sum()
    }

    /// Scores each mode on safety and expected speed. Higher risk and deeper
    /// graphs weigh safety more; many dependents weigh speed more. Cycles
    /// leave only sequential execution valid.
    pub fn score_modes(
        &self,
        levels: &[Vec<TransactionId>],
        has_cycles: bool,
        risk: RiskLevel,
        dependents: usize,
        depth: usize,
    ) -> Vec<ModeScore> {
        let risk_index = match risk {
            RiskLevel::Low => 0.0,
            RiskLevel::Medium => 1.0,
            RiskLevel::High => 2.0,
            RiskLevel::Critical => 3.0,
        };
        let dependent_pressure = dependents.min(20) as f64 / 20.0 * 0.1;
        let depth_caution = (depth.saturating_sub(1) as f64 * 0.02).min(0.1);
        let safety_weight =
            (0.4 + 0.15 * risk_index - dependent_pressure + depth_caution).clamp(0.2, 0.9);
        let speed_weight = 1.0 - safety_weight;

        let rounds: Vec<usize> = CascadeMode::ALL
            .iter()
            .map(|mode| self.rounds(*mode, levels))
            .collect();
        let fastest = rounds.iter().copied().min().unwrap_or(0).max(1) as f64;

        CascadeMode::ALL
            .iter()
            .zip(rounds)
            .map(|(mode, rounds)| {
                let rejection = (has_cycles && *mode != CascadeMode::Sequential)
                    .then(|| "dependency cycles require sequential execution".to_string());
                let speed = fastest / rounds.max(1) as f64;
                let score = if rejection.is_none() {
                    100.0 * (safety_weight * mode.safety() + speed_weight * speed)
                } else {
                    0.0
                };
                ModeScore {
                    mode: *mode,
                    valid: rejection.is_none(),
                    rejection,
                    rounds,
                    score,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::graph::StaticDependencies;

    #[tokio::test]
    async fn test_single_dependent_prefers_sequential() {
        let root = TransactionId::new();
        let mut source = StaticDependencies::new();
        source.add(root, TransactionId::new());
        let graph = DependencyGraph::build(root, &source, 8).await.unwrap();

        let plan = CascadePlanner::default().plan(&graph, RiskLevel::Low, None);
        assert_eq!(plan.mode, CascadeMode::Sequential);
        assert_eq!(plan.node_count(), 2);
        assert_eq!(plan.execution_order().last(), Some(&root));
    }

    #[tokio::test]
    async fn test_wide_level_prefers_concurrency() {
        let root = TransactionId::new();
        let mut source = StaticDependencies::new();
        for _ in 0..10 {
            source.add(root, TransactionId::new());
        }
        let graph = DependencyGraph::build(root, &source, 8).await.unwrap();

        let plan = CascadePlanner::default().plan(&graph, RiskLevel::Low, None);
        assert_eq!(plan.mode, CascadeMode::Hybrid);
        assert_eq!(plan.levels[0].len(), 10);
    }

    #[tokio::test]
    async fn test_cycles_force_sequential_and_forced_mode_skips_scoring() {
        let t: Vec<TransactionId> = (0..3).map(|_| TransactionId::new()).collect();
        let mut source = StaticDependencies::new();
        source.add(t[0], t[1]).add(t[1], t[2]).add(t[2], t[1]);
        for _ in 0..6 {
            source.add(t[0], TransactionId::new());
        }
        let graph = DependencyGraph::build(t[0], &source, 8).await.unwrap();

        let planner = CascadePlanner::default();
        let plan = planner.plan(&graph, RiskLevel::Low, None);
        assert!(plan.has_cycles());
        assert_eq!(plan.mode, CascadeMode::Sequential);
        assert!(plan.scores.iter().filter(|s| s.valid).count() == 1);

        let forced = planner.plan(&graph, RiskLevel::Low, Some(CascadeMode::Parallel));
        assert!(forced.forced);
        assert_eq!(forced.mode, CascadeMode::Parallel);
    }
}
