// ============================================================================
// Rollback Strategy Engine
// ============================================================================
//
// Scores Immediate, Partial, Cascade and Compensating against the state of a
// failed transaction and returns the best valid one with its rationale.
//
//   score = 100 * (w_success * success
//                + w_time * (1 - time)
//                + w_resource * (1 - resource)
//                + w_fit * urgency_fit) * priority_multiplier
//         - risk_penalty * exposure
//
// clamped to [0, 100]. Time and resource are normalised to [0, 1]. Inputs are
// caller context and measured engine signals only, so equal inputs always
// give equal choices.
//
// ============================================================================

use crate::core::{BusinessPriority, RiskLevel, RollbackStrategy, StrategyPolicy, Urgency};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Inputs of one strategy decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StrategyContext {
    pub processed_items: usize,
    pub succeeded_items: usize,
    pub failed_items: usize,
    /// Succeeded items a semantic inverse can be derived for.
    pub compensable_items: usize,
    /// Processed items whose operation deletes or moves data.
    pub destructive_items: usize,
    /// Transactions that depend on the failed one.
    pub dependent_transactions: usize,
    /// Non-terminal transactions in the engine when the decision is made.
    pub active_transactions: usize,
    pub priority: BusinessPriority,
    pub urgency: Urgency,
    /// Caller override; assessed from the other inputs when unset.
    pub risk: Option<RiskLevel>,
}

impl StrategyContext {
    pub fn failure_ratio(&self) -> f64 {
        if self.processed_items == 0 {
            return 0.0;
        }
        self.failed_items as f64 / self.processed_items as f64
    }

    pub fn destructive_ratio(&self) -> f64 {
        if self.processed_items == 0 {
            return 0.0;
        }
        self.destructive_items as f64 / self.processed_items as f64
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk.unwrap_or_else(|| {
            RiskLevel::assess(
                self.failure_ratio(),
                self.destructive_ratio(),
                self.dependent_transactions,
            )
        })
    }
}

/// Expected cost of running a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct StrategyEstimate {
    pub execution_time_ms: f64,
    /// Share of engine capacity the rollback occupies, 0..1.
    pub resource_use: f64,
    pub success_probability: f64,
}

/// One evaluated strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyCandidate {
    pub strategy: RollbackStrategy,
    pub valid: bool,
    /// Why the strategy was rejected, when it was.
    pub rejection: Option<String>,
    pub estimate: StrategyEstimate,
    pub score: f64,
}

/// Outcome of strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStrategyChoice {
    pub strategy: RollbackStrategy,
    /// 0..=100
    pub score: f64,
    pub rationale: String,
    pub estimate: StrategyEstimate,
    pub risk: RiskLevel,
    /// True when no candidate was valid and the default was used.
    pub fallback: bool,
    pub forced: bool,
    pub candidates: Vec<StrategyCandidate>,
}

pub struct RollbackStrategyEngine {
    policy: StrategyPolicy,
}

impl Default for RollbackStrategyEngine {
    fn default() -> Self {
        Self::new(StrategyPolicy::default())
    }
}

impl RollbackStrategyEngine {
    pub fn new(policy: StrategyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &StrategyPolicy {
        &self.policy
    }

    fn load(&self, ctx: &StrategyContext) -> f64 {
        let capacity = self.policy.capacity_transactions.max(1) as f64;
        (ctx.active_transactions as f64 / capacity).min(1.0)
    }

    fn validate(&self, strategy: RollbackStrategy, ctx: &StrategyContext) -> Option<String> {
        match strategy {
            RollbackStrategy::Immediate => {
                let load = self.load(ctx);
                if ctx.processed_items > self.policy.immediate_max_items {
                    Some(format!(
                        "{} processed items exceed the immediate limit of {}",
                        ctx.processed_items, self.policy.immediate_max_items
                    ))
                } else if load > self.policy.immediate_max_load {
                    Some(format!(
                        "load {:.2} exceeds the immediate limit of {:.2}",
                        load, self.policy.immediate_max_load
                    ))
                } else {
                    None
                }
            }
            RollbackStrategy::Partial => {
                if ctx.failed_items == 0 {
                    Some("no failed items to target".to_string())
                } else if ctx.processed_items < 2 {
                    Some("too few processed items to choose from".to_string())
                } else {
                    None
                }
            }
            RollbackStrategy::Cascade => {
                if ctx.dependent_transactions == 0 {
                    Some("no dependent transactions".to_string())
                } else {
                    None
                }
            }
            RollbackStrategy::Compensating => {
                if ctx.processed_items == 0 {
                    Some("nothing was processed".to_string())
                } else if ctx.compensable_items < ctx.succeeded_items {
                    Some(format!(
                        "{} of {} succeeded items have no semantic inverse",
                        ctx.succeeded_items - ctx.compensable_items,
                        ctx.succeeded_items
                    ))
                } else {
                    None
                }
            }
        }
    }

    /// Deterministic cost model per strategy.
    pub fn estimate(&self, strategy: RollbackStrategy, ctx: &StrategyContext) -> StrategyEstimate {
        let cost = self.policy.item_cost_ms.max(0.0);
        let processed = ctx.processed_items as f64;
        let load = self.load(ctx);
        let failure_ratio = ctx.failure_ratio();
        let dependents = ctx.dependent_transactions as f64;

        match strategy {
            RollbackStrategy::Immediate => StrategyEstimate {
                execution_time_ms: processed * cost,
                resource_use: (processed / self.policy.immediate_max_items.max(1) as f64 * 0.7
                    + load * 0.3)
                    .min(1.0),
                success_probability: 0.95 - 0.1 * load,
            },
            RollbackStrategy::Partial => {
                let targeted = (ctx.failed_items as f64 * 2.0).clamp(1.0, processed.max(1.0));
                StrategyEstimate {
                    execution_time_ms: targeted * cost + processed * cost * 0.1,
                    resource_use: (targeted / processed.max(1.0) * 0.5).min(1.0),
                    success_probability: 0.9 - 0.3 * failure_ratio,
                }
            }
            RollbackStrategy::Cascade => StrategyEstimate {
                execution_time_ms: processed * cost * (1.0 + dependents),
                resource_use: (0.3 + 0.1 * dependents).min(1.0),
                success_probability: 0.9 - 0.03 * dependents.min(10.0),
            },
            RollbackStrategy::Compensating => StrategyEstimate {
                execution_time_ms: ctx.succeeded_items as f64 * cost * 1.5,
                resource_use: (ctx.succeeded_items as f64 / processed.max(1.0) * 0.4).min(1.0),
                success_probability: 0.85,
            },
        }
    }

    fn urgency_fit(strategy: RollbackStrategy, urgency: Urgency) -> f64 {
        let row = match strategy {
            RollbackStrategy::Immediate => [0.6, 0.7, 0.9, 1.0],
            RollbackStrategy::Partial => [0.8, 0.7, 0.5, 0.3],
            RollbackStrategy::Cascade => [0.7, 0.7, 0.6, 0.5],
            RollbackStrategy::Compensating => [0.8, 0.7, 0.5, 0.4],
        };
        match urgency {
            Urgency::Low => row[0],
            Urgency::Normal => row[1],
            Urgency::High => row[2],
            Urgency::Critical => row[3],
        }
    }

    /// How much of the risk penalty a strategy carries.
    fn risk_exposure(strategy: RollbackStrategy) -> f64 {
        match strategy {
            RollbackStrategy::Immediate => 0.5,
            RollbackStrategy::Partial => 1.0,
            RollbackStrategy::Cascade => 0.8,
            RollbackStrategy::Compensating => 0.7,
        }
    }

    fn time_budget_ms(&self) -> f64 {
        (self.policy.item_cost_ms * self.policy.immediate_max_items as f64).max(1.0)
    }

    pub fn score(
        &self,
        strategy: RollbackStrategy,
        estimate: &StrategyEstimate,
        ctx: &StrategyContext,
        risk: RiskLevel,
    ) -> f64 {
        let weights = &self.policy.weights;
        let time_norm = (estimate.execution_time_ms / self.time_budget_ms()).clamp(0.0, 1.0);
        let resource_norm = estimate.resource_use.clamp(0.0, 1.0);
        let fit = Self::urgency_fit(strategy, ctx.urgency);

        let base = weights.success * estimate.success_probability.clamp(0.0, 1.0)
            + weights.time * (1.0 - time_norm)
            + weights.resource * (1.0 - resource_norm)
            + weights.fit * fit;
        let score = 100.0 * base * ctx.priority.multiplier()
            - risk.penalty() * Self::risk_exposure(strategy);
        score.clamp(0.0, 100.0)
    }

    /// Validates, estimates and scores every strategy.
    pub fn evaluate(&self, ctx: &StrategyContext) -> Vec<StrategyCandidate> {
        let risk = ctx.risk_level();
        RollbackStrategy::ALL
            .iter()
            .map(|strategy| {
                let rejection = self.validate(*strategy, ctx);
                let estimate = self.estimate(*strategy, ctx);
                let score = if rejection.is_none() {
                    self.score(*strategy, &estimate, ctx, risk)
                } else {
                    0.0
                };
                StrategyCandidate {
                    strategy: *strategy,
                    valid: rejection.is_none(),
                    rejection,
                    estimate,
                    score,
                }
            })
            .collect()
    }

    /// Highest-scoring valid strategy. Ties go to the earlier strategy in
    /// `RollbackStrategy::ALL`. Falls back to the configured default when
    /// nothing validates.
    pub fn choose(&self, ctx: &StrategyContext) -> RollbackStrategyChoice {
        let risk = ctx.risk_level();
        let candidates = self.evaluate(ctx);

        let best = candidates
            .iter()
            .filter(|candidate| candidate.valid)
            .fold(None::<&StrategyCandidate>, |best, candidate| match best {
                Some(current) if current.score >= candidate.score => Some(current),
                _ => Some(candidate),
            });

        match best {
            Some(winner) => RollbackStrategyChoice {
                strategy: winner.strategy,
                score: winner.score,
                rationale: self.rationale(winner, &candidates, ctx, risk),
                estimate: winner.estimate,
                risk,
                fallback: false,
                forced: false,
                candidates,
            },
            None => {
                let strategy = self.policy.default_strategy;
                let estimate = self.estimate(strategy, ctx);
                let mut rationale = format!("no strategy validated, using default {}:", strategy);
                for candidate in &candidates {
                    if let Some(reason) = &candidate.rejection {
                        let _ = write!(rationale, " {} ({});", candidate.strategy, reason);
                    }
                }
                RollbackStrategyChoice {
                    strategy,
                    score: self.score(strategy, &estimate, ctx, risk),
                    rationale,
                    estimate,
                    risk,
                    fallback: true,
                    forced: false,
                    candidates,
                }
            }
        }
    }

    /// Records a caller-forced strategy with its score, without selection.
    pub fn forced(&self, strategy: RollbackStrategy, ctx: &StrategyContext) -> RollbackStrategyChoice {
        let risk = ctx.risk_level();
        let estimate = self.estimate(strategy, ctx);
        RollbackStrategyChoice {
            strategy,
            score: self.score(strategy, &estimate, ctx, risk),
            rationale: format!("{} forced by caller", strategy),
            estimate,
            risk,
            fallback: false,
            forced: true,
            candidates: Vec::new(),
        }
    }

    fn rationale(
        &self,
        winner: &StrategyCandidate,
        candidates: &[StrategyCandidate],
        ctx: &StrategyContext,
        risk: RiskLevel,
    ) -> String {
        let mut text = format!(
            "{} scored {:.1} (success {:.2}, time {:.0}ms, resource {:.2}, urgency fit {:.1}, risk {}, priority x{:.1})",
            winner.strategy,
            winner.score,
            winner.estimate.success_probability,
            winner.estimate.execution_time_ms,
            winner.estimate.resource_use,
            Self::urgency_fit(winner.strategy, ctx.urgency),
            risk,
            ctx.priority.multiplier()
        );
        let others: Vec<String> = candidates
            .iter()
            .filter(|candidate| candidate.strategy != winner.strategy)
            .map(|candidate| match &candidate.rejection {
                Some(reason) => format!("{} rejected: {}", candidate.strategy, reason),
                None => format!("{} {:.1}", candidate.strategy, candidate.score),
            })
            .collect();
        if !others.is_empty() {
            let _ = write!(text, "; {}", others.join("; "));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> StrategyContext {
        StrategyContext {
            processed_items: 10,
            succeeded_items: 8,
            failed_items: 2,
            compensable_items: 8,
            destructive_items: 1,
            dependent_transactions: 0,
            active_transactions: 1,
            ..StrategyContext::default()
        }
    }

    #[test]
    fn test_choice_is_deterministic() {
        let engine = RollbackStrategyEngine::default();
        let first = engine.choose(&context());
        let second = engine.choose(&context());
        assert_eq!(first, second);
        assert!((0.0..=100.0).contains(&first.score));
        assert!(!first.rationale.is_empty());
    }

    #[test]
    fn test_cascade_requires_dependents() {
        let engine = RollbackStrategyEngine::default();
        let candidates = engine.evaluate(&context());
        let cascade = candidates
            .iter()
            .find(|c| c.strategy == RollbackStrategy::Cascade)
            .unwrap();
        assert!(!cascade.valid);

        let mut ctx = context();
        ctx.dependent_transactions = 2;
        let candidates = engine.evaluate(&ctx);
        assert!(candidates
            .iter()
            .any(|c| c.strategy == RollbackStrategy::Cascade && c.valid));
    }

    #[test]
    fn test_immediate_rejected_under_load() {
        let engine = RollbackStrategyEngine::default();
        let mut ctx = context();
        ctx.active_transactions = 64;
        let immediate = engine
            .evaluate(&ctx)
            .into_iter()
            .find(|c| c.strategy == RollbackStrategy::Immediate)
            .unwrap();
        assert!(!immediate.valid);
        assert!(immediate.rejection.unwrap().contains("load"));
    }

    #[test]
    fn test_fallback_to_default_when_nothing_validates() {
        let engine = RollbackStrategyEngine::new(StrategyPolicy {
            immediate_max_items: 0,
            ..StrategyPolicy::default()
        });
        let ctx = StrategyContext {
            processed_items: 1,
            succeeded_items: 1,
            compensable_items: 0,
            ..StrategyContext::default()
        };
        let choice = engine.choose(&ctx);
        assert!(choice.fallback);
        assert_eq!(choice.strategy, RollbackStrategy::Immediate);
        assert!(choice.rationale.contains("no strategy validated"));
    }

    #[test]
    fn test_higher_priority_never_lowers_score() {
        let engine = RollbackStrategyEngine::default();
        let mut ctx = context();
        let normal = engine.choose(&ctx).score;
        ctx.priority = BusinessPriority::Critical;
        let critical = engine.choose(&ctx).score;
        assert!(critical >= normal);
    }

    #[test]
    fn test_risk_penalty_applies() {
        let engine = RollbackStrategyEngine::default();
        let estimate = engine.estimate(RollbackStrategy::Partial, &context());
        let low = engine.score(RollbackStrategy::Partial, &estimate, &context(), RiskLevel::Low);
        let critical =
            engine.score(RollbackStrategy::Partial, &estimate, &context(), RiskLevel::Critical);
        assert!((low - critical - 25.0).abs() < 1e-9);
    }
}
