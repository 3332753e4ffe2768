use crate::cascade::CascadeMode;
use crate::core::{
    BusinessPriority, RiskLevel, RollbackStrategy, SnapshotId, TransactionId, Urgency,
};
use crate::snapshot::CaptureMode;
use std::time::Duration;

/// Per-transaction settings passed to `begin`.
///
/// Unset values fall back to the engine's policies.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOptions {
    pub timeout: Option<Duration>,
    /// Roll back on the first failed item.
    pub fail_fast: bool,
    /// Commit only when every item succeeded.
    pub require_all_success: bool,
    pub min_success_ratio: Option<f64>,
    pub snapshot_mode: CaptureMode,
    pub base_snapshot: Option<SnapshotId>,
    /// Upstream transactions this one builds on. Rolling back an upstream
    /// transaction with the cascade strategy rolls this one back too.
    pub depends_on: Vec<TransactionId>,
    pub priority: BusinessPriority,
    pub urgency: Urgency,
    /// Overrides the assessed risk tier.
    pub risk: Option<RiskLevel>,
    /// Skips strategy scoring.
    pub forced_strategy: Option<RollbackStrategy>,
    /// Skips cascade mode scoring.
    pub forced_cascade_mode: Option<CascadeMode>,
    /// How long `begin` waits for held locks.
    pub lock_wait: Option<Duration>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            fail_fast: false,
            require_all_success: false,
            min_success_ratio: None,
            snapshot_mode: CaptureMode::Full,
            base_snapshot: None,
            depends_on: Vec::new(),
            priority: BusinessPriority::default(),
            urgency: Urgency::default(),
            risk: None,
            forced_strategy: None,
            forced_cascade_mode: None,
            lock_wait: None,
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_require_all_success(mut self, require_all_success: bool) -> Self {
        self.require_all_success = require_all_success;
        self
    }

    pub fn with_min_success_ratio(mut self, ratio: f64) -> Self {
        self.min_success_ratio = Some(ratio);
        self
    }

    pub fn with_snapshot_mode(mut self, mode: CaptureMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    pub fn with_base_snapshot(mut self, snapshot_id: SnapshotId) -> Self {
        self.base_snapshot = Some(snapshot_id);
        self
    }

    pub fn with_dependency(mut self, upstream: TransactionId) -> Self {
        if !self.depends_on.contains(&upstream) {
            self.depends_on.push(upstream);
        }
        self
    }

    pub fn with_priority(mut self, priority: BusinessPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_strategy(mut self, strategy: RollbackStrategy) -> Self {
        self.forced_strategy = Some(strategy);
        self
    }

    pub fn with_cascade_mode(mut self, mode: CascadeMode) -> Self {
        self.forced_cascade_mode = Some(mode);
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    /// Success ratio required to commit. `require_all_success` forces 1.0.
    pub fn effective_success_ratio(&self, default_ratio: f64) -> f64 {
        if self.require_all_success {
            return 1.0;
        }
        self.min_success_ratio
            .unwrap_or(default_ratio)
            .clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_all_success_overrides_ratio() {
        let options = TransactionOptions::new()
            .with_min_success_ratio(0.5)
            .with_require_all_success(true);
        assert_eq!(options.effective_success_ratio(0.8), 1.0);
        assert_eq!(TransactionOptions::new().effective_success_ratio(0.8), 0.8);
        assert_eq!(
            TransactionOptions::new()
                .with_min_success_ratio(3.0)
                .effective_success_ratio(0.8),
            1.0
        );
    }

    #[test]
    fn test_dependency_is_not_duplicated() {
        let upstream = TransactionId::new();
        let options = TransactionOptions::new()
            .with_dependency(upstream)
            .with_dependency(upstream);
        assert_eq!(options.depends_on, vec![upstream]);
    }
}
