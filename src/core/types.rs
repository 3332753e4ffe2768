use super::{Result, TxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = TxError;

            /// Accepts both the prefixed display form and a bare uuid.
            fn from_str(s: &str) -> Result<Self> {
                let raw = s.strip_prefix($prefix).unwrap_or(s);
                Uuid::parse_str(raw).map(Self).map_err(|err| {
                    TxError::Validation(format!(
                        "invalid {} '{}': {}",
                        stringify!($name),
                        s,
                        err
                    ))
                })
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of a batch transaction.
    TransactionId,
    "txn_"
);
uuid_id!(
    /// Unique identifier of a captured snapshot.
    SnapshotId,
    "snap_"
);
uuid_id!(
    /// Unique identifier of a two-phase-commit transaction.
    DistributedTransactionId,
    "dtx_"
);

/// Kind of mutation an item performs on its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
        }
    }

    /// Delete and move drop or relocate existing data.
    pub fn is_destructive(&self) -> bool {
        matches!(self, OperationType::Delete | OperationType::Move)
    }

    /// Relative exposure of leaving this operation applied after a failure.
    pub fn risk_weight(&self) -> f64 {
        match self {
            OperationType::Create => 0.2,
            OperationType::Update => 0.4,
            OperationType::Move => 0.6,
            OperationType::Delete => 0.9,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work inside a batch transaction.
///
/// Items are plain values: once captured into a snapshot they are never
/// mutated, only cloned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationItem {
    pub id: String,
    pub operation: OperationType,
    /// Identifier of the resource this item mutates. Used as the lock key.
    pub target: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl OperationItem {
    pub fn new(id: impl Into<String>, operation: OperationType, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation,
            target: target.into(),
            dependencies: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn create(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, OperationType::Create, target)
    }

    pub fn update(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, OperationType::Update, target)
    }

    pub fn delete(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, OperationType::Delete, target)
    }

    pub fn moved(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, OperationType::Move, target)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Numeric `priority` field of the payload, when present.
    pub fn priority(&self) -> Option<f64> {
        self.payload.get("priority").and_then(|v| v.as_f64())
    }

    /// Prior value of the target, carried in the payload under `previous`.
    pub fn previous_state(&self) -> Option<&serde_json::Value> {
        self.payload.get("previous").filter(|v| !v.is_null())
    }

    /// Origin location of a move, carried in the payload under `from`.
    pub fn move_origin(&self) -> Option<&str> {
        self.payload.get("from").and_then(|v| v.as_str())
    }
}

/// Business importance a caller attaches to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusinessPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl BusinessPriority {
    pub fn multiplier(&self) -> f64 {
        match self {
            BusinessPriority::Low => 0.9,
            BusinessPriority::Normal => 1.0,
            BusinessPriority::High => 1.1,
            BusinessPriority::Critical => 1.2,
        }
    }
}

/// How quickly the caller needs a failed transaction unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Risk tier of a rollback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Score penalty applied before exposure scaling.
    pub fn penalty(&self) -> f64 {
        match self {
            RiskLevel::Low => 0.0,
            RiskLevel::Medium => 5.0,
            RiskLevel::High => 12.0,
            RiskLevel::Critical => 25.0,
        }
    }

    /// Deterministic assessment from failure ratio, the share of
    /// destructive operations and the number of dependent transactions.
    pub fn assess(failure_ratio: f64, destructive_ratio: f64, dependents: usize) -> Self {
        let dependents_factor = dependents.min(10) as f64 / 10.0;
        let score = failure_ratio.clamp(0.0, 1.0) * 0.5
            + destructive_ratio.clamp(0.0, 1.0) * 0.3
            + dependents_factor * 0.2;
        if score < 0.25 {
            RiskLevel::Low
        } else if score < 0.5 {
            RiskLevel::Medium
        } else if score < 0.75 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Approach used to undo a failed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Undo every processed item now.
    Immediate,
    /// Undo a selected subset of items.
    Partial,
    /// Undo this transaction and every transaction depending on it.
    Cascade,
    /// Run semantic inverse actions instead of literal undo.
    Compensating,
}

impl RollbackStrategy {
    pub const ALL: [RollbackStrategy; 4] = [
        RollbackStrategy::Immediate,
        RollbackStrategy::Partial,
        RollbackStrategy::Cascade,
        RollbackStrategy::Compensating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStrategy::Immediate => "immediate",
            RollbackStrategy::Partial => "partial",
            RollbackStrategy::Cascade => "cascade",
            RollbackStrategy::Compensating => "compensating",
        }
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
