use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Lock conflict: resource '{resource}' is held by {holder}")]
    LockConflict { resource: String, holder: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Snapshot too large: {size_bytes} bytes exceeds the {limit_bytes} byte ceiling")]
    SnapshotTooLarge { size_bytes: usize, limit_bytes: usize },

    #[error("Operation '{item_id}' failed: {message}")]
    OperationFailure { item_id: String, message: String },

    #[error("Rollback of {transaction_id} failed: {message}")]
    RollbackFailure {
        transaction_id: String,
        message: String,
    },

    #[error("Participant '{participant_id}' failed during {phase}: {message}")]
    ParticipantFailure {
        participant_id: String,
        phase: String,
        message: String,
    },

    #[error(
        "Distributed transaction {transaction_id} needs manual intervention, inconsistent participants: {}",
        .participants.join(", ")
    )]
    DistributedInconsistency {
        transaction_id: String,
        participants: Vec<String>,
    },

    #[error("Transaction '{0}' not found")]
    TransactionNotFound(String),

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Checksum mismatch for snapshot '{snapshot_id}': expected {expected:016x}, computed {actual:016x}")]
    ChecksumMismatch {
        snapshot_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Transaction '{0}' timed out")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl TxError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Lock conflicts and timeouts are transient. Everything else needs the
    /// caller to change the request (validation, size) or is terminal
    /// (rollback failure, participant inconsistency).
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::LockConflict { .. } | TxError::Timeout(_))
    }

    /// Whether this error leaves state that needs manual attention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TxError::RollbackFailure { .. } | TxError::DistributedInconsistency { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TxError>;

impl From<std::io::Error> for TxError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let conflict = TxError::LockConflict {
            resource: "doc-1".into(),
            holder: "txn_a".into(),
        };
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal());

        let validation = TxError::Validation("empty item list".into());
        assert!(!validation.is_retryable());

        let rollback = TxError::RollbackFailure {
            transaction_id: "txn_a".into(),
            message: "inverse failed".into(),
        };
        assert!(rollback.is_fatal());
        assert!(!rollback.is_retryable());
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = TxError::DependencyCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
