use crate::domain::account::UserId;
use crate::domain::ledger::BillingCycleId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Authentication failed: {0}")]
    AuthFailure(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Unknown user {0}")]
    UnknownUser(String),
    #[error("Unknown task {0}")]
    UnknownTask(String),
    #[error("Task {task} is not assigned to {user}")]
    AssignmentMismatch { task: String, user: String },
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Billing cycle {cycle} closed with {} unpaid accounts", failed.len())]
    CloseIncomplete {
        cycle: BillingCycleId,
        failed: Vec<UserId>,
    },
    #[error("Upstream service unavailable: {0}")]
    Upstream(String),
    #[error("Storage failure: {0}")]
    StorageFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
}

impl LedgerError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure(Box::new(std::io::Error::other(message.into())))
    }

    /// Whether the ingress should redeliver the triggering event later.
    ///
    /// Referential errors resolve once the referent arrives; storage failures
    /// left no partial state behind, so the whole operation can be replayed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownUser(_) | Self::UnknownTask(_) | Self::StorageFailure(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDbError(_) => true,
            _ => false,
        }
    }

    /// Whether the failure only means a referenced user or task has not been
    /// mirrored yet.
    pub fn is_referential(&self) -> bool {
        matches!(self, Self::UnknownUser(_) | Self::UnknownTask(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LedgerError::UnknownUser("u1".into()).is_retryable());
        assert!(LedgerError::UnknownTask("t1".into()).is_retryable());
        assert!(LedgerError::storage("disk full").is_retryable());
        assert!(!LedgerError::ValidationError("bad".into()).is_retryable());
        assert!(
            !LedgerError::AssignmentMismatch {
                task: "t1".into(),
                user: "u2".into()
            }
            .is_retryable()
        );
        assert!(!LedgerError::Codec("truncated".into()).is_retryable());
        assert!(!LedgerError::Upstream("auth down".into()).is_retryable());

        assert!(LedgerError::UnknownTask("t1".into()).is_referential());
        assert!(!LedgerError::storage("disk full").is_referential());
    }

    #[test]
    fn test_close_incomplete_message() {
        let err = LedgerError::CloseIncomplete {
            cycle: 3,
            failed: vec![1, 2],
        };
        assert_eq!(err.to_string(), "Billing cycle 3 closed with 2 unpaid accounts");
    }
}
