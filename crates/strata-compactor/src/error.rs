//! Compactor errors
//!
//! Lease problems map to `CompactionConflict`: the current cycle stops and the
//! next lease holder re-plans from the archive. Storage errors keep their own
//! kind.

use strata_core::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompactorError>;

#[derive(Debug, Error)]
pub enum CompactorError {
    #[error("Compactor lease held by {holder} until {expires_at_ms}")]
    LeaseHeld { holder: String, expires_at_ms: i64 },

    #[error("Compactor lease lost: {0}")]
    LeaseLost(String),

    #[error("Output verification failed for block {block_id}: {reason}")]
    Verification { block_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] strata_storage::Error),

    #[error("Block format error: {0}")]
    Format(#[from] strata_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CompactorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompactorError::LeaseHeld { .. } | CompactorError::LeaseLost(_) => {
                ErrorKind::CompactionConflict
            }
            CompactorError::Verification { .. } => ErrorKind::ArchiveUnavailable,
            CompactorError::Storage(e) => e.kind(),
            CompactorError::Format(e) => e.kind(),
            CompactorError::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::CompactionConflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert!(CompactorError::LeaseLost("renewal failed".into()).is_conflict());
        assert!(CompactorError::LeaseHeld {
            holder: "other".into(),
            expires_at_ms: 10,
        }
        .is_conflict());

        let err = CompactorError::from(strata_storage::Error::NotFound("x".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
        let err = CompactorError::from(strata_core::Error::CrcMismatch("chunk".into()));
        assert_eq!(err.kind(), ErrorKind::CorruptBlock);
    }
}
