//! Query errors
//!
//! A failing archive never fails a query on its own: it turns into a partial
//! result. Errors surface only for bad requests or when no tier could answer.

use strata_core::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] strata_core::Error),

    #[error("No tier could answer the query: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] strata_storage::Error),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::InvalidRange { .. } => ErrorKind::InvalidInput,
            QueryError::InvalidQuery(e) => e.kind(),
            QueryError::Unavailable(_) => ErrorKind::ArchiveUnavailable,
            QueryError::Storage(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            QueryError::InvalidRange { start: 2, end: 1 }.kind(),
            ErrorKind::InvalidInput
        );
        let err = QueryError::from(strata_core::Error::InvalidMatcher("{}".into()));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            QueryError::Unavailable("both tiers failed".into()).kind(),
            ErrorKind::ArchiveUnavailable
        );
    }
}
