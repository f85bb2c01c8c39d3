//! Storage Error Types
//!
//! This module defines all error types that can occur in the storage layer.
//!
//! ## Error Categories
//!
//! ### Write Path Errors
//! - `OutOfOrder`: Sample rejected by the open block
//! - `FutureTimestamp`: Sample too far ahead of the local clock
//!
//! ### Archive Errors
//! - `ShipFailed`: Block upload exhausted its attempt budget
//! - `ArchiveUnavailable`: Archive operation still failing after retries
//! - `ObjectStore`: Low-level object store operation failed
//! - `NotFound`: Object or block does not exist
//! - `AlreadyExists` / `Precondition`: Conditional put lost the race
//!
//! ### Block Errors
//! - `Format`: Block bytes failed to encode or decode (see `strata_core::Error`)
//! - `CorruptBlock`: Block failed validation and was quarantined
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. Callers that need to branch on the failure class use
//! [`Error::kind`].

use strata_core::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Sample out of order for {series}: timestamp {timestamp}, {reason}")]
    OutOfOrder {
        series: String,
        timestamp: i64,
        reason: &'static str,
    },

    #[error("Sample for {series} too far in the future: timestamp {timestamp}, limit {limit}")]
    FutureTimestamp {
        series: String,
        timestamp: i64,
        limit: i64,
    },

    #[error("Shipping block {block_id} failed after {attempts} attempts: {last_error}")]
    ShipFailed {
        block_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Archive unavailable during {operation}: {source}")]
    ArchiveUnavailable {
        operation: &'static str,
        #[source]
        source: object_store::Error,
    },

    #[error("Corrupt block {block_id}: {source}")]
    CorruptBlock {
        block_id: String,
        #[source]
        source: strata_core::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Block format error: {0}")]
    Format(#[from] strata_core::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            Error::FutureTimestamp { .. } => ErrorKind::InvalidInput,
            Error::ShipFailed { .. } => ErrorKind::ShipFailed,
            Error::ArchiveUnavailable { .. } | Error::ObjectStore(_) => {
                ErrorKind::ArchiveUnavailable
            }
            Error::CorruptBlock { .. } => ErrorKind::CorruptBlock,
            Error::Format(e) => e.kind(),
            Error::NotFound(_)
            | Error::AlreadyExists(_)
            | Error::Precondition(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether an archive operation failing with this error may succeed if retried
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ObjectStore(e) | Error::ArchiveUnavailable { source: e, .. } => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::AlreadyExists { .. }
                    | object_store::Error::Precondition { .. }
                    | object_store::Error::NotModified { .. }
                    | object_store::Error::NotImplemented
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this is a block corruption error
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::CorruptBlock
    }
}
