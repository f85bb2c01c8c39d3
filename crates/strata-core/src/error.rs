//! Error Types for Strata
//!
//! This module defines the errors raised while building, parsing and validating
//! the core data model: block files, series keys, matchers and resolutions.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `InvalidMagic`: Block file doesn't start/end with the expected magic bytes ("STBK")
//! - `CrcMismatch`: A chunk or the index failed its checksum
//! - `InvalidBlock`: Malformed block data (truncated, bad varints, wrong point kind)
//!
//! ### Version/Compatibility Errors
//! - `UnsupportedVersion`: Block was written by a newer format version
//! - `InvalidCompression`: Unknown compression id
//! - `InvalidResolution`: Unknown resolution id or name
//!
//! ### Input Errors
//! - `InvalidSeriesKey`: Empty label set, empty label names
//! - `InvalidMatcher`: Matcher expression that can't be parsed
//!
//! ## ErrorKind
//!
//! Every error across the workspace maps onto one [`ErrorKind`]. The kind is what
//! callers branch on: write rejections, retryable archive faults, lease loss and
//! corruption are handled differently, regardless of which crate raised them.

use thiserror::Error;

/// Classification shared by all Strata crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Sample older than the open block start or not newer than its series' last sample.
    OutOfOrder,
    /// Block upload exhausted its attempts; the block stays local and is retried later.
    ShipFailed,
    /// Compactor lease lost while a compaction was in flight.
    CompactionConflict,
    /// Object archive could not be reached after retries.
    ArchiveUnavailable,
    /// Checksum or structural failure while decoding a block.
    CorruptBlock,
    /// Malformed request (matcher, labels, config).
    InvalidInput,
    /// Anything else.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::OutOfOrder => "out_of_order",
            ErrorKind::ShipFailed => "ship_failed",
            ErrorKind::CompactionConflict => "compaction_conflict",
            ErrorKind::ArchiveUnavailable => "archive_unavailable",
            ErrorKind::CorruptBlock => "corrupt_block",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u16),

    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("CRC mismatch in {0}")]
    CrcMismatch(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid series key: {0}")]
    InvalidSeriesKey(String),

    #[error("Invalid matcher: {0}")]
    InvalidMatcher(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMagic
            | Error::UnsupportedVersion(_)
            | Error::InvalidCompression(_)
            | Error::CrcMismatch(_)
            | Error::InvalidBlock(_)
            | Error::Decompression(_) => ErrorKind::CorruptBlock,
            Error::InvalidResolution(_)
            | Error::InvalidSeriesKey(_)
            | Error::InvalidMatcher(_) => ErrorKind::InvalidInput,
            Error::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
