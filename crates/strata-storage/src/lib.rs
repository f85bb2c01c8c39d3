//! Strata Storage Layer
//!
//! Everything between an appended sample and a block readable from object
//! storage: the block file format, the local Block Store, the shipper that moves
//! sealed blocks to the archive, the archive manifest and the remote reader.
//!
//! ## Architecture Overview
//!
//! ```text
//!   samples
//!      │ append
//!      ▼
//! ┌──────────────┐  seal   ┌──────────────┐  ship   ┌──────────────────┐
//! │  BlockStore  │ ──────▶ │ sealed block │ ──────▶ │  Object Archive  │
//! │  open block  │         │ (local disk) │ Shipper │ blocks/<res>/<id>│
//! └──────┬───────┘         └──────┬───────┘         └────────┬─────────┘
//!        │ query (local)          │ evict after ship         │ list
//!        │                        │ + local retention        ▼
//!        │                        ▼                  ┌──────────────────┐
//!        │                     (gone)                │     Manifest     │
//!        │                                           │ (ArcSwap snapshot)│
//!        │                                           └────────┬─────────┘
//!        │                                                    │
//!        │                                         ┌──────────▼─────────┐
//!        │                                         │ RemoteBlockReader  │
//!        │                                         │ footer/index/chunk │
//!        │                                         │ ranged GETs        │
//!        ▼                                         └──────────┬─────────┘
//!   query federation (strata-query) ◀─────────────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### BlockWriter / BlockReader
//! Encode and decode immutable block files: per-series chunks (delta + varint
//! timestamps, LZ4), an index of chunk byte ranges and a footer locating the
//! index. Every chunk and the index carry a CRC32.
//!
//! ### BlockStore
//! The local tier: one open block taking appends, sealed blocks on disk until
//! they are shipped and older than the local retention. Open-block samples are
//! logged to a write-ahead log and replayed on restart.
//!
//! ### Shipper
//! Uploads sealed blocks through an explicit upload state machine with
//! backoff. Idempotent: the external id is derived from block content.
//!
//! ### ArchiveClient
//! Retrying, instrumented access to any [`ObjectArchive`], plus the archive
//! layout (`blocks/<resolution>/<id>/{block,meta.json,quarantine}`).
//!
//! ### Manifest / RemoteBlockReader
//! Snapshot of committed archive blocks with lineage and quarantine applied, and
//! the reader serving queries from it with ranged reads.

pub mod archive;
pub mod block;
pub mod config;
pub mod error;
pub mod manifest;
pub mod remote;
pub mod retry;
pub mod shipper;
pub mod store;
pub mod upload;
pub mod wal;

pub use archive::{
    block_data_path, block_meta_path, block_quarantine_path, ArchiveClient, BlockObjects,
    ObjectArchive, ObjectInfo, ObjectStoreArchive, ObjectVersion, PutCondition,
};
pub use block::{BlockReader, BlockWriter, EncodedBlock};
pub use config::{ArchiveConfig, ReaderConfig, ShipperConfig, StoreConfig, SyncPolicy, WalConfig};
pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestEntry, ManifestSnapshot, UncommittedBlock};
pub use remote::{RemoteBlockReader, RemoteRead};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use shipper::{ShipOutcome, ShipReport, Shipper};
pub use store::{AppendStatus, BlockStore, LocalBlock, StoreStats};
pub use upload::{BlockUpload, UploadState};
pub use wal::Wal;
