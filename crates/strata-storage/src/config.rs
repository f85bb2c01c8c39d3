//! Storage Configuration
//!
//! ## StoreConfig
//!
//! Controls the local Block Store:
//!
//! - **data_dir**: Directory holding sealed block files and their state sidecars
//! - **seal_interval**: Open block is sealed at the next multiple of this interval (default: 2h)
//! - **max_open_block_samples**: Seal early once the open block holds this many samples (default: 1M)
//! - **local_retention**: Shipped blocks stay on disk this long for fast queries (default: 24h)
//! - **compression**: Chunk compression for sealed blocks (default: lz4)
//! - **maintenance_interval**: How often seal and eviction checks run (default: 10s)
//! - **max_future_skew**: Samples further than this ahead of the clock are rejected (default: 10m)
//! - **wal**: Write-ahead log for the open block (default: enabled, fsync every 100ms)
//!
//! ## ShipperConfig
//!
//! - **ship_interval**: How often unshipped blocks are retried (default: 30s)
//! - **upload_concurrency**: Uploads in flight at once (default: 4)
//! - **max_attempts**: Upload attempts per block per cycle before `ShipFailed` (default: 5)
//! - **backoff**: Backoff between attempts
//!
//! ## ArchiveConfig / ReaderConfig
//!
//! Retry policy for single archive requests; manifest refresh interval and index
//! cache capacity for remote reads.
//!
//! ## Usage
//!
//! ```ignore
//! let config = StoreConfig {
//!     data_dir: "/var/lib/strata".into(),
//!     seal_interval: Duration::from_secs(3600),
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::Compression;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(with = "humantime_serde", default = "default_seal_interval")]
    pub seal_interval: Duration,

    #[serde(default = "default_max_open_block_samples")]
    pub max_open_block_samples: usize,

    #[serde(with = "humantime_serde", default = "default_local_retention")]
    pub local_retention: Duration,

    #[serde(default)]
    pub compression: Compression,

    #[serde(with = "humantime_serde", default = "default_maintenance_interval")]
    pub maintenance_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_max_future_skew")]
    pub max_future_skew: Duration,

    #[serde(default)]
    pub wal: WalConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            seal_interval: default_seal_interval(),
            max_open_block_samples: default_max_open_block_samples(),
            local_retention: default_local_retention(),
            compression: Compression::default(),
            maintenance_interval: default_maintenance_interval(),
            max_future_skew: default_max_future_skew(),
            wal: WalConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_seal_interval() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_max_open_block_samples() -> usize {
    1_000_000
}

fn default_local_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_future_skew() -> Duration {
    Duration::from_secs(10 * 60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Log open-block samples under `data_dir/wal`
    #[serde(default = "default_wal_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: default_wal_enabled(),
            sync_policy: SyncPolicy::default(),
        }
    }
}

fn default_wal_enabled() -> bool {
    true
}

/// When the write-ahead log calls fsync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncPolicy {
    /// After every append
    Always,

    /// On the first append after `interval` has passed, and on maintenance ticks
    Interval {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },

    /// Leave it to the OS
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Interval {
            interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipperConfig {
    #[serde(with = "humantime_serde", default = "default_ship_interval")]
    pub ship_interval: Duration,

    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_upload_backoff")]
    pub backoff: RetryPolicy,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            ship_interval: default_ship_interval(),
            upload_concurrency: default_upload_concurrency(),
            max_attempts: default_max_attempts(),
            backoff: default_upload_backoff(),
        }
    }
}

fn default_ship_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_upload_backoff() -> RetryPolicy {
    RetryPolicy::new(0, Duration::from_millis(200), Duration::from_secs(30), 2.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Retries for individual archive requests
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(with = "humantime_serde", default = "default_manifest_refresh_interval")]
    pub manifest_refresh_interval: Duration,

    /// Block indexes kept in memory
    #[serde(default = "default_index_cache_capacity")]
    pub index_cache_capacity: usize,

    /// Blocks read concurrently by one query
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            manifest_refresh_interval: default_manifest_refresh_interval(),
            index_cache_capacity: default_index_cache_capacity(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

fn default_manifest_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_index_cache_capacity() -> usize {
    1024
}

fn default_read_concurrency() -> usize {
    8
}
