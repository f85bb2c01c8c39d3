//! Strata Compactor
//!
//! Background maintenance of the object archive, run by a single lease holder:
//!
//! - **Compaction**: merges the blocks of a closed UTC day into one larger block
//!   per resolution, resolving duplicate samples last-write-wins
//! - **Downsampling**: folds raw blocks into 5m summaries and 5m into 1h
//! - **Retention**: deletes blocks past their resolution's retention
//! - **Sweep**: removes superseded inputs, orphaned uploads and quarantined
//!   blocks that can be rebuilt
//!
//! ## Crash Safety
//!
//! Outputs are committed before their inputs are deleted, and a committed output
//! hides its inputs from readers through its `sources`. Whatever phase a
//! compactor dies in, readers see every sample exactly once and the next lease
//! holder finishes the job.
//!
//! ## Example
//!
//! ```ignore
//! let compactor = Arc::new(Compactor::new(archive.clone(), manifest, config));
//! let leases = Arc::new(ObjectStoreLeaseStore::new(archive));
//! let service = Arc::new(CompactorService::new(compactor, leases));
//! let handle = service.start(shutdown_rx);
//! ```

pub mod compactor;
pub mod config;
pub mod error;
pub mod lease;
pub mod planner;
pub mod service;

pub use compactor::{Compactor, CycleReport};
pub use config::CompactorConfig;
pub use error::{CompactorError, Result};
pub use lease::{
    InMemoryLeaseStore, LeaseGuard, LeaseRecord, LeaseStore, ObjectStoreLeaseStore, LEASE_PATH,
};
pub use planner::{plan_compaction, plan_downsampling, CompactionGroup, DownsampleTask};
pub use service::CompactorService;
