//! Strata Observability
//!
//! One Prometheus registry shared by every Strata crate: write path, shipper,
//! archive client, compactor and query engine all record into the statics in
//! [`metrics`]. The server merges [`create_metrics_router`] into its API so the
//! registry is scraped at `/metrics`.
//!
//! ```no_run
//! strata_observability::init();
//! let router = strata_observability::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::create_metrics_router;
pub use metrics::REGISTRY;

/// Register every metric with [`REGISTRY`]. Idempotent.
pub fn init() {
    metrics::init();
}
