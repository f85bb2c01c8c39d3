use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Write Path / Block Store Metrics
    // ============================================================================

    /// Samples accepted into the open block
    pub static ref SAMPLES_APPENDED_TOTAL: IntCounter = IntCounter::new(
        "strata_samples_appended_total",
        "Total samples appended to the open block"
    ).expect("metric can be created");

    /// Samples rejected on the write path
    pub static ref SAMPLES_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_samples_rejected_total", "Total samples rejected"),
        &["reason"] // out_of_order, future_timestamp, invalid_input
    ).expect("metric can be created");

    /// Samples currently held in the open block
    pub static ref OPEN_BLOCK_SAMPLES: IntGauge = IntGauge::new(
        "strata_open_block_samples",
        "Samples in the open block"
    ).expect("metric can be created");

    /// Blocks sealed by the Block Store
    pub static ref BLOCKS_SEALED_TOTAL: IntCounter = IntCounter::new(
        "strata_blocks_sealed_total",
        "Total blocks sealed"
    ).expect("metric can be created");

    /// Sealed blocks present on local disk
    pub static ref LOCAL_BLOCKS: IntGauge = IntGauge::new(
        "strata_local_blocks",
        "Sealed blocks present locally"
    ).expect("metric can be created");

    /// Sealed blocks not yet shipped to the archive
    pub static ref UNSHIPPED_BLOCKS: IntGauge = IntGauge::new(
        "strata_unshipped_blocks",
        "Sealed blocks waiting to be shipped"
    ).expect("metric can be created");

    /// Local blocks evicted after shipping and retention
    pub static ref BLOCKS_EVICTED_TOTAL: IntCounter = IntCounter::new(
        "strata_blocks_evicted_total",
        "Total local blocks evicted"
    ).expect("metric can be created");

    /// Failed writes to the open block's write-ahead log
    pub static ref WAL_WRITE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "strata_wal_write_errors_total",
        "Total failed write-ahead log writes"
    ).expect("metric can be created");

    // ============================================================================
    // Shipper Metrics
    // ============================================================================

    /// Blocks shipped, by outcome
    pub static ref BLOCKS_SHIPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_blocks_shipped_total", "Total blocks shipped"),
        &["outcome"] // uploaded, already_present
    ).expect("metric can be created");

    /// Blocks whose upload exhausted the attempt budget
    pub static ref SHIP_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "strata_ship_failures_total",
        "Total block uploads that exhausted their attempts"
    ).expect("metric can be created");

    /// Bytes uploaded as block data
    pub static ref UPLOADED_BYTES_TOTAL: IntCounter = IntCounter::new(
        "strata_uploaded_bytes_total",
        "Total block bytes uploaded"
    ).expect("metric can be created");

    // ============================================================================
    // Archive Metrics
    // ============================================================================

    /// Archive requests by operation type
    pub static ref ARCHIVE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_archive_requests_total", "Total object archive requests"),
        &["operation"] // put, get, get_ranges, head, list, delete
    ).expect("metric can be created");

    /// Archive errors by type
    pub static ref ARCHIVE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_archive_errors_total", "Total object archive errors"),
        &["operation", "error_type"]
    ).expect("metric can be created");

    /// Archive request latency
    pub static ref ARCHIVE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("strata_archive_latency_seconds", "Object archive latency in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["operation"]
    ).expect("metric can be created");

    /// Visible blocks in the manifest snapshot
    pub static ref MANIFEST_BLOCKS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("strata_manifest_blocks", "Visible archived blocks"),
        &["resolution"]
    ).expect("metric can be created");

    /// Manifest refreshes
    pub static ref MANIFEST_REFRESHES_TOTAL: IntCounter = IntCounter::new(
        "strata_manifest_refreshes_total",
        "Total archive manifest refreshes"
    ).expect("metric can be created");

    /// Block index cache hits
    pub static ref INDEX_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "strata_index_cache_hits_total",
        "Total block index cache hits"
    ).expect("metric can be created");

    /// Block index cache misses
    pub static ref INDEX_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "strata_index_cache_misses_total",
        "Total block index cache misses"
    ).expect("metric can be created");

    /// Blocks found corrupt and quarantined
    pub static ref CORRUPT_BLOCKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_corrupt_blocks_total", "Total blocks quarantined as corrupt"),
        &["resolution"]
    ).expect("metric can be created");

    // ============================================================================
    // Compactor Metrics
    // ============================================================================

    /// Whether this process holds the compactor lease
    pub static ref COMPACTOR_LEASE_HELD: IntGauge = IntGauge::new(
        "strata_compactor_lease_held",
        "1 when this process holds the compactor lease"
    ).expect("metric can be created");

    /// Compactions by outcome
    pub static ref COMPACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_compactions_total", "Total compaction runs"),
        &["outcome"] // completed, conflict, failed
    ).expect("metric can be created");

    /// Downsampled blocks written
    pub static ref DOWNSAMPLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_downsamples_total", "Total downsampled blocks written"),
        &["resolution"]
    ).expect("metric can be created");

    /// Archived blocks deleted
    pub static ref BLOCKS_DELETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_blocks_deleted_total", "Total archived blocks deleted"),
        &["reason"] // compacted, retention, orphan, quarantine
    ).expect("metric can be created");

    /// Compaction duration
    pub static ref COMPACTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("strata_compaction_duration_seconds", "Compaction duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        &["kind"] // compact, downsample
    ).expect("metric can be created");

    // ============================================================================
    // Query Metrics
    // ============================================================================

    /// Queries by resolution
    pub static ref QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_queries_total", "Total federated queries"),
        &["resolution"]
    ).expect("metric can be created");

    /// Queries answered without the archive tier
    pub static ref PARTIAL_QUERIES_TOTAL: IntCounter = IntCounter::new(
        "strata_partial_queries_total",
        "Total queries returning partial results"
    ).expect("metric can be created");

    /// Query latency
    pub static ref QUERY_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("strata_query_latency_seconds", "Query latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["resolution"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn Collector>> = vec![
            // Write path
            Box::new(SAMPLES_APPENDED_TOTAL.clone()),
            Box::new(SAMPLES_REJECTED_TOTAL.clone()),
            Box::new(OPEN_BLOCK_SAMPLES.clone()),
            Box::new(BLOCKS_SEALED_TOTAL.clone()),
            Box::new(LOCAL_BLOCKS.clone()),
            Box::new(UNSHIPPED_BLOCKS.clone()),
            Box::new(BLOCKS_EVICTED_TOTAL.clone()),
            Box::new(WAL_WRITE_ERRORS_TOTAL.clone()),
            // Shipper
            Box::new(BLOCKS_SHIPPED_TOTAL.clone()),
            Box::new(SHIP_FAILURES_TOTAL.clone()),
            Box::new(UPLOADED_BYTES_TOTAL.clone()),
            // Archive
            Box::new(ARCHIVE_REQUESTS_TOTAL.clone()),
            Box::new(ARCHIVE_ERRORS_TOTAL.clone()),
            Box::new(ARCHIVE_LATENCY.clone()),
            Box::new(MANIFEST_BLOCKS.clone()),
            Box::new(MANIFEST_REFRESHES_TOTAL.clone()),
            Box::new(INDEX_CACHE_HITS_TOTAL.clone()),
            Box::new(INDEX_CACHE_MISSES_TOTAL.clone()),
            Box::new(CORRUPT_BLOCKS_TOTAL.clone()),
            // Compactor
            Box::new(COMPACTOR_LEASE_HELD.clone()),
            Box::new(COMPACTIONS_TOTAL.clone()),
            Box::new(DOWNSAMPLES_TOTAL.clone()),
            Box::new(BLOCKS_DELETED_TOTAL.clone()),
            Box::new(COMPACTION_DURATION.clone()),
            // Query
            Box::new(QUERIES_TOTAL.clone()),
            Box::new(PARTIAL_QUERIES_TOTAL.clone()),
            Box::new(QUERY_LATENCY.clone()),
        ];

        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric can be registered");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        // Vec metrics only show up once a label set has been touched
        assert!(names.contains(&"strata_open_block_samples".to_string()));
        assert!(names.contains(&"strata_samples_appended_total".to_string()));
    }

    #[test]
    fn test_labelled_counters() {
        BLOCKS_DELETED_TOTAL.with_label_values(&["retention"]).inc_by(3);
        assert!(BLOCKS_DELETED_TOTAL.with_label_values(&["retention"]).get() >= 3);

        ARCHIVE_REQUESTS_TOTAL.with_label_values(&["put"]).inc();
        assert!(ARCHIVE_REQUESTS_TOTAL.with_label_values(&["put"]).get() >= 1);
    }
}
