//! Integration tests for compaction, downsampling, retention and the lease

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use strata_compactor::{
    Compactor, CompactorConfig, CompactorService, InMemoryLeaseStore, LeaseGuard, LeaseStore,
};
use strata_core::{
    BlockMeta, Compression, ErrorKind, Point, Resolution, RetentionPolicy, SeriesKey,
    SeriesMatcher,
};
use strata_storage::{
    block_data_path, block_meta_path, ArchiveClient, BlockReader, BlockWriter, Manifest,
    ObjectArchive, ObjectInfo, ObjectStoreArchive, ObjectVersion, PutCondition, ReaderConfig,
    RemoteBlockReader, Result, RetryPolicy,
};

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

fn cpu(host: &str) -> SeriesKey {
    SeriesKey::metric("cpu", &[("host", host)]).unwrap()
}

fn archive_over(inner: Arc<dyn ObjectArchive>) -> ArchiveClient {
    ArchiveClient::new(inner, RetryPolicy::immediate(0))
}

/// Write and commit a raw block holding `series`
async fn raw_block(
    archive: &ArchiveClient,
    range: (i64, i64),
    created_at_ms: i64,
    series: &[(&str, &[(i64, f64)])],
) -> BlockMeta {
    let mut writer = BlockWriter::new(Resolution::Raw, Compression::Lz4, range.0, range.1)
        .with_created_at(created_at_ms);
    for (host, points) in series {
        let points = points.iter().map(|(ts, v)| Point::raw(*ts, *v)).collect();
        writer.add_series(cpu(host), points).unwrap();
    }
    let block = writer.finish().unwrap();
    archive
        .put(
            &block_data_path(block.meta.resolution, &block.meta.external_id),
            block.data,
        )
        .await
        .unwrap();
    archive.commit_meta(&block.meta).await.unwrap();
    block.meta
}

async fn read_block(archive: &ArchiveClient, meta: &BlockMeta) -> BlockReader {
    let data = archive
        .get(&block_data_path(meta.resolution, &meta.external_id))
        .await
        .unwrap();
    BlockReader::new(data).unwrap()
}

async fn is_committed(archive: &ArchiveClient, meta: &BlockMeta) -> bool {
    archive
        .exists(&block_meta_path(meta.resolution, &meta.external_id))
        .await
        .unwrap()
        .is_some()
}

async fn lease(store: Arc<dyn LeaseStore>) -> LeaseGuard {
    LeaseGuard::acquire(
        store,
        "test-compactor",
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await
    .unwrap()
}

fn compactor(archive: &ArchiveClient, config: CompactorConfig) -> Compactor {
    Compactor::new(
        archive.clone(),
        Arc::new(Manifest::new(archive.clone())),
        config,
    )
}

#[tokio::test]
async fn test_compaction_is_lossless_and_last_write_wins() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    let first = raw_block(
        &archive,
        (0, HOUR),
        1,
        &[("a", &[(0, 1.0), (60_000, 2.0)]), ("b", &[(0, 5.0)])],
    )
    .await;
    let second = raw_block(
        &archive,
        (60_000, 2 * HOUR),
        2,
        &[("a", &[(60_000, 20.0), (120_000, 3.0)])],
    )
    .await;

    let compactor = compactor(&archive, CompactorConfig::default());
    let guard = lease(Arc::new(InMemoryLeaseStore::new())).await;
    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report.compactions, 1);
    assert_eq!(report.failed, 0);

    let snapshot = compactor.manifest().refresh().await.unwrap();
    let visible = snapshot.visible(Resolution::Raw);
    assert_eq!(visible.len(), 1);
    let output = visible[0].clone();
    assert_eq!(output.level, 1);
    assert_eq!(output.min_time, 0);
    assert_eq!(output.max_time, 2 * HOUR);
    assert!(output.is_derived_from(&first.external_id));
    assert!(output.is_derived_from(&second.external_id));

    // 5 input samples, 4 distinct (series, timestamp) pairs
    assert_eq!(output.sample_count, 4);
    let series = read_block(&archive, &output).await.read_all().unwrap();
    let a = series.iter().find(|s| s.key == cpu("a")).unwrap();
    let values: Vec<(i64, f64)> = a
        .points
        .iter()
        .map(|p| (p.timestamp, p.value.scalar()))
        .collect();
    assert_eq!(values, vec![(0, 1.0), (60_000, 20.0), (120_000, 3.0)]);

    assert!(!is_committed(&archive, &first).await);
    assert!(!is_committed(&archive, &second).await);

    // The compacted day was downsampled in the same cycle
    assert_eq!(report.downsamples, 1);
    assert_eq!(snapshot.visible(Resolution::FiveMinutes).len(), 1);
}

#[tokio::test]
async fn test_open_day_is_left_alone() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    raw_block(&archive, (0, HOUR), 1, &[("a", &[(0, 1.0)])]).await;
    raw_block(&archive, (HOUR, 2 * HOUR), 2, &[("a", &[(HOUR, 1.0)])]).await;

    let compactor = compactor(&archive, CompactorConfig::default());
    let guard = lease(Arc::new(InMemoryLeaseStore::new())).await;

    // Day 0 closes at 24h plus the one hour grace period
    let report = compactor.run_cycle(DAY + 30 * 60_000, &guard).await.unwrap();
    assert_eq!(report.compactions, 0);
    assert_eq!(report.downsamples, 0);
    assert_eq!(compactor.manifest().snapshot().visible(Resolution::Raw).len(), 2);
}

#[tokio::test]
async fn test_split_outputs_are_stable() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    raw_block(&archive, (0, HOUR), 1, &[("a", &[(0, 1.0)]), ("b", &[(0, 2.0)])]).await;
    raw_block(&archive, (HOUR, 2 * HOUR), 2, &[("a", &[(HOUR, 3.0)]), ("c", &[(HOUR, 4.0)])]).await;

    let config = CompactorConfig {
        max_output_series: 1,
        ..Default::default()
    };
    let compactor = compactor(&archive, config);
    let guard = lease(Arc::new(InMemoryLeaseStore::new())).await;

    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report.compactions, 1);

    let snapshot = compactor.manifest().refresh().await.unwrap();
    let outputs = snapshot.visible(Resolution::Raw);
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(|o| o.output_count == 3 && o.series_count == 1));
    let samples: u64 = outputs.iter().map(|o| o.sample_count).sum();
    assert_eq!(samples, 4);

    // Siblings settle the day: one 5m block over all of them, no re-compaction
    assert_eq!(report.downsamples, 1);
    let five = snapshot.visible(Resolution::FiveMinutes);
    assert_eq!(five.len(), 1);
    assert_eq!(five[0].series_count, 3);

    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report.compactions, 0);
    assert_eq!(report.downsamples, 1, "5m day moves on to 1h");
    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_example_scenario_downsamples_to_one_summary() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    // Block A [0, 100s) holding the samples at 0 and 60s
    raw_block(&archive, (0, 100_000), 1, &[("a", &[(0, 1.5), (60_000, 2.5)])]).await;

    let compactor = compactor(&archive, CompactorConfig::default());
    let guard = lease(Arc::new(InMemoryLeaseStore::new())).await;

    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report.compactions, 0);
    assert_eq!(report.downsamples, 1);

    let reader = RemoteBlockReader::new(
        archive.clone(),
        compactor.manifest().clone(),
        ReaderConfig::default(),
    );
    let read = reader
        .read(&SeriesMatcher::metric("cpu"), 0, 120_000, Resolution::FiveMinutes)
        .await
        .unwrap();
    assert_eq!(read.resolution, Resolution::FiveMinutes);
    assert_eq!(read.series.len(), 1);
    assert_eq!(read.series[0].points.len(), 1);
    let summary = read.series[0].points[0].value.as_summary().unwrap();
    assert_eq!(read.series[0].points[0].timestamp, 0);
    assert_eq!(summary.count, 2);
    assert_eq!(summary.sum, 4.0);
    assert_eq!(summary.min, 1.5);
    assert_eq!(summary.max, 2.5);
    assert_eq!(summary.last, 2.5);

    // The raw block stays in its own tier
    let snapshot = compactor.manifest().snapshot();
    assert_eq!(snapshot.visible(Resolution::Raw).len(), 1);

    // Next cycle derives 1h from 5m; after that nothing is left to do
    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report.downsamples, 1);
    let hourly = compactor.manifest().snapshot().visible(Resolution::OneHour)[0].clone();
    let series = read_block(&archive, &hourly).await.read_all().unwrap();
    assert_eq!(series[0].points[0].value.as_summary().unwrap().count, 2);

    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_retention_is_monotonic() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    let old = raw_block(&archive, (0, HOUR), 1, &[("a", &[(0, 1.0)])]).await;
    let recent = raw_block(&archive, (20 * DAY, 20 * DAY + HOUR), 1, &[("a", &[(20 * DAY, 1.0)])]).await;

    let config = CompactorConfig {
        retention: RetentionPolicy {
            raw: Duration::from_secs(30 * 24 * 3600),
            ..Default::default()
        },
        ..Default::default()
    };
    let compactor = compactor(&archive, config);
    compactor.manifest().refresh().await.unwrap();

    assert_eq!(compactor.enforce_retention(20 * DAY).await.unwrap(), 0);

    assert_eq!(compactor.enforce_retention(31 * DAY).await.unwrap(), 1);
    assert!(!is_committed(&archive, &old).await);
    assert!(is_committed(&archive, &recent).await);

    // Going back in time never resurrects or deletes more
    assert_eq!(compactor.enforce_retention(25 * DAY).await.unwrap(), 0);
    assert_eq!(compactor.enforce_retention(31 * DAY).await.unwrap(), 0);

    assert_eq!(compactor.enforce_retention(51 * DAY).await.unwrap(), 1);
    assert!(compactor.manifest().refresh().await.unwrap().is_empty());
}

/// Archive that hands the lease to another holder when a commit marker is written
#[derive(Debug)]
struct LeaseStealingArchive {
    inner: ObjectStoreArchive,
    leases: Arc<InMemoryLeaseStore>,
    armed: AtomicBool,
}

#[async_trait]
impl ObjectArchive for LeaseStealingArchive {
    async fn put(&self, path: &str, data: Bytes, condition: PutCondition) -> Result<ObjectVersion> {
        let version = self.inner.put(path, data, condition).await?;
        if path.ends_with("meta.json") && self.armed.swap(false, Ordering::SeqCst) {
            // Far in the future: our lease has expired by then
            self.leases
                .try_acquire("intruder", Duration::from_secs(30), i64::MAX / 2)
                .await
                .unwrap();
        }
        Ok(version)
    }

    async fn get(&self, path: &str) -> Result<(Bytes, ObjectVersion)> {
        self.inner.get(path).await
    }

    async fn get_ranges(&self, path: &str, ranges: &[std::ops::Range<usize>]) -> Result<Vec<Bytes>> {
        self.inner.get_ranges(path, ranges).await
    }

    async fn head(&self, path: &str) -> Result<ObjectInfo> {
        self.inner.head(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }
}

#[tokio::test]
async fn test_lease_loss_aborts_before_deleting_inputs() {
    let leases = Arc::new(InMemoryLeaseStore::new());
    let stealing = Arc::new(LeaseStealingArchive {
        inner: ObjectStoreArchive::in_memory(),
        leases: leases.clone(),
        armed: AtomicBool::new(false),
    });
    let archive = archive_over(stealing.clone());

    let first = raw_block(&archive, (0, HOUR), 1, &[("a", &[(0, 1.0)])]).await;
    let second = raw_block(&archive, (HOUR, 2 * HOUR), 2, &[("a", &[(HOUR, 2.0)])]).await;
    stealing.armed.store(true, Ordering::SeqCst);

    let compactor = compactor(&archive, CompactorConfig::default());
    let guard = lease(leases.clone()).await;
    let err = compactor.run_cycle(10 * DAY, &guard).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompactionConflict);
    assert!(guard.is_lost());
    assert_eq!(leases.current().await.unwrap().holder, "intruder");

    // Inputs survive, hidden behind the committed output
    assert!(is_committed(&archive, &first).await);
    assert!(is_committed(&archive, &second).await);
    let snapshot = compactor.manifest().refresh().await.unwrap();
    let visible = snapshot.visible(Resolution::Raw);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].sample_count, 2);
    assert_eq!(snapshot.superseded().len(), 2);

    // The next holder sweeps the inputs
    let guard = lease(Arc::new(InMemoryLeaseStore::new())).await;
    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert_eq!(report.swept, 2);
    assert_eq!(report.compactions, 0);
    assert!(!is_committed(&archive, &first).await);
}

#[tokio::test]
async fn test_sweep_removes_stale_orphans_only() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    archive
        .put(&block_data_path(Resolution::Raw, "orphan"), Bytes::from("partial"))
        .await
        .unwrap();

    let compactor = compactor(&archive, CompactorConfig::default());
    compactor.manifest().refresh().await.unwrap();
    let now = strata_core::now_ms();

    assert_eq!(compactor.sweep(now).await.unwrap(), 0);
    assert_eq!(compactor.sweep(now + 7 * HOUR).await.unwrap(), 1);
    assert!(archive.list("blocks/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_quarantined_downsample_is_rebuilt() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    raw_block(&archive, (0, 100_000), 1, &[("a", &[(0, 1.0)])]).await;

    let compactor = compactor(&archive, CompactorConfig::default());
    let guard = lease(Arc::new(InMemoryLeaseStore::new())).await;
    compactor.run_cycle(10 * DAY, &guard).await.unwrap();

    let derived = compactor.manifest().snapshot().visible(Resolution::FiveMinutes)[0].clone();
    archive
        .quarantine(Resolution::FiveMinutes, &derived.external_id, "crc mismatch")
        .await
        .unwrap();

    // Sweep drops the quarantined block, the same cycle derives it again
    let report = compactor.run_cycle(10 * DAY, &guard).await.unwrap();
    assert!(report.swept >= 1);
    assert_eq!(report.downsamples, 1);

    let snapshot = compactor.manifest().refresh().await.unwrap();
    assert!(snapshot.quarantined().is_empty());
    assert_eq!(snapshot.visible(Resolution::FiveMinutes).len(), 1);
}

#[tokio::test]
async fn test_only_one_service_compacts() {
    let archive = archive_over(Arc::new(ObjectStoreArchive::in_memory()));
    raw_block(&archive, (0, HOUR), 1, &[("a", &[(0, 1.0)])]).await;
    raw_block(&archive, (HOUR, 2 * HOUR), 2, &[("a", &[(HOUR, 1.0)])]).await;

    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let leader = CompactorService::new(
        Arc::new(compactor(&archive, CompactorConfig::default())),
        leases.clone(),
    );
    let standby = CompactorService::new(
        Arc::new(compactor(&archive, CompactorConfig::default())),
        leases,
    );
    assert_ne!(leader.holder(), standby.holder());

    let mut leader_lease = None;
    let mut standby_lease = None;
    assert!(leader.run_once(&mut leader_lease).await.unwrap().is_some());
    assert!(standby.run_once(&mut standby_lease).await.unwrap().is_none());
    assert!(leader_lease.is_some());
    assert!(standby_lease.is_none());

    leader_lease.take().unwrap().release().await.unwrap();
    assert!(standby.run_once(&mut standby_lease).await.unwrap().is_some());
}
