//! Integration tests for shipping sealed blocks to the archive

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::{ErrorKind, Resolution, Sample, SeriesKey, SeriesMatcher};
use strata_storage::{
    block_data_path, ArchiveClient, BlockStore, Error, Manifest, ObjectArchive, ObjectInfo,
    ObjectStoreArchive, ObjectVersion, PutCondition, Result, RetryPolicy, ShipOutcome, Shipper,
    ShipperConfig, StoreConfig,
};
use tempfile::TempDir;

/// Archive whose block data puts fail until `failures` is used up
#[derive(Debug)]
struct FlakyArchive {
    inner: ObjectStoreArchive,
    failures: AtomicU32,
    data_puts: AtomicU32,
}

impl FlakyArchive {
    fn new(failures: u32) -> Self {
        Self {
            inner: ObjectStoreArchive::in_memory(),
            failures: AtomicU32::new(failures),
            data_puts: AtomicU32::new(0),
        }
    }

    fn unavailable() -> Error {
        Error::ObjectStore(object_store::Error::Generic {
            store: "flaky",
            source: "connection reset".into(),
        })
    }
}

#[async_trait]
impl ObjectArchive for FlakyArchive {
    async fn put(&self, path: &str, data: Bytes, condition: PutCondition) -> Result<ObjectVersion> {
        if path.ends_with("/block") {
            self.data_puts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Self::unavailable());
            }
        }
        self.inner.put(path, data, condition).await
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

struct Harness {
    _dir: TempDir,
    store: Arc<BlockStore>,
    archive: ArchiveClient,
    manifest: Arc<Manifest>,
    shipper: Shipper,
    flaky: Arc<FlakyArchive>,
}

fn shipper_config(max_attempts: u32) -> ShipperConfig {
    ShipperConfig {
        max_attempts,
        upload_concurrency: 2,
        backoff: RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(5), 2.0),
        ..Default::default()
    }
}

async fn harness(failures: u32, max_attempts: u32) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        BlockStore::open(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            local_retention: Duration::from_secs(1),
            ..Default::default()
        })
        .await
        .unwrap(),
    );
    let flaky = Arc::new(FlakyArchive::new(failures));
    let archive = ArchiveClient::new(flaky.clone(), RetryPolicy::immediate(0));
    let manifest = Arc::new(Manifest::new(archive.clone()));
    let shipper = Shipper::new(
        store.clone(),
        archive.clone(),
        manifest.clone(),
        shipper_config(max_attempts),
    );
    Harness {
        _dir: dir,
        store,
        archive,
        manifest,
        shipper,
        flaky,
    }
}

fn cpu(host: &str) -> SeriesKey {
    SeriesKey::metric("cpu", &[("host", host)]).unwrap()
}

async fn seal_block(store: &BlockStore, from: i64) {
    store.append(Sample::new(cpu("a"), from, 1.0)).await.unwrap();
    store.append(Sample::new(cpu("a"), from + 60_000, 2.0)).await.unwrap();
    store.seal().await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shipping_twice_yields_one_archive_block() {
    let h = harness(0, 3).await;
    seal_block(&h.store, 0).await;
    let block = h.store.unshipped().await.remove(0);

    assert_eq!(h.shipper.ship(&block).await.unwrap(), ShipOutcome::Uploaded);
    assert_eq!(
        h.shipper.ship(&block).await.unwrap(),
        ShipOutcome::AlreadyPresent
    );

    let objects = h.archive.list("blocks/").await.unwrap();
    assert_eq!(objects.len(), 2, "one data object and one meta object");
    assert_eq!(h.flaky.data_puts.load(Ordering::SeqCst), 1);

    let snapshot = h.manifest.refresh().await.unwrap();
    assert_eq!(snapshot.visible(Resolution::Raw).len(), 1);
    assert!(h.store.unshipped().await.is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = harness(2, 5).await;
    seal_block(&h.store, 0).await;

    let report = h.shipper.run_cycle().await;
    assert_eq!(report.uploaded, 1);
    assert!(report.failed.is_empty());
    assert_eq!(h.flaky.data_puts.load(Ordering::SeqCst), 3);
    assert_eq!(h.manifest.snapshot().visible(Resolution::Raw).len(), 1);
}

#[tokio::test]
async fn test_exhausted_attempts_keep_block_local() {
    let h = harness(100, 3).await;
    seal_block(&h.store, 0).await;
    let block = h.store.unshipped().await.remove(0);

    let err = h.shipper.ship(&block).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShipFailed);
    assert!(matches!(err, Error::ShipFailed { attempts: 3, .. }));

    // Still unshipped, so never evicted however old it is
    assert_eq!(h.store.unshipped().await.len(), 1);
    assert!(h.store.evict(i64::MAX / 2).await.unwrap().is_empty());

    let report = h.shipper.run_cycle().await;
    assert_eq!(report.failed, vec![block.id().to_string()]);

    // Archive recovers: the next cycle ships it
    h.flaky.failures.store(0, Ordering::SeqCst);
    let report = h.shipper.run_cycle().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.store.evict(i64::MAX / 2).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_restart_reships_unshipped_blocks() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let flaky = Arc::new(FlakyArchive::new(0));
    let archive = ArchiveClient::new(flaky.clone(), RetryPolicy::immediate(0));

    let block_id = {
        let store = BlockStore::open(config.clone()).await.unwrap();
        seal_block(&store, 0).await;
        let block = store.unshipped().await.remove(0);
        // Crash after the data upload, before the commit marker
        archive
            .put(
                &block_data_path(Resolution::Raw, block.id()),
                block.data(),
            )
            .await
            .unwrap();
        block.id().to_string()
    };

    let store = Arc::new(BlockStore::open(config).await.unwrap());
    let manifest = Arc::new(Manifest::new(archive.clone()));
    let snapshot = manifest.refresh().await.unwrap();
    assert!(snapshot.visible(Resolution::Raw).is_empty());
    assert_eq!(snapshot.uncommitted().len(), 1);

    let shipper = Shipper::new(store.clone(), archive, manifest.clone(), shipper_config(3));
    let report = shipper.run_cycle().await;
    assert_eq!(report.uploaded, 1);

    let snapshot = manifest.refresh().await.unwrap();
    let visible = snapshot.visible(Resolution::Raw);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].external_id, block_id);
    assert!(snapshot.uncommitted().is_empty());
}

#[tokio::test]
async fn test_cycle_ships_many_blocks_concurrently() {
    let h = harness(0, 3).await;
    for i in 0..5 {
        seal_block(&h.store, i * 1_000_000).await;
    }
    assert_eq!(h.store.stats().await.unshipped_blocks, 5);

    let report = h.shipper.run_cycle().await;
    assert_eq!(report.uploaded, 5);
    assert_eq!(h.store.stats().await.unshipped_blocks, 0);

    // Local data stays queryable until evicted
    let result = h
        .store
        .query(&SeriesMatcher::metric("cpu"), 0, 10_000_000)
        .await
        .unwrap();
    assert_eq!(result[0].points.len(), 10);
}
