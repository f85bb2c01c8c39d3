//! Block Store - The Local Tier
//!
//! The Block Store owns every sample that has not yet been evicted from the local
//! disk. It holds three kinds of data:
//!
//! ```text
//!  sealed blocks (Arc, immutable, on disk)   frozen (encoding)   open block (mutable)
//! ├──────────────┼──────────────┼──────────┼───────────────────┼──────────────────────▶ time
//!  [t0, t1)       [t1, t2)       ...        [tn, boundary)      [boundary, ...)
//! ```
//!
//! ## Write Path
//! `append` goes to the single open block under its write lock. A sample is
//! rejected with `OutOfOrder` when it is older than the open block's start or not
//! strictly newer than the last sample of its series in the open block.
//!
//! ## Sealing
//! `seal_at(boundary)` moves samples `< boundary` into a frozen block and leaves
//! the rest in a new open block starting at `boundary`. The swap happens under
//! the head lock and is O(series); encoding and writing the block file happen
//! after the lock is released. Frozen data stays queryable while it is encoded.
//!
//! Lock order is sealed → frozen → head. Readers take all three read locks in
//! that order, so a sample moving between tiers is never seen twice or missed.
//!
//! ## Persistence
//! Sealed blocks live in `data_dir/blocks/<id>.block` with a `<id>.json` sidecar
//! holding the meta and the shipped flag. `open` reloads them, so unshipped
//! blocks survive a restart and are picked up by the next shipper cycle.
//! Open-block samples go to the write-ahead log in `data_dir/wal` and are
//! replayed by `open`; sealing rotates the log (see [`crate::wal`]).
//!
//! ## Eviction
//! A sealed block is evicted only when it has shipped AND its `max_time` is older
//! than `local_retention`. Eviction proceeds from the oldest block and stops at
//! the first block that must stay, so local coverage is always one contiguous
//! range ending at the open block. That range's start is
//! [`BlockStore::oldest_timestamp`], the boundary used by query federation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_core::{
    BlockMeta, ErrorKind, Point, Resolution, Sample, SeriesKey, SeriesMatcher, SeriesPoints,
};
use strata_observability::metrics;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::block::{BlockReader, BlockWriter};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::wal::Wal;

const BLOCKS_DIR: &str = "blocks";
const WAL_DIR: &str = "wal";
const BLOCK_EXT: &str = "block";
const STATE_EXT: &str = "json";

/// Outcome of one sample in a batch append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendStatus {
    Accepted,
    Rejected { kind: ErrorKind, reason: String },
}

impl AppendStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AppendStatus::Accepted)
    }
}

/// Counters describing the local tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub open_samples: usize,
    pub open_series: usize,
    pub frozen_blocks: usize,
    pub sealed_blocks: usize,
    pub unshipped_blocks: usize,
}

/// Sidecar persisted next to each sealed block file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalBlockState {
    meta: BlockMeta,
    shipped: bool,
}

/// A sealed, immutable block on local disk
#[derive(Debug)]
pub struct LocalBlock {
    meta: BlockMeta,
    reader: BlockReader,
    shipped: AtomicBool,
    state_path: PathBuf,
    block_path: PathBuf,
}

impl LocalBlock {
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn id(&self) -> &str {
        &self.meta.external_id
    }

    /// Block file bytes, as uploaded to the archive
    pub fn data(&self) -> Bytes {
        self.reader.data().clone()
    }

    pub fn reader(&self) -> &BlockReader {
        &self.reader
    }

    pub fn is_shipped(&self) -> bool {
        self.shipped.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct SeriesBuffer {
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl SeriesBuffer {
    fn last_timestamp(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    fn push(&mut self, timestamp: i64, value: f64) {
        self.timestamps.push(timestamp);
        self.values.push(value);
    }

    /// Split off everything at or after `boundary`
    fn split_off(&mut self, boundary: i64) -> SeriesBuffer {
        let at = self.timestamps.partition_point(|&t| t < boundary);
        SeriesBuffer {
            timestamps: self.timestamps.split_off(at),
            values: self.values.split_off(at),
        }
    }

    fn points_in(&self, start: i64, end: i64) -> Vec<Point> {
        let from = self.timestamps.partition_point(|&t| t < start);
        let to = self.timestamps.partition_point(|&t| t <= end);
        (from..to)
            .map(|i| Point::raw(self.timestamps[i], self.values[i]))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Mutable in-memory block: the open block, or a frozen one being encoded
#[derive(Debug, Default)]
struct HeadBlock {
    /// Inclusive start; `None` until the first sample arrives
    start: Option<i64>,
    /// Exclusive end, set once frozen
    end: Option<i64>,
    series: HashMap<SeriesKey, SeriesBuffer>,
    samples: usize,
    max_timestamp: Option<i64>,
}

impl HeadBlock {
    fn starting_at(start: Option<i64>) -> Self {
        Self {
            start,
            ..Default::default()
        }
    }

    fn query_into(
        &self,
        matcher: &SeriesMatcher,
        start: i64,
        end: i64,
        out: &mut BTreeMap<SeriesKey, Vec<Point>>,
    ) {
        for (key, buffer) in &self.series {
            if !matcher.matches(key) {
                continue;
            }
            let points = buffer.points_in(start, end);
            if !points.is_empty() {
                out.entry(key.clone()).or_default().extend(points);
            }
        }
    }

    fn min_timestamp(&self) -> Option<i64> {
        self.series
            .values()
            .filter_map(|b| b.timestamps.first().copied())
            .min()
    }

    /// Samples at or after `boundary`, in order within each series
    fn samples_from(&self, boundary: i64) -> Vec<Sample> {
        let mut samples = Vec::new();
        for (key, buffer) in &self.series {
            let from = buffer.timestamps.partition_point(|&t| t < boundary);
            for i in from..buffer.timestamps.len() {
                samples.push(Sample::new(key.clone(), buffer.timestamps[i], buffer.values[i]));
            }
        }
        samples
    }
}

/// The local tier of Strata
#[derive(Debug)]
pub struct BlockStore {
    config: StoreConfig,
    blocks_dir: PathBuf,
    sealed: RwLock<Vec<Arc<LocalBlock>>>,
    frozen: RwLock<Vec<Arc<HeadBlock>>>,
    head: RwLock<HeadBlock>,
    seal_lock: Mutex<()>,
    seal_requested: Notify,
    wal: Option<Wal>,
}

impl BlockStore {
    /// Open the store, reloading sealed blocks found in `data_dir` and replaying
    /// the write-ahead log into the open block
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let blocks_dir = config.data_dir.join(BLOCKS_DIR);
        tokio::fs::create_dir_all(&blocks_dir).await?;

        let mut sealed = load_blocks(&blocks_dir).await?;
        sealed.sort_by_key(|b| b.meta.min_time);

        let head_start = sealed.last().map(|b| b.meta.max_time);
        let unshipped = sealed.iter().filter(|b| !b.is_shipped()).count();
        info!(
            data_dir = %config.data_dir.display(),
            sealed_blocks = sealed.len(),
            unshipped_blocks = unshipped,
            "Block store opened"
        );
        metrics::LOCAL_BLOCKS.set(sealed.len() as i64);
        metrics::UNSHIPPED_BLOCKS.set(unshipped as i64);

        let mut store = Self {
            config,
            blocks_dir,
            sealed: RwLock::new(sealed),
            frozen: RwLock::new(Vec::new()),
            head: RwLock::new(HeadBlock::starting_at(head_start)),
            seal_lock: Mutex::new(()),
            seal_requested: Notify::new(),
            wal: None,
        };

        if store.config.wal.enabled {
            let wal_dir = store.config.data_dir.join(WAL_DIR);
            let (wal, recovered) = Wal::open(wal_dir, store.config.wal.sync_policy).await?;
            let recovered_count = recovered.len();
            let replayed = store.replay(recovered);
            if recovered_count > 0 {
                info!(
                    recovered = recovered_count,
                    replayed = replayed,
                    "Open block restored from write-ahead log"
                );
            }

            // Compact the log down to what the open block holds now
            let carried = store.head.get_mut().samples_from(i64::MIN);
            let generation = wal.rotate(&carried).await?;
            wal.release_before(generation).await?;
            store.wal = Some(wal);
        }

        Ok(store)
    }

    /// Re-admit logged samples. Ones already sealed or logged twice fail the
    /// ordering checks and are dropped.
    fn replay(&mut self, samples: Vec<Sample>) -> usize {
        let mut head = std::mem::take(self.head.get_mut());
        let mut replayed = 0;
        for sample in samples {
            if self.admit(&head, &sample.key, sample.timestamp).is_ok() {
                self.insert(&mut head, sample);
                replayed += 1;
            }
        }
        metrics::OPEN_BLOCK_SAMPLES.set(head.samples as i64);
        *self.head.get_mut() = head;
        replayed
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Append one sample to the open block
    pub async fn append(&self, sample: Sample) -> Result<()> {
        let limit = self.future_limit(strata_core::now_ms());
        let mut head = self.head.write().await;
        let record = self.wal.as_ref().map(|_| sample.clone());
        let result = self.append_locked(&mut head, sample, limit);
        if let (Ok(()), Some(record)) = (&result, record) {
            self.log_samples(&[record]).await;
        }
        self.after_append(&head, result.is_ok());
        result
    }

    /// Append many samples under one lock acquisition, reporting each outcome
    pub async fn append_batch(&self, samples: Vec<Sample>) -> Vec<AppendStatus> {
        let limit = self.future_limit(strata_core::now_ms());
        let mut head = self.head.write().await;
        let mut statuses = Vec::with_capacity(samples.len());
        let mut records = Vec::new();
        let mut accepted = false;
        for sample in samples {
            let record = self.wal.as_ref().map(|_| sample.clone());
            match self.append_locked(&mut head, sample, limit) {
                Ok(()) => {
                    accepted = true;
                    records.extend(record);
                    statuses.push(AppendStatus::Accepted);
                }
                Err(e) => statuses.push(AppendStatus::Rejected {
                    kind: e.kind(),
                    reason: e.to_string(),
                }),
            }
        }
        self.log_samples(&records).await;
        self.after_append(&head, accepted);
        statuses
    }

    /// Samples stay accepted when the log write fails; they are only at risk
    /// until the next seal
    async fn log_samples(&self, samples: &[Sample]) {
        let Some(wal) = &self.wal else {
            return;
        };
        if let Err(e) = wal.append(samples).await {
            metrics::WAL_WRITE_ERRORS_TOTAL.inc();
            error!(samples = samples.len(), error = %e, "Failed to write samples to WAL");
        }
    }

    fn append_locked(&self, head: &mut HeadBlock, sample: Sample, limit: i64) -> Result<()> {
        let Sample {
            key,
            timestamp,
            value,
        } = sample;

        if timestamp > limit {
            metrics::SAMPLES_REJECTED_TOTAL
                .with_label_values(&["future_timestamp"])
                .inc();
            return Err(Error::FutureTimestamp {
                series: key.to_string(),
                timestamp,
                limit,
            });
        }

        if let Err(reason) = self.admit(head, &key, timestamp) {
            metrics::SAMPLES_REJECTED_TOTAL
                .with_label_values(&["out_of_order"])
                .inc();
            return Err(Error::OutOfOrder {
                series: key.to_string(),
                timestamp,
                reason,
            });
        }

        self.insert(head, Sample::new(key, timestamp, value));
        metrics::SAMPLES_APPENDED_TOTAL.inc();
        Ok(())
    }

    /// Ordering checks against the open block
    fn admit(
        &self,
        head: &HeadBlock,
        key: &SeriesKey,
        timestamp: i64,
    ) -> std::result::Result<(), &'static str> {
        if head.start.is_some_and(|start| timestamp < start) {
            return Err("older than open block start");
        }
        if let Some(last) = head.series.get(key).and_then(SeriesBuffer::last_timestamp) {
            if timestamp <= last {
                return Err("not newer than last sample of series");
            }
        }
        Ok(())
    }

    fn insert(&self, head: &mut HeadBlock, sample: Sample) {
        if head.start.is_none() {
            head.start = Some(self.align_to_interval(sample.timestamp));
        }
        head.series
            .entry(sample.key)
            .or_default()
            .push(sample.timestamp, sample.value);
        head.samples += 1;
        head.max_timestamp = Some(
            head.max_timestamp
                .map_or(sample.timestamp, |m| m.max(sample.timestamp)),
        );
    }

    fn after_append(&self, head: &HeadBlock, accepted: bool) {
        if !accepted {
            return;
        }
        metrics::OPEN_BLOCK_SAMPLES.set(head.samples as i64);
        if head.samples >= self.config.max_open_block_samples {
            self.seal_requested.notify_one();
        }
    }

    fn interval_ms(&self) -> i64 {
        (self.config.seal_interval.as_millis() as i64).max(1)
    }

    fn align_to_interval(&self, timestamp: i64) -> i64 {
        let interval = self.interval_ms();
        timestamp.div_euclid(interval) * interval
    }

    /// Newest timestamp `append` accepts at `now_ms`
    fn future_limit(&self, now_ms: i64) -> i64 {
        let skew = i64::try_from(self.config.max_future_skew.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(skew)
    }

    /// Seal boundary covering the open block's samples up to `now_ms`.
    /// Samples ahead of the clock stay open, so the next open block never
    /// starts in the future.
    fn capped_boundary(max_timestamp: i64, now_ms: i64) -> i64 {
        max_timestamp.min(now_ms).saturating_add(1)
    }

    /// Resolves when the open block has grown past `max_open_block_samples`
    pub async fn seal_requested(&self) {
        self.seal_requested.notified().await
    }

    /// Seal the open block up to the current time
    pub async fn seal(&self) -> Result<Option<Arc<LocalBlock>>> {
        self.seal_before(strata_core::now_ms()).await
    }

    async fn seal_before(&self, now_ms: i64) -> Result<Option<Arc<LocalBlock>>> {
        let boundary = {
            let head = self.head.read().await;
            match head.max_timestamp {
                Some(max) => Self::capped_boundary(max, now_ms),
                None => return Ok(None),
            }
        };
        self.seal_at(boundary).await
    }

    /// Seal samples `< boundary`; the open block continues from `boundary`
    #[instrument(skip(self))]
    pub async fn seal_at(&self, boundary: i64) -> Result<Option<Arc<LocalBlock>>> {
        let _guard = self.seal_lock.lock().await;

        // Frozen blocks left behind by a failed write go first, in time order
        self.persist_frozen().await?;

        let (frozen, generation) = {
            let mut frozen_list = self.frozen.write().await;
            let mut head = self.head.write().await;

            let Some(start) = head.start else {
                return Ok(None);
            };
            if boundary <= start {
                return Ok(None);
            }

            // The new log generation holds what stays open
            let generation = match &self.wal {
                Some(wal) if head.min_timestamp().is_some_and(|m| m < boundary) => {
                    Some(wal.rotate(&head.samples_from(boundary)).await?)
                }
                _ => None,
            };

            let mut frozen_series = HashMap::new();
            let mut remaining = HashMap::new();
            let mut frozen_samples = 0;
            let mut remaining_samples = 0;
            for (key, mut buffer) in head.series.drain() {
                let later = buffer.split_off(boundary);
                if !buffer.is_empty() {
                    frozen_samples += buffer.timestamps.len();
                    frozen_series.insert(key.clone(), buffer);
                }
                if !later.is_empty() {
                    remaining_samples += later.timestamps.len();
                    remaining.insert(key, later);
                }
            }

            let remaining_max = remaining
                .values()
                .filter_map(SeriesBuffer::last_timestamp)
                .max();
            *head = HeadBlock {
                start: Some(boundary),
                end: None,
                series: remaining,
                samples: remaining_samples,
                max_timestamp: remaining_max,
            };
            metrics::OPEN_BLOCK_SAMPLES.set(remaining_samples as i64);

            if frozen_series.is_empty() {
                return Ok(None);
            }

            let frozen = Arc::new(HeadBlock {
                start: Some(start),
                end: Some(boundary),
                series: frozen_series,
                samples: frozen_samples,
                max_timestamp: None,
            });
            frozen_list.push(frozen.clone());
            (frozen, generation)
        };

        debug!(
            min_time = frozen.start.unwrap_or_default(),
            max_time = boundary,
            samples = frozen.samples,
            "Open block frozen"
        );

        let sealed = self.persist_frozen().await?;
        // Every frozen block is on disk, so older generations are redundant
        if let (Some(wal), Some(generation)) = (&self.wal, generation) {
            if let Err(e) = wal.release_before(generation).await {
                warn!(generation, error = %e, "Failed to release WAL generations");
            }
        }
        Ok(sealed)
    }

    /// Seal the open block if its interval has elapsed or it has grown too large
    pub async fn maybe_seal(&self, now_ms: i64) -> Result<Option<Arc<LocalBlock>>> {
        let (samples, start, min_ts) = {
            let head = self.head.read().await;
            (head.samples, head.start, head.min_timestamp())
        };

        if samples >= self.config.max_open_block_samples {
            return self.seal_before(now_ms).await;
        }

        let boundary = self.align_to_interval(now_ms);
        match (start, min_ts) {
            (Some(start), Some(min_ts)) if boundary > start && min_ts < boundary => {
                self.seal_at(boundary).await
            }
            _ => Ok(None),
        }
    }

    /// Encode and persist frozen blocks oldest first. Returns the last block sealed.
    async fn persist_frozen(&self) -> Result<Option<Arc<LocalBlock>>> {
        let mut last = None;
        loop {
            let next = self.frozen.read().await.first().cloned();
            let Some(frozen) = next else {
                return Ok(last);
            };

            let block = self.write_block(&frozen).await?;
            let block = Arc::new(block);

            {
                let mut sealed = self.sealed.write().await;
                let mut frozen_list = self.frozen.write().await;
                sealed.push(block.clone());
                frozen_list.retain(|f| !Arc::ptr_eq(f, &frozen));
                metrics::LOCAL_BLOCKS.set(sealed.len() as i64);
                metrics::UNSHIPPED_BLOCKS
                    .set(sealed.iter().filter(|b| !b.is_shipped()).count() as i64);
            }

            metrics::BLOCKS_SEALED_TOTAL.inc();
            info!(
                block_id = %block.id(),
                min_time = block.meta.min_time,
                max_time = block.meta.max_time,
                series = block.meta.series_count,
                samples = block.meta.sample_count,
                size_bytes = block.meta.size_bytes,
                "Block sealed"
            );
            last = Some(block);
        }
    }

    async fn write_block(&self, frozen: &HeadBlock) -> Result<LocalBlock> {
        let (Some(start), Some(end)) = (frozen.start, frozen.end) else {
            return Err(Error::Internal("frozen block without bounds".to_string()));
        };

        let mut writer = BlockWriter::new(Resolution::Raw, self.config.compression, start, end);
        for (key, buffer) in &frozen.series {
            let points = buffer
                .timestamps
                .iter()
                .zip(&buffer.values)
                .map(|(&t, &v)| Point::raw(t, v))
                .collect();
            writer.add_series(key.clone(), points)?;
        }
        let encoded = writer.finish()?;

        let block_path = self.block_path(&encoded.meta.external_id);
        let state_path = self.state_path(&encoded.meta.external_id);
        write_atomic(&block_path, &encoded.data).await?;

        let state = LocalBlockState {
            meta: encoded.meta.clone(),
            shipped: false,
        };
        write_atomic(&state_path, &serde_json::to_vec_pretty(&state)?).await?;

        Ok(LocalBlock {
            reader: BlockReader::new(encoded.data)?,
            meta: encoded.meta,
            shipped: AtomicBool::new(false),
            state_path,
            block_path,
        })
    }

    fn block_path(&self, id: &str) -> PathBuf {
        self.blocks_dir.join(format!("{}.{}", id, BLOCK_EXT))
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.blocks_dir.join(format!("{}.{}", id, STATE_EXT))
    }

    /// Samples of matching series in `[start, end]` from every local tier
    #[instrument(skip(self, matcher), fields(matcher = %matcher))]
    pub async fn query(
        &self,
        matcher: &SeriesMatcher,
        start: i64,
        end: i64,
    ) -> Result<Vec<SeriesPoints>> {
        let mut merged: BTreeMap<SeriesKey, Vec<Point>> = BTreeMap::new();

        let sealed = self.sealed.read().await;
        let frozen = self.frozen.read().await;
        let head = self.head.read().await;

        for block in sealed.iter().filter(|b| b.meta.overlaps(start, end)) {
            for series in block.reader.query(matcher, start, end)? {
                merged.entry(series.key).or_default().extend(series.points);
            }
        }
        for block in frozen.iter() {
            block.query_into(matcher, start, end, &mut merged);
        }
        head.query_into(matcher, start, end, &mut merged);

        drop(head);
        drop(frozen);
        drop(sealed);

        Ok(merged
            .into_iter()
            .map(|(key, mut points)| {
                points.sort_by_key(|p| p.timestamp);
                points.dedup_by_key(|p| p.timestamp);
                SeriesPoints::new(key, points)
            })
            .collect())
    }

    /// Start of the contiguous range held locally, if anything is held
    pub async fn oldest_timestamp(&self) -> Option<i64> {
        let sealed = self.sealed.read().await;
        let frozen = self.frozen.read().await;
        let head = self.head.read().await;

        sealed
            .first()
            .map(|b| b.meta.min_time)
            .or_else(|| frozen.first().and_then(|f| f.start))
            .or(head.start)
    }

    /// Sealed blocks not yet in the archive
    pub async fn unshipped(&self) -> Vec<Arc<LocalBlock>> {
        self.sealed
            .read()
            .await
            .iter()
            .filter(|b| !b.is_shipped())
            .cloned()
            .collect()
    }

    pub async fn sealed_blocks(&self) -> Vec<Arc<LocalBlock>> {
        self.sealed.read().await.clone()
    }

    /// Record that the archive holds the block; persisted in its sidecar
    pub async fn mark_shipped(&self, external_id: &str) -> Result<()> {
        let block = self
            .sealed
            .read()
            .await
            .iter()
            .find(|b| b.id() == external_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("local block {}", external_id)))?;

        if block.shipped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let state = LocalBlockState {
            meta: block.meta.clone(),
            shipped: true,
        };
        write_atomic(&block.state_path, &serde_json::to_vec_pretty(&state)?).await?;

        let unshipped = self
            .sealed
            .read()
            .await
            .iter()
            .filter(|b| !b.is_shipped())
            .count();
        metrics::UNSHIPPED_BLOCKS.set(unshipped as i64);
        Ok(())
    }

    /// Remove shipped blocks older than `local_retention`, oldest first
    #[instrument(skip(self))]
    pub async fn evict(&self, now_ms: i64) -> Result<Vec<String>> {
        let retention_ms = self.config.local_retention.as_millis() as i64;
        let cutoff = now_ms.saturating_sub(retention_ms);

        let evicted: Vec<Arc<LocalBlock>> = {
            let mut sealed = self.sealed.write().await;
            let count = sealed
                .iter()
                .take_while(|b| b.is_shipped() && b.meta.max_time < cutoff)
                .count();
            sealed.drain(..count).collect()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for block in evicted {
            for path in [&block.state_path, &block.block_path] {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(block_id = %block.id(), path = %path.display(), error = %e, "Failed to remove evicted block file");
                    }
                }
            }
            info!(block_id = %block.id(), max_time = block.meta.max_time, "Evicted local block");
            metrics::BLOCKS_EVICTED_TOTAL.inc();
            ids.push(block.meta.external_id.clone());
        }

        metrics::LOCAL_BLOCKS.set(self.sealed.read().await.len() as i64);
        Ok(ids)
    }

    pub async fn stats(&self) -> StoreStats {
        let sealed = self.sealed.read().await;
        let frozen = self.frozen.read().await;
        let head = self.head.read().await;
        StoreStats {
            open_samples: head.samples,
            open_series: head.series.len(),
            frozen_blocks: frozen.len(),
            sealed_blocks: sealed.len(),
            unshipped_blocks: sealed.iter().filter(|b| !b.is_shipped()).count(),
        }
    }
}

impl BlockStore {
    /// Background loop sealing on interval or size, and evicting expired blocks
    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                seal_interval = ?self.config.seal_interval,
                local_retention = ?self.config.local_retention,
                "Block store maintenance started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(wal) = &self.wal {
                            if let Err(e) = wal.sync().await {
                                error!(error = %e, "Failed to sync WAL");
                            }
                        }
                        let now = strata_core::now_ms();
                        if let Err(e) = self.maybe_seal(now).await {
                            error!(error = %e, "Failed to seal open block");
                        }
                        if let Err(e) = self.evict(now).await {
                            error!(error = %e, "Failed to evict local blocks");
                        }
                    }
                    _ = self.seal_requested() => {
                        if let Err(e) = self.maybe_seal(strata_core::now_ms()).await {
                            error!(error = %e, "Failed to seal open block");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Block store maintenance shutting down");
                        break;
                    }
                }
            }
        })
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_blocks(dir: &Path) -> Result<Vec<Arc<LocalBlock>>> {
    let mut blocks = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some(BLOCK_EXT) => {}
            Some("tmp") => {
                // Interrupted write
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            _ => continue,
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        match load_block(dir, &id).await {
            Ok(block) => blocks.push(Arc::new(block)),
            Err(e) => {
                warn!(block_id = %id, error = %e, "Skipping unreadable local block");
            }
        }
    }

    Ok(blocks)
}

async fn load_block(dir: &Path, id: &str) -> Result<LocalBlock> {
    let block_path = dir.join(format!("{}.{}", id, BLOCK_EXT));
    let state_path = dir.join(format!("{}.{}", id, STATE_EXT));

    let data = Bytes::from(tokio::fs::read(&block_path).await?);
    let reader = BlockReader::new(data).map_err(|source| Error::CorruptBlock {
        block_id: id.to_string(),
        source,
    })?;

    let state = match tokio::fs::read(&state_path).await {
        Ok(bytes) => serde_json::from_slice::<LocalBlockState>(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Crashed between writing the block and its sidecar
            let header = reader.header();
            let state = LocalBlockState {
                meta: BlockMeta {
                    external_id: id.to_string(),
                    resolution: header.resolution,
                    min_time: header.min_time,
                    max_time: header.max_time,
                    series_count: header.series_count,
                    sample_count: header.sample_count as u64,
                    size_bytes: reader.data().len() as u64,
                    created_at_ms: strata_core::now_ms(),
                    level: 0,
                    sources: Vec::new(),
                    output_count: 1,
                },
                shipped: false,
            };
            write_atomic(&state_path, &serde_json::to_vec_pretty(&state)?).await?;
            state
        }
        Err(e) => return Err(e.into()),
    };

    Ok(LocalBlock {
        meta: state.meta,
        reader,
        shipped: AtomicBool::new(state.shipped),
        state_path,
        block_path,
    })
}
