//! Remote Block Reader
//!
//! Serves queries from blocks in the object archive without downloading whole
//! blocks:
//!
//! ```text
//! manifest snapshot ─▶ blocks overlapping [start, end] at the chosen resolution
//!        │
//!        ▼
//! GET range [size - 32, size)        footer
//! GET range footer.index_range()     index (cached per block, LRU)
//! GET ranges of matching chunks      only the series the matcher selects
//! ```
//!
//! When the requested resolution has no visible blocks in the range the reader
//! tries finer tiers first, then coarser ones.
//!
//! A block whose index or chunk fails its checksum is quarantined: a marker is
//! written to the archive, the manifest hides it, and the read continues without
//! it. The result reports the block as skipped.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use lru::LruCache;
use strata_core::{BlockMeta, Point, Resolution, SeriesKey, SeriesMatcher, SeriesPoints};
use strata_observability::metrics;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

use crate::archive::{block_data_path, ArchiveClient};
use crate::block::{decode_chunk, BlockIndex, Footer, FOOTER_SIZE, HEADER_SIZE};
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestSnapshot};

/// Data read from the archive for one query
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRead {
    /// Resolution the points are at (may differ from the one requested)
    pub resolution: Resolution,
    pub series: Vec<SeriesPoints>,
    /// `[min_time, max_time)` spanned by the blocks that were read
    pub coverage: Option<(i64, i64)>,
    /// Blocks skipped because they were found corrupt
    pub skipped_blocks: Vec<String>,
}

impl RemoteRead {
    fn empty(resolution: Resolution) -> Self {
        Self {
            resolution,
            series: Vec::new(),
            coverage: None,
            skipped_blocks: Vec::new(),
        }
    }

    /// End (exclusive) of the archived range covered by this read
    pub fn coverage_end(&self) -> Option<i64> {
        self.coverage.map(|(_, end)| end)
    }
}

enum BlockRead {
    Points(Vec<SeriesPoints>),
    Corrupt,
    Missing,
}

pub struct RemoteBlockReader {
    archive: ArchiveClient,
    manifest: Arc<Manifest>,
    config: ReaderConfig,
    index_cache: Mutex<LruCache<String, Arc<BlockIndex>>>,
}

impl RemoteBlockReader {
    pub fn new(archive: ArchiveClient, manifest: Arc<Manifest>, config: ReaderConfig) -> Self {
        let capacity = NonZeroUsize::new(config.index_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            archive,
            manifest,
            config,
            index_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Points of matching series in `[start, end]` at `resolution`, or at the
    /// nearest tier holding data for the range
    #[instrument(skip(self, matcher), fields(matcher = %matcher))]
    pub async fn read(
        &self,
        matcher: &SeriesMatcher,
        start: i64,
        end: i64,
        resolution: Resolution,
    ) -> Result<RemoteRead> {
        let snapshot = self
            .manifest
            .refresh_if_stale(self.config.manifest_refresh_interval)
            .await?;

        match self.read_snapshot(&snapshot, matcher, start, end, resolution).await? {
            Some(read) => Ok(read),
            None => {
                // A block vanished under us, so a compaction replaced it
                debug!("Archive changed during read, refreshing manifest");
                let snapshot = self.manifest.refresh().await?;
                self.read_snapshot(&snapshot, matcher, start, end, resolution)
                    .await?
                    .ok_or_else(|| Error::Internal("archive changed during read".to_string()))
            }
        }
    }

    /// `None` when a listed block no longer exists
    async fn read_snapshot(
        &self,
        snapshot: &ManifestSnapshot,
        matcher: &SeriesMatcher,
        start: i64,
        end: i64,
        resolution: Resolution,
    ) -> Result<Option<RemoteRead>> {
        let Some((resolution, blocks)) = resolution
            .fallback_order()
            .into_iter()
            .map(|r| (r, snapshot.visible_overlapping(r, start, end)))
            .find(|(_, blocks)| !blocks.is_empty())
        else {
            return Ok(Some(RemoteRead::empty(resolution)));
        };

        let reads: Vec<_> = blocks
            .into_iter()
            .map(|meta| async move {
                let result = self.read_block(meta, matcher, start, end).await;
                (meta.clone(), result)
            })
            .collect();
        let results: Vec<(BlockMeta, Result<BlockRead>)> = stream::iter(reads)
            .buffer_unordered(self.config.read_concurrency.max(1))
            .collect()
            .await;

        let mut read = RemoteRead::empty(resolution);
        let mut merged: BTreeMap<SeriesKey, Vec<Point>> = BTreeMap::new();
        for (meta, result) in results {
            match result? {
                BlockRead::Points(series) => {
                    read.coverage = Some(match read.coverage {
                        Some((lo, hi)) => (lo.min(meta.min_time), hi.max(meta.max_time)),
                        None => (meta.min_time, meta.max_time),
                    });
                    for s in series {
                        merged.entry(s.key).or_default().extend(s.points);
                    }
                }
                BlockRead::Corrupt => read.skipped_blocks.push(meta.external_id),
                BlockRead::Missing => return Ok(None),
            }
        }

        read.series = merged
            .into_iter()
            .map(|(key, mut points)| {
                points.sort_by_key(|p| p.timestamp);
                points.dedup_by_key(|p| p.timestamp);
                SeriesPoints::new(key, points)
            })
            .collect();
        Ok(Some(read))
    }

    async fn read_block(
        &self,
        meta: &BlockMeta,
        matcher: &SeriesMatcher,
        start: i64,
        end: i64,
    ) -> Result<BlockRead> {
        match self.fetch_series(meta, matcher, start, end).await {
            Ok(series) => Ok(BlockRead::Points(series)),
            Err(Error::NotFound(_)) => Ok(BlockRead::Missing),
            Err(e) if e.is_corruption() => {
                self.quarantine(meta, &e).await;
                Ok(BlockRead::Corrupt)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_series(
        &self,
        meta: &BlockMeta,
        matcher: &SeriesMatcher,
        start: i64,
        end: i64,
    ) -> Result<Vec<SeriesPoints>> {
        let path = block_data_path(meta.resolution, &meta.external_id);
        let index = self.index(meta, &path).await?;

        let entries: Vec<_> = index.select(matcher, start, end).collect();
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let ranges: Vec<_> = entries.iter().map(|e| e.range()).collect();
        let chunks = self.archive.get_ranges(&path, &ranges).await?;

        let corrupt = |source| Error::CorruptBlock {
            block_id: meta.external_id.clone(),
            source,
        };
        let mut out = Vec::with_capacity(entries.len());
        for (entry, chunk) in entries.into_iter().zip(chunks) {
            let points: Vec<Point> = decode_chunk(
                entry,
                index.footer.compression,
                index.footer.resolution,
                &chunk,
            )
            .map_err(corrupt)?
            .into_iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .collect();
            if !points.is_empty() {
                out.push(SeriesPoints::new(entry.key.clone(), points));
            }
        }
        Ok(out)
    }

    /// Footer + index of a block, from the cache or two ranged reads
    async fn index(&self, meta: &BlockMeta, path: &str) -> Result<Arc<BlockIndex>> {
        if let Some(index) = self.index_cache.lock().await.get(&meta.external_id) {
            metrics::INDEX_CACHE_HITS_TOTAL.inc();
            return Ok(index.clone());
        }
        metrics::INDEX_CACHE_MISSES_TOTAL.inc();

        let corrupt = |source| Error::CorruptBlock {
            block_id: meta.external_id.clone(),
            source,
        };

        let size = meta.size_bytes as usize;
        if size < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(strata_core::Error::InvalidBlock(
                "block too small".to_string(),
            )));
        }
        let footer_bytes = self
            .archive
            .get_ranges(path, &[size - FOOTER_SIZE..size])
            .await?;
        let footer_bytes = footer_bytes.first().map(|b| b.as_ref()).unwrap_or_default();
        let footer = Footer::decode(footer_bytes).map_err(corrupt)?;

        let index_range = footer.index_range();
        if index_range.start < HEADER_SIZE || index_range.end != size - FOOTER_SIZE {
            return Err(corrupt(strata_core::Error::InvalidBlock(
                "index out of bounds".to_string(),
            )));
        }
        let index_bytes = self.archive.get_ranges(path, &[index_range]).await?;
        let index_bytes = index_bytes.first().map(|b| b.as_ref()).unwrap_or_default();
        let index = Arc::new(BlockIndex::decode(footer, index_bytes).map_err(corrupt)?);

        self.index_cache
            .lock()
            .await
            .put(meta.external_id.clone(), index.clone());
        Ok(index)
    }

    async fn quarantine(&self, meta: &BlockMeta, cause: &Error) {
        error!(
            block_id = %meta.external_id,
            resolution = %meta.resolution,
            error = %cause,
            "Corrupt block in archive, quarantining"
        );
        metrics::CORRUPT_BLOCKS_TOTAL
            .with_label_values(&[meta.resolution.as_str()])
            .inc();

        self.manifest
            .mark_quarantined(meta.resolution, &meta.external_id);
        self.index_cache.lock().await.pop(&meta.external_id);

        if let Err(e) = self
            .archive
            .quarantine(meta.resolution, &meta.external_id, &cause.to_string())
            .await
        {
            warn!(block_id = %meta.external_id, error = %e, "Failed to write quarantine marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ObjectStoreArchive;
    use crate::block::BlockWriter;
    use crate::retry::RetryPolicy;
    use bytes::{Bytes, BytesMut};
    use strata_core::{Aggregate, Compression};

    fn key(host: &str) -> SeriesKey {
        SeriesKey::metric("cpu", &[("host", host)]).unwrap()
    }

    fn archive() -> ArchiveClient {
        ArchiveClient::new(
            Arc::new(ObjectStoreArchive::in_memory()),
            RetryPolicy::immediate(0),
        )
    }

    async fn upload(archive: &ArchiveClient, meta: &BlockMeta, data: Bytes) {
        archive
            .put(&block_data_path(meta.resolution, &meta.external_id), data)
            .await
            .unwrap();
        archive.commit_meta(meta).await.unwrap();
    }

    async fn raw_block(archive: &ArchiveClient, min: i64, max: i64) -> BlockMeta {
        let mut writer = BlockWriter::new(Resolution::Raw, Compression::Lz4, min, max);
        writer
            .add_series(key("a"), vec![Point::raw(min, 1.0), Point::raw(min + 1, 2.0)])
            .unwrap();
        writer
            .add_series(key("b"), vec![Point::raw(min, 3.0)])
            .unwrap();
        let block = writer.finish().unwrap();
        upload(archive, &block.meta, block.data).await;
        block.meta
    }

    fn reader(archive: &ArchiveClient) -> RemoteBlockReader {
        RemoteBlockReader::new(
            archive.clone(),
            Arc::new(Manifest::new(archive.clone())),
            ReaderConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_read_across_blocks() {
        let archive = archive();
        raw_block(&archive, 0, 100).await;
        raw_block(&archive, 100, 200).await;
        let reader = reader(&archive);

        let matcher = SeriesMatcher::parse(r#"cpu{host="a"}"#).unwrap();
        let read = reader.read(&matcher, 0, 1_000, Resolution::Raw).await.unwrap();
        assert_eq!(read.resolution, Resolution::Raw);
        assert_eq!(read.coverage, Some((0, 200)));
        assert_eq!(read.series.len(), 1);
        let ts: Vec<i64> = read.series[0].points.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![0, 1, 100, 101]);

        // Second read hits the index cache
        let read = reader.read(&matcher, 100, 100, Resolution::Raw).await.unwrap();
        assert_eq!(read.series[0].points.len(), 1);
        assert_eq!(read.coverage, Some((100, 200)));
    }

    #[tokio::test]
    async fn test_falls_back_to_available_resolution() {
        let archive = archive();
        raw_block(&archive, 0, 100).await;
        let reader = reader(&archive);

        // No 1h data: finer tiers are tried first
        let read = reader
            .read(&SeriesMatcher::metric("cpu"), 0, 100, Resolution::OneHour)
            .await
            .unwrap();
        assert_eq!(read.resolution, Resolution::Raw);
        assert_eq!(read.series.len(), 2);

        let read = reader
            .read(&SeriesMatcher::metric("mem"), 500, 600, Resolution::Raw)
            .await
            .unwrap();
        assert!(read.series.is_empty());
        assert!(read.coverage.is_none());
    }

    #[tokio::test]
    async fn test_summary_blocks() {
        let archive = archive();
        let mut agg = Aggregate::from_value(1.0);
        agg.observe(2.0);
        let mut writer = BlockWriter::new(Resolution::FiveMinutes, Compression::Lz4, 0, 600_000);
        writer
            .add_series(key("a"), vec![Point::summary(0, agg)])
            .unwrap();
        let block = writer.finish().unwrap();
        upload(&archive, &block.meta, block.data).await;

        let read = reader(&archive)
            .read(&SeriesMatcher::metric("cpu"), 0, 120_000, Resolution::FiveMinutes)
            .await
            .unwrap();
        assert_eq!(read.resolution, Resolution::FiveMinutes);
        assert_eq!(read.series[0].points[0].value.as_summary().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_corrupt_block_quarantined_and_skipped() {
        let archive = archive();
        let good = raw_block(&archive, 0, 100).await;

        let mut writer = BlockWriter::new(Resolution::Raw, Compression::None, 100, 200);
        writer
            .add_series(key("a"), vec![Point::raw(150, 1.0)])
            .unwrap();
        let bad = writer.finish().unwrap();
        let mut bytes = BytesMut::from(bad.data.as_ref());
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        upload(&archive, &bad.meta, bytes.freeze()).await;

        let reader = reader(&archive);
        let read = reader
            .read(&SeriesMatcher::metric("cpu"), 0, 200, Resolution::Raw)
            .await
            .unwrap();
        assert_eq!(read.skipped_blocks, vec![bad.meta.external_id.clone()]);
        assert_eq!(read.coverage, Some((good.min_time, good.max_time)));

        // Hidden locally and marked in the archive for other processes
        let snapshot = reader.manifest().snapshot();
        assert_eq!(snapshot.visible(Resolution::Raw).len(), 1);
        let snapshot = reader.manifest().refresh().await.unwrap();
        assert!(
            snapshot
                .get(Resolution::Raw, &bad.meta.external_id)
                .unwrap()
                .quarantined
        );
    }
}
