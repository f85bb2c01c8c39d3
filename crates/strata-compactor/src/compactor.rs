//! Compactor - Merging, Downsampling and Expiring Archived Blocks
//!
//! ## Compaction
//!
//! A [`CompactionGroup`] is merged in four phases:
//!
//! 1. **Merge**: every input is fetched and fully decoded. Points are folded per
//!    series in `(created_at_ms, external_id)` order of their block, so on a
//!    duplicate `(series, timestamp)` the later block wins.
//! 2. **Upload**: the merged series are split into blocks of at most
//!    `max_output_series` series and their data objects are written. Every
//!    output lists all inputs in `sources` and records how many siblings were
//!    written.
//! 3. **Verify**: each data object must report its encoded size; then the
//!    commit markers are written. From here on readers see the outputs and no
//!    longer the inputs.
//! 4. **Delete inputs**: only after the lease is renewed against the lease
//!    store. A lost lease stops the compaction here with `CompactionConflict`.
//!
//! A crash between any two phases leaves a state the next cycle repairs: data
//! without a commit marker is swept once older than `orphan_grace_period`;
//! committed outputs hide their inputs, which the sweep then deletes.
//!
//! ## Downsampling
//!
//! A [`DownsampleTask`] folds the blocks of one settled day into aligned
//! windows of the next resolution. The sources stay in their own tier.
//!
//! ## Retention and sweep
//!
//! `enforce_retention` deletes every committed block past its resolution's
//! retention. `sweep` deletes superseded inputs, stale uncommitted objects, and
//! quarantined derived blocks whose sources are intact so they are rebuilt.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use strata_core::{downsample_points, BlockMeta, Point, Resolution, SeriesKey};
use strata_observability::metrics;
use strata_storage::{
    block_data_path, ArchiveClient, BlockReader, BlockWriter, EncodedBlock, Manifest,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::CompactorConfig;
use crate::error::{CompactorError, Result};
use crate::lease::LeaseGuard;
use crate::planner::{plan_compaction, plan_downsampling, CompactionGroup, DownsampleTask};

/// Counts from one compactor cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub compactions: usize,
    pub downsamples: usize,
    pub expired: usize,
    pub swept: usize,
    /// Groups or tasks that failed without losing the lease
    pub failed: usize,
}

pub struct Compactor {
    archive: ArchiveClient,
    manifest: Arc<Manifest>,
    config: CompactorConfig,
}

impl Compactor {
    pub fn new(archive: ArchiveClient, manifest: Arc<Manifest>, config: CompactorConfig) -> Self {
        Self {
            archive,
            manifest,
            config,
        }
    }

    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Merge one group of same-resolution blocks
    #[instrument(skip(self, group, lease), fields(resolution = %group.resolution, day = %group.day, inputs = group.blocks.len()))]
    pub async fn compact(&self, group: &CompactionGroup, lease: &LeaseGuard) -> Result<Vec<BlockMeta>> {
        lease.ensure_held()?;
        let started = Instant::now();

        // Phase 1: merge
        let mut inputs = Vec::with_capacity(group.blocks.len());
        for meta in &group.blocks {
            inputs.push((meta, self.fetch(meta).await?));
        }
        inputs.sort_by(|(a, _), (b, _)| a.write_order().cmp(&b.write_order()));

        let mut merged: BTreeMap<SeriesKey, BTreeMap<i64, Point>> = BTreeMap::new();
        let mut input_samples = 0usize;
        for (_, reader) in &inputs {
            for series in reader.read_all()? {
                input_samples += series.points.len();
                let points = merged.entry(series.key).or_default();
                for point in series.points {
                    points.insert(point.timestamp, point);
                }
            }
        }
        let distinct: usize = merged.values().map(BTreeMap::len).sum();
        debug!(input_samples, distinct, series = merged.len(), "Merged compaction inputs");

        let level = group.blocks.iter().map(|b| b.level).max().unwrap_or_default() + 1;
        let created_at_ms = group
            .blocks
            .iter()
            .map(|b| b.created_at_ms)
            .max()
            .unwrap_or_default();
        let series: Vec<(SeriesKey, Vec<Point>)> = merged
            .into_iter()
            .map(|(key, points)| (key, points.into_values().collect()))
            .collect();

        let chunk_size = self.config.max_output_series.max(1);
        let output_count = series.len().div_ceil(chunk_size) as u32;
        let mut outputs = Vec::new();
        let mut series = series.into_iter().peekable();
        while series.peek().is_some() {
            let mut writer = BlockWriter::new(
                group.resolution,
                self.config.compression,
                group.min_time(),
                group.max_time(),
            )
            .with_lineage(level, group.ids())
            .with_output_count(output_count)
            .with_created_at(created_at_ms);
            for (key, points) in series.by_ref().take(chunk_size) {
                writer.add_series(key, points)?;
            }
            outputs.push(writer.finish()?);
        }

        let written: u64 = outputs.iter().map(|o| o.meta.sample_count).sum();
        if written != distinct as u64 {
            return Err(CompactorError::Verification {
                block_id: group.ids().join(","),
                reason: format!("outputs hold {} samples, inputs {}", written, distinct),
            });
        }

        // An output identical to an input keeps its id; it must not supersede itself
        let input_ids: HashSet<&str> = group.blocks.iter().map(|b| b.external_id.as_str()).collect();
        let kept: Vec<String> = outputs
            .iter()
            .map(|o| o.meta.external_id.clone())
            .filter(|id| input_ids.contains(id.as_str()))
            .collect();
        for output in &mut outputs {
            output.meta.sources.retain(|s| !kept.contains(s));
        }

        // Phases 2 and 3: upload, verify, commit
        lease.ensure_held()?;
        let committed = self.publish(outputs).await?;

        // Phase 4: delete inputs
        lease.checkpoint().await?;
        let retired: Vec<&BlockMeta> = group
            .blocks
            .iter()
            .filter(|b| !kept.contains(&b.external_id))
            .collect();
        self.delete_blocks(retired, "compacted").await;

        metrics::COMPACTION_DURATION
            .with_label_values(&["compact"])
            .observe(started.elapsed().as_secs_f64());
        info!(
            outputs = committed.len(),
            level,
            samples = distinct,
            duration_ms = started.elapsed().as_millis() as u64,
            "Compacted blocks"
        );
        Ok(committed)
    }

    /// Fold the blocks of a settled day into the next resolution
    #[instrument(skip(self, task, lease), fields(day = %task.day, target = %task.target, sources = task.sources.len()))]
    pub async fn downsample(&self, task: &DownsampleTask, lease: &LeaseGuard) -> Result<BlockMeta> {
        lease.ensure_held()?;
        let started = Instant::now();

        // Sibling outputs hold disjoint series; merging by key keeps this general
        let mut series: BTreeMap<SeriesKey, Vec<Point>> = BTreeMap::new();
        for source in &task.sources {
            for s in self.fetch(source).await?.read_all()? {
                series.entry(s.key).or_default().extend(s.points);
            }
        }

        let min_time = task.sources.iter().map(|b| b.min_time).min().unwrap_or_default();
        let max_time = task.sources.iter().map(|b| b.max_time).max().unwrap_or_default();
        let level = task.sources.iter().map(|b| b.level).max().unwrap_or_default();
        let created_at_ms = task
            .sources
            .iter()
            .map(|b| b.created_at_ms)
            .max()
            .unwrap_or_default();

        let mut sources = task.source_ids();
        sources.extend(task.replaces.iter().cloned());

        let mut writer = BlockWriter::new(
            task.target,
            self.config.compression,
            task.target.align(min_time),
            task.target.align_up(max_time),
        )
        .with_lineage(level, sources)
        .with_created_at(created_at_ms);
        for (key, mut points) in series {
            points.sort_by_key(|p| p.timestamp);
            writer.add_series(key, downsample_points(&points, task.target))?;
        }
        let mut output = writer.finish()?;

        let own_id = output.meta.external_id.clone();
        output.meta.sources.retain(|s| *s != own_id);

        lease.ensure_held()?;
        let mut committed = self.publish(vec![output]).await?;
        let meta = committed.remove(0);

        if !task.replaces.is_empty() {
            lease.checkpoint().await?;
            let snapshot = self.manifest.snapshot();
            let stale: Vec<&BlockMeta> = task
                .replaces
                .iter()
                .filter(|id| **id != own_id)
                .filter_map(|id| snapshot.get(task.target, id).map(|e| &e.meta))
                .collect();
            self.delete_blocks(stale, "compacted").await;
        }

        metrics::DOWNSAMPLES_TOTAL
            .with_label_values(&[task.target.as_str()])
            .inc();
        metrics::COMPACTION_DURATION
            .with_label_values(&["downsample"])
            .observe(started.elapsed().as_secs_f64());
        info!(
            block_id = %meta.external_id,
            windows = meta.sample_count,
            "Downsampled blocks"
        );
        Ok(meta)
    }

    /// Delete every committed block past its resolution's retention
    pub async fn enforce_retention(&self, now_ms: i64) -> Result<usize> {
        let snapshot = self.manifest.snapshot();
        let expired: Vec<&BlockMeta> = snapshot
            .entries()
            .map(|e| &e.meta)
            .filter(|m| {
                self.config
                    .retention
                    .is_expired(m.resolution, m.max_time, now_ms)
            })
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        info!(blocks = expired.len(), "Deleting blocks past retention");
        Ok(self.delete_blocks(expired, "retention").await)
    }

    /// Delete superseded blocks, stale uncommitted objects and re-derivable
    /// quarantined blocks
    pub async fn sweep(&self, now_ms: i64) -> Result<usize> {
        let snapshot = self.manifest.snapshot();
        let mut deleted = self.delete_blocks(snapshot.superseded(), "compacted").await;

        let grace_ms = self.config.orphan_grace_period.as_millis() as i64;
        for orphan in snapshot.uncommitted() {
            let modified = [&orphan.objects.data, &orphan.objects.meta]
                .into_iter()
                .flatten()
                .map(|info| info.last_modified_ms)
                .max();
            if modified.is_some_and(|t| t.saturating_add(grace_ms) > now_ms) {
                continue;
            }
            match self
                .archive
                .delete_block(orphan.resolution, &orphan.external_id)
                .await
            {
                Ok(()) => {
                    info!(block_id = %orphan.external_id, resolution = %orphan.resolution, "Swept uncommitted block objects");
                    metrics::BLOCKS_DELETED_TOTAL
                        .with_label_values(&["orphan"])
                        .inc();
                    deleted += 1;
                }
                Err(e) => warn!(block_id = %orphan.external_id, error = %e, "Failed to sweep orphan"),
            }
        }

        let intact = |id: &String| {
            Resolution::ALL
                .iter()
                .any(|r| snapshot.get(*r, id).is_some_and(|e| !e.quarantined))
        };
        let rebuildable: Vec<&BlockMeta> = snapshot
            .quarantined()
            .into_iter()
            .filter(|m| !m.sources.is_empty() && m.sources.iter().all(intact))
            .collect();
        deleted += self.delete_blocks(rebuildable, "quarantine").await;

        Ok(deleted)
    }

    /// One full pass: sweep, compaction, downsampling, retention
    pub async fn run_cycle(&self, now_ms: i64, lease: &LeaseGuard) -> Result<CycleReport> {
        lease.checkpoint().await?;
        self.manifest.refresh().await?;

        let mut report = CycleReport {
            swept: self.sweep(now_ms).await?,
            ..Default::default()
        };

        let grace = self.config.day_grace_period;
        for group in plan_compaction(&self.manifest.snapshot(), now_ms, grace) {
            match self.compact(&group, lease).await {
                Ok(_) => {
                    metrics::COMPACTIONS_TOTAL.with_label_values(&["completed"]).inc();
                    report.compactions += 1;
                }
                Err(e) if e.is_conflict() => {
                    metrics::COMPACTIONS_TOTAL.with_label_values(&["conflict"]).inc();
                    return Err(e);
                }
                Err(e) => {
                    metrics::COMPACTIONS_TOTAL.with_label_values(&["failed"]).inc();
                    error!(day = %group.day, resolution = %group.resolution, error = %e, "Compaction failed");
                    report.failed += 1;
                }
            }
        }

        for task in plan_downsampling(&self.manifest.snapshot(), now_ms, grace) {
            match self.downsample(&task, lease).await {
                Ok(_) => report.downsamples += 1,
                Err(e) if e.is_conflict() => return Err(e),
                Err(e) => {
                    error!(day = %task.day, target = %task.target, error = %e, "Downsampling failed");
                    report.failed += 1;
                }
            }
        }

        lease.checkpoint().await?;
        report.expired = self.enforce_retention(now_ms).await?;

        debug!(?report, "Compactor cycle finished");
        Ok(report)
    }

    /// Fetch and fully decode an archived block, quarantining it if corrupt
    async fn fetch(&self, meta: &BlockMeta) -> Result<BlockReader> {
        let data = self
            .archive
            .get(&block_data_path(meta.resolution, &meta.external_id))
            .await?;
        let decoded = BlockReader::new(data).and_then(|reader| {
            reader.verify()?;
            Ok(reader)
        });
        match decoded {
            Ok(reader) => Ok(reader),
            Err(source) => {
                self.quarantine(meta, &source).await;
                Err(strata_storage::Error::CorruptBlock {
                    block_id: meta.external_id.clone(),
                    source,
                }
                .into())
            }
        }
    }

    async fn quarantine(&self, meta: &BlockMeta, cause: &strata_core::Error) {
        error!(
            block_id = %meta.external_id,
            resolution = %meta.resolution,
            error = %cause,
            "Corrupt compaction input, quarantining"
        );
        metrics::CORRUPT_BLOCKS_TOTAL
            .with_label_values(&[meta.resolution.as_str()])
            .inc();
        self.manifest
            .mark_quarantined(meta.resolution, &meta.external_id);
        if let Err(e) = self
            .archive
            .quarantine(meta.resolution, &meta.external_id, &cause.to_string())
            .await
        {
            warn!(block_id = %meta.external_id, error = %e, "Failed to write quarantine marker");
        }
    }

    /// Upload and verify every data object, then commit them all
    async fn publish(&self, outputs: Vec<EncodedBlock>) -> Result<Vec<BlockMeta>> {
        for output in &outputs {
            let path = block_data_path(output.meta.resolution, &output.meta.external_id);
            self.archive.put(&path, output.data.clone()).await?;
        }

        for output in &outputs {
            let path = block_data_path(output.meta.resolution, &output.meta.external_id);
            let info = self.archive.head(&path).await?;
            if info.size != output.data.len() as u64 {
                return Err(CompactorError::Verification {
                    block_id: output.meta.external_id.clone(),
                    reason: format!("stored {} bytes, expected {}", info.size, output.data.len()),
                });
            }
        }

        let mut committed = Vec::with_capacity(outputs.len());
        for output in outputs {
            self.archive.commit_meta(&output.meta).await?;
            self.manifest.insert(output.meta.clone());
            committed.push(output.meta);
        }
        Ok(committed)
    }

    /// Delete blocks, logging failures; returns how many were removed
    async fn delete_blocks(&self, blocks: Vec<&BlockMeta>, reason: &'static str) -> usize {
        let mut deleted = 0;
        for meta in blocks {
            match self
                .archive
                .delete_block(meta.resolution, &meta.external_id)
                .await
            {
                Ok(()) => {
                    debug!(block_id = %meta.external_id, resolution = %meta.resolution, reason, "Deleted block");
                    self.manifest.remove(meta.resolution, &meta.external_id);
                    metrics::BLOCKS_DELETED_TOTAL.with_label_values(&[reason]).inc();
                    deleted += 1;
                }
                Err(e) => {
                    warn!(block_id = %meta.external_id, reason, error = %e, "Failed to delete block, next sweep retries");
                }
            }
        }
        deleted
    }
}
