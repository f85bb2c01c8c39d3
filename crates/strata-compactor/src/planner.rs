//! Compaction and downsampling planning
//!
//! Blocks are bucketed by the UTC calendar day of their `min_time`. Nothing in a
//! day is touched until the day is closed: its end (or the latest `max_time` of
//! its blocks, if later) plus a grace period has passed.
//!
//! A closed day is *settled* at a resolution when its visible blocks are a
//! single block, or exactly the complete set of outputs of one compaction.
//!
//! - **Compaction**: every closed, unsettled day holding two or more visible
//!   blocks of one resolution (raw or 5m) becomes a group to merge.
//! - **Downsampling**: the blocks of a settled day are downsampled to the next
//!   resolution, unless a visible block at that resolution already lists all of
//!   them in `sources`. Target blocks of the same day that were derived from
//!   older inputs are replaced.
//!
//! Both plans are pure functions of a manifest snapshot and the current time.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use strata_core::{BlockMeta, Resolution};
use strata_storage::ManifestSnapshot;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Resolutions whose blocks are merged per day
pub const COMPACTED_RESOLUTIONS: [Resolution; 2] = [Resolution::Raw, Resolution::FiveMinutes];

/// Blocks of one resolution and day to merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionGroup {
    pub resolution: Resolution,
    pub day: NaiveDate,
    pub blocks: Vec<BlockMeta>,
}

impl CompactionGroup {
    pub fn min_time(&self) -> i64 {
        self.blocks.iter().map(|b| b.min_time).min().unwrap_or_default()
    }

    pub fn max_time(&self) -> i64 {
        self.blocks.iter().map(|b| b.max_time).max().unwrap_or_default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.external_id.clone()).collect()
    }
}

/// The blocks of one settled day to downsample to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownsampleTask {
    pub sources: Vec<BlockMeta>,
    pub target: Resolution,
    pub day: NaiveDate,
    /// Visible `target` blocks of the same day derived from older inputs
    pub replaces: Vec<String>,
}

impl DownsampleTask {
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|b| b.external_id.clone()).collect()
    }
}

/// UTC day containing `ts`, with its start in ms
pub fn day_of(ts: i64) -> (NaiveDate, i64) {
    let start = ts.div_euclid(DAY_MS) * DAY_MS;
    let day = DateTime::from_timestamp_millis(start)
        .map(|d| d.date_naive())
        .unwrap_or_default();
    (day, start)
}

fn is_closed(day_start: i64, blocks: &[&BlockMeta], now_ms: i64, grace: Duration) -> bool {
    let end = blocks
        .iter()
        .map(|b| b.max_time)
        .fold(day_start + DAY_MS, i64::max);
    end.saturating_add(grace.as_millis() as i64) <= now_ms
}

fn lineage(meta: &BlockMeta) -> Vec<&str> {
    let mut sources: Vec<&str> = meta.sources.iter().map(String::as_str).collect();
    sources.sort_unstable();
    sources
}

fn is_settled(blocks: &[&BlockMeta]) -> bool {
    match blocks {
        [] => false,
        [_] => true,
        [first, rest @ ..] => {
            !first.sources.is_empty()
                && blocks.len() as u32 == first.output_count
                && rest.iter().all(|b| lineage(b) == lineage(first))
        }
    }
}

fn by_day<'a>(blocks: Vec<&'a BlockMeta>) -> BTreeMap<(NaiveDate, i64), Vec<&'a BlockMeta>> {
    let mut days: BTreeMap<(NaiveDate, i64), Vec<&BlockMeta>> = BTreeMap::new();
    for block in blocks {
        days.entry(day_of(block.min_time)).or_default().push(block);
    }
    days
}

/// Groups of visible blocks to merge, oldest day first
pub fn plan_compaction(snapshot: &ManifestSnapshot, now_ms: i64, grace: Duration) -> Vec<CompactionGroup> {
    let mut groups = Vec::new();
    for resolution in COMPACTED_RESOLUTIONS {
        for ((day, day_start), blocks) in by_day(snapshot.visible(resolution)) {
            if is_settled(&blocks) || !is_closed(day_start, &blocks, now_ms, grace) {
                continue;
            }
            groups.push(CompactionGroup {
                resolution,
                day,
                blocks: blocks.into_iter().cloned().collect(),
            });
        }
    }
    groups.sort_by_key(|g| (g.day, g.resolution));
    groups
}

/// Settled days to downsample one resolution further, oldest day first
pub fn plan_downsampling(snapshot: &ManifestSnapshot, now_ms: i64, grace: Duration) -> Vec<DownsampleTask> {
    let mut tasks = Vec::new();
    for resolution in COMPACTED_RESOLUTIONS {
        let Some(target) = resolution.coarser() else {
            continue;
        };
        let target_days = by_day(snapshot.visible(target));

        for ((day, day_start), blocks) in by_day(snapshot.visible(resolution)) {
            if !is_settled(&blocks) || !is_closed(day_start, &blocks, now_ms, grace) {
                continue;
            }

            let existing = target_days
                .get(&(day, day_start))
                .map(Vec::as_slice)
                .unwrap_or_default();
            let done = existing
                .iter()
                .any(|t| blocks.iter().all(|b| t.is_derived_from(&b.external_id)));
            if done {
                continue;
            }

            tasks.push(DownsampleTask {
                sources: blocks.into_iter().cloned().collect(),
                target,
                day,
                replaces: existing.iter().map(|b| b.external_id.clone()).collect(),
            });
        }
    }
    tasks.sort_by_key(|t| (t.day, t.target));
    tasks
}
