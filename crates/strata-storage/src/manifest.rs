//! Archive Manifest
//!
//! An in-memory snapshot of every block in the object archive. Readers load the
//! current snapshot with a single atomic pointer read and keep using it for the
//! whole query; a refresh builds a new snapshot from a listing and swaps it in.
//!
//! ## Visibility
//! A block is listed in the snapshot once its `meta.json` commit marker exists.
//! It is *visible* to readers unless:
//! - it carries a quarantine marker, or
//! - another non-quarantined block of the same resolution lists it in `sources`
//!   (it was superseded by a compaction output). When a compaction wrote several
//!   outputs, its inputs stay visible until every output is committed.
//!
//! Downsampled blocks also list their raw/5m inputs in `sources`, but those live
//! at a different resolution and stay visible in their own tier.
//!
//! Objects without a commit marker (interrupted uploads, half-deleted blocks)
//! are kept in [`ManifestSnapshot::uncommitted`] for the compactor's sweep.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::stream::{self, StreamExt};
use strata_core::{BlockMeta, Resolution};
use strata_observability::metrics;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveClient, BlockObjects};
use crate::error::{Error, Result};

const META_READ_CONCURRENCY: usize = 16;

/// One committed block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub meta: BlockMeta,
    pub quarantined: bool,
}

/// Block objects present in the archive without a commit marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncommittedBlock {
    pub resolution: Resolution,
    pub external_id: String,
    pub objects: BlockObjects,
}

/// Immutable view of the archive at one point in time
#[derive(Debug, Clone, Default)]
pub struct ManifestSnapshot {
    entries: BTreeMap<(Resolution, String), ManifestEntry>,
    superseded: HashSet<(Resolution, String)>,
    uncommitted: Vec<UncommittedBlock>,
    refreshed_at: Option<Instant>,
}

impl ManifestSnapshot {
    pub fn new(entries: Vec<ManifestEntry>, uncommitted: Vec<UncommittedBlock>) -> Self {
        let entries: BTreeMap<_, _> = entries
            .into_iter()
            .map(|e| ((e.meta.resolution, e.meta.external_id.clone()), e))
            .collect();

        // Outputs of one compaction share their sources; count the committed ones
        let mut siblings: HashMap<(Resolution, Vec<&str>), u32> = HashMap::new();
        for e in entries.values().filter(|e| !e.quarantined && !e.meta.sources.is_empty()) {
            *siblings.entry(lineage_key(&e.meta)).or_default() += 1;
        }

        let superseded = entries
            .values()
            .filter(|e| !e.quarantined)
            .filter(|e| {
                siblings
                    .get(&lineage_key(&e.meta))
                    .is_some_and(|&n| n >= e.meta.output_count)
            })
            .flat_map(|e| {
                e.meta
                    .sources
                    .iter()
                    .filter(move |source| **source != e.meta.external_id)
                    .map(move |source| (e.meta.resolution, source.clone()))
            })
            .filter(|key| entries.contains_key(key))
            .collect();

        Self {
            entries,
            superseded,
            uncommitted,
            refreshed_at: None,
        }
    }

    fn refreshed(mut self) -> Self {
        self.refreshed_at = Some(Instant::now());
        self
    }

    /// Time since this snapshot was built from a listing
    pub fn age(&self) -> Option<Duration> {
        self.refreshed_at.map(|t| t.elapsed())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, resolution: Resolution, external_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(&(resolution, external_id.to_string()))
    }

    /// Every committed block, including hidden ones
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn is_superseded(&self, resolution: Resolution, external_id: &str) -> bool {
        self.superseded
            .contains(&(resolution, external_id.to_string()))
    }

    fn is_visible(&self, entry: &ManifestEntry) -> bool {
        !entry.quarantined
            && !self
                .superseded
                .contains(&(entry.meta.resolution, entry.meta.external_id.clone()))
    }

    /// Blocks readers should see at `resolution`, ordered by `min_time`
    pub fn visible(&self, resolution: Resolution) -> Vec<&BlockMeta> {
        let mut blocks: Vec<&BlockMeta> = self
            .entries
            .range((resolution, String::new())..)
            .take_while(|((r, _), _)| *r == resolution)
            .filter(|(_, e)| self.is_visible(e))
            .map(|(_, e)| &e.meta)
            .collect();
        blocks.sort_by(|a, b| {
            (a.min_time, &a.external_id).cmp(&(b.min_time, &b.external_id))
        });
        blocks
    }

    /// Visible blocks at `resolution` overlapping the inclusive range `[start, end]`
    pub fn visible_overlapping(&self, resolution: Resolution, start: i64, end: i64) -> Vec<&BlockMeta> {
        self.visible(resolution)
            .into_iter()
            .filter(|m| m.overlaps(start, end))
            .collect()
    }

    /// Committed blocks hidden by a compaction output
    pub fn superseded(&self) -> Vec<&BlockMeta> {
        self.entries
            .values()
            .filter(|e| self.is_superseded(e.meta.resolution, &e.meta.external_id))
            .map(|e| &e.meta)
            .collect()
    }

    pub fn quarantined(&self) -> Vec<&BlockMeta> {
        self.entries
            .values()
            .filter(|e| e.quarantined)
            .map(|e| &e.meta)
            .collect()
    }

    /// Visible blocks at `resolution` that list `external_id` in their sources
    pub fn derived_from(&self, resolution: Resolution, external_id: &str) -> Vec<&BlockMeta> {
        self.visible(resolution)
            .into_iter()
            .filter(|m| m.is_derived_from(external_id))
            .collect()
    }

    pub fn uncommitted(&self) -> &[UncommittedBlock] {
        &self.uncommitted
    }

    fn with_entry(&self, entry: ManifestEntry) -> Self {
        let mut entries: Vec<ManifestEntry> = self
            .entries
            .values()
            .filter(|e| {
                (e.meta.resolution, &e.meta.external_id)
                    != (entry.meta.resolution, &entry.meta.external_id)
            })
            .cloned()
            .collect();
        entries.push(entry);
        self.rebuilt(entries)
    }

    fn without(&self, resolution: Resolution, external_id: &str) -> Self {
        let entries = self
            .entries
            .values()
            .filter(|e| (e.meta.resolution, e.meta.external_id.as_str()) != (resolution, external_id))
            .cloned()
            .collect();
        self.rebuilt(entries)
    }

    fn rebuilt(&self, entries: Vec<ManifestEntry>) -> Self {
        let mut snapshot = Self::new(entries, self.uncommitted.clone());
        snapshot.refreshed_at = self.refreshed_at;
        snapshot
    }

    fn update_metrics(&self) {
        for resolution in Resolution::ALL {
            metrics::MANIFEST_BLOCKS
                .with_label_values(&[resolution.as_str()])
                .set(self.visible(resolution).len() as i64);
        }
    }
}

/// Shared, periodically refreshed manifest
#[derive(Debug)]
pub struct Manifest {
    archive: ArchiveClient,
    snapshot: ArcSwap<ManifestSnapshot>,
    refresh_lock: Mutex<()>,
}

impl Manifest {
    /// Empty manifest; the first `refresh_if_stale` lists the archive
    pub fn new(archive: ArchiveClient) -> Self {
        Self {
            archive,
            snapshot: ArcSwap::from_pointee(ManifestSnapshot::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn archive(&self) -> &ArchiveClient {
        &self.archive
    }

    pub fn snapshot(&self) -> Arc<ManifestSnapshot> {
        self.snapshot.load_full()
    }

    /// Current snapshot, rebuilt first if it is older than `max_age`
    pub async fn refresh_if_stale(&self, max_age: Duration) -> Result<Arc<ManifestSnapshot>> {
        if is_fresh(&self.snapshot(), max_age) {
            return Ok(self.snapshot());
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        let current = self.snapshot();
        if is_fresh(&current, max_age) {
            return Ok(current);
        }
        self.refresh_locked(&current).await
    }

    /// Rebuild the snapshot from a listing of the archive
    pub async fn refresh(&self) -> Result<Arc<ManifestSnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.snapshot();
        self.refresh_locked(&current).await
    }

    async fn refresh_locked(&self, previous: &ManifestSnapshot) -> Result<Arc<ManifestSnapshot>> {
        let listing = self.archive.scan_blocks().await?;

        let mut committed = Vec::new();
        let mut uncommitted = Vec::new();
        for ((resolution, id), objects) in listing {
            if objects.is_committed() {
                committed.push((resolution, id, objects.quarantine));
            } else {
                uncommitted.push(UncommittedBlock {
                    resolution,
                    external_id: id,
                    objects,
                });
            }
        }

        // Metas are immutable; only blocks new since the last snapshot are fetched.
        // Quarantine always comes from the listing, so a local mark lasts until
        // the next refresh and a rebuilt block becomes visible again.
        let entries: Vec<ManifestEntry> = stream::iter(committed)
            .map(|(resolution, id, quarantined)| async move {
                if let Some(known) = previous.get(resolution, &id) {
                    return Ok(Some(ManifestEntry {
                        meta: known.meta.clone(),
                        quarantined,
                    }));
                }
                match self.archive.read_meta(resolution, &id).await {
                    Ok(meta) => Ok(Some(ManifestEntry { meta, quarantined })),
                    // Deleted between listing and read
                    Err(Error::NotFound(_)) => Ok(None),
                    Err(Error::Serialization(e)) => {
                        warn!(block_id = %id, error = %e, "Unreadable block meta, skipping");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(META_READ_CONCURRENCY)
            .collect::<Vec<Result<Option<ManifestEntry>>>>()
            .await
            .into_iter()
            .filter_map(|r| r.transpose())
            .collect::<Result<_>>()?;

        let snapshot = Arc::new(ManifestSnapshot::new(entries, uncommitted).refreshed());
        snapshot.update_metrics();
        metrics::MANIFEST_REFRESHES_TOTAL.inc();
        debug!(
            blocks = snapshot.len(),
            uncommitted = snapshot.uncommitted.len(),
            "Manifest refreshed"
        );

        self.snapshot.store(snapshot.clone());
        Ok(snapshot)
    }

    /// Add a block committed by this process without waiting for a refresh
    pub fn insert(&self, meta: BlockMeta) {
        let entry = ManifestEntry {
            meta,
            quarantined: false,
        };
        self.snapshot
            .rcu(|current| Arc::new(current.with_entry(entry.clone())));
        self.snapshot().update_metrics();
    }

    pub fn remove(&self, resolution: Resolution, external_id: &str) {
        self.snapshot
            .rcu(|current| Arc::new(current.without(resolution, external_id)));
        self.snapshot().update_metrics();
    }

    /// Hide a corrupt block from readers of this process until the next
    /// refresh; only an archive marker keeps it hidden after that
    pub fn mark_quarantined(&self, resolution: Resolution, external_id: &str) {
        let current = self.snapshot();
        let Some(entry) = current.get(resolution, external_id) else {
            return;
        };
        if entry.quarantined {
            return;
        }
        let entry = ManifestEntry {
            meta: entry.meta.clone(),
            quarantined: true,
        };
        self.snapshot
            .rcu(|current| Arc::new(current.with_entry(entry.clone())));
        self.snapshot().update_metrics();
        info!(
            block_id = %external_id,
            resolution = %resolution,
            "Block hidden from manifest"
        );
    }
}

fn lineage_key(meta: &BlockMeta) -> (Resolution, Vec<&str>) {
    let mut sources: Vec<&str> = meta.sources.iter().map(String::as_str).collect();
    sources.sort_unstable();
    (meta.resolution, sources)
}

fn is_fresh(snapshot: &ManifestSnapshot, max_age: Duration) -> bool {
    snapshot.age().is_some_and(|age| age < max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{block_data_path, ObjectStoreArchive};
    use crate::retry::RetryPolicy;
    use bytes::Bytes;

    fn meta(resolution: Resolution, id: &str, min: i64, max: i64, sources: &[&str]) -> BlockMeta {
        BlockMeta {
            external_id: id.to_string(),
            resolution,
            min_time: min,
            max_time: max,
            series_count: 1,
            sample_count: 1,
            size_bytes: 10,
            created_at_ms: 0,
            level: if sources.is_empty() { 0 } else { 1 },
            sources: sources.iter().map(|s| s.to_string()).collect(),
            output_count: 1,
        }
    }

    fn entry(meta: BlockMeta) -> ManifestEntry {
        ManifestEntry {
            meta,
            quarantined: false,
        }
    }

    #[test]
    fn test_lineage_hides_sources_in_same_resolution() {
        let snapshot = ManifestSnapshot::new(
            vec![
                entry(meta(Resolution::Raw, "a", 0, 10, &[])),
                entry(meta(Resolution::Raw, "b", 10, 20, &[])),
                entry(meta(Resolution::Raw, "c", 0, 20, &["a", "b"])),
                entry(meta(Resolution::FiveMinutes, "d", 0, 20, &["c"])),
            ],
            vec![],
        );

        let raw: Vec<&str> = snapshot
            .visible(Resolution::Raw)
            .iter()
            .map(|m| m.external_id.as_str())
            .collect();
        assert_eq!(raw, vec!["c"]);
        assert_eq!(snapshot.superseded().len(), 2);
        assert_eq!(snapshot.visible(Resolution::FiveMinutes).len(), 1);
        assert_eq!(snapshot.derived_from(Resolution::FiveMinutes, "c").len(), 1);
        assert!(snapshot.derived_from(Resolution::FiveMinutes, "a").is_empty());
    }

    #[test]
    fn test_inputs_hidden_only_when_all_outputs_committed() {
        let mut first = meta(Resolution::Raw, "c1", 0, 20, &["a", "b"]);
        first.output_count = 2;
        let mut second = meta(Resolution::Raw, "c2", 0, 20, &["b", "a"]);
        second.output_count = 2;
        let inputs = || {
            vec![
                entry(meta(Resolution::Raw, "a", 0, 10, &[])),
                entry(meta(Resolution::Raw, "b", 10, 20, &[])),
            ]
        };

        let mut partial = inputs();
        partial.push(entry(first.clone()));
        let snapshot = ManifestSnapshot::new(partial, vec![]);
        assert_eq!(snapshot.visible(Resolution::Raw).len(), 3);

        let mut complete = inputs();
        complete.push(entry(first));
        complete.push(entry(second));
        let snapshot = ManifestSnapshot::new(complete, vec![]);
        let raw: Vec<&str> = snapshot
            .visible(Resolution::Raw)
            .iter()
            .map(|m| m.external_id.as_str())
            .collect();
        assert_eq!(raw, vec!["c1", "c2"]);
    }

    #[test]
    fn test_quarantined_output_does_not_hide_inputs() {
        let mut output = entry(meta(Resolution::Raw, "c", 0, 20, &["a"]));
        output.quarantined = true;
        let snapshot = ManifestSnapshot::new(
            vec![entry(meta(Resolution::Raw, "a", 0, 10, &[])), output],
            vec![],
        );
        let raw: Vec<&str> = snapshot
            .visible(Resolution::Raw)
            .iter()
            .map(|m| m.external_id.as_str())
            .collect();
        assert_eq!(raw, vec!["a"]);
        assert_eq!(snapshot.quarantined().len(), 1);
    }

    #[test]
    fn test_visible_overlapping_is_inclusive() {
        let snapshot = ManifestSnapshot::new(
            vec![
                entry(meta(Resolution::Raw, "a", 0, 100, &[])),
                entry(meta(Resolution::Raw, "b", 100, 200, &[])),
            ],
            vec![],
        );
        assert_eq!(snapshot.visible_overlapping(Resolution::Raw, 100, 100).len(), 1);
        assert_eq!(snapshot.visible_overlapping(Resolution::Raw, 99, 100).len(), 2);
        assert!(snapshot.visible_overlapping(Resolution::Raw, 200, 300).is_empty());
    }

    #[tokio::test]
    async fn test_refresh_reads_committed_blocks() {
        let archive = ArchiveClient::new(
            Arc::new(ObjectStoreArchive::in_memory()),
            RetryPolicy::immediate(0),
        );
        let committed = meta(Resolution::Raw, "a", 0, 10, &[]);
        archive
            .put(&block_data_path(Resolution::Raw, "a"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        archive.commit_meta(&committed).await.unwrap();
        archive
            .put(&block_data_path(Resolution::Raw, "orphan"), Bytes::from_static(b"y"))
            .await
            .unwrap();

        let manifest = Manifest::new(archive.clone());
        assert!(manifest.snapshot().is_empty());

        let snapshot = manifest
            .refresh_if_stale(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(Resolution::Raw, "a").unwrap().meta, committed);
        assert_eq!(snapshot.uncommitted().len(), 1);
        assert_eq!(snapshot.uncommitted()[0].external_id, "orphan");

        // Fresh snapshot is reused
        let again = manifest
            .refresh_if_stale(Duration::from_secs(60))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&snapshot, &again));

        manifest.mark_quarantined(Resolution::Raw, "a");
        assert!(manifest.snapshot().visible(Resolution::Raw).is_empty());

        archive.quarantine(Resolution::Raw, "a", "crc").await.unwrap();
        let snapshot = manifest.refresh().await.unwrap();
        assert!(snapshot.get(Resolution::Raw, "a").unwrap().quarantined);
    }

    async fn archive_with_block(id: &str) -> (ArchiveClient, BlockMeta) {
        let archive = ArchiveClient::new(
            Arc::new(ObjectStoreArchive::in_memory()),
            RetryPolicy::immediate(0),
        );
        let committed = meta(Resolution::Raw, id, 0, 10, &[]);
        archive
            .put(&block_data_path(Resolution::Raw, id), Bytes::from_static(b"x"))
            .await
            .unwrap();
        archive.commit_meta(&committed).await.unwrap();
        (archive, committed)
    }

    #[tokio::test]
    async fn test_rebuilt_block_is_visible_after_refresh() {
        let (archive, committed) = archive_with_block("a").await;
        let manifest = Manifest::new(archive.clone());

        archive.quarantine(Resolution::Raw, "a", "crc").await.unwrap();
        let snapshot = manifest.refresh().await.unwrap();
        assert!(snapshot.visible(Resolution::Raw).is_empty());

        // Sweep deletes the block and its marker; a rebuild recreates the same id
        archive.delete_block(Resolution::Raw, "a").await.unwrap();
        archive
            .put(&block_data_path(Resolution::Raw, "a"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        archive.commit_meta(&committed).await.unwrap();

        let snapshot = manifest.refresh().await.unwrap();
        assert!(!snapshot.get(Resolution::Raw, "a").unwrap().quarantined);
        assert_eq!(snapshot.visible(Resolution::Raw).len(), 1);
    }

    #[tokio::test]
    async fn test_local_quarantine_without_marker_ends_on_refresh() {
        let (archive, _) = archive_with_block("a").await;
        let manifest = Manifest::new(archive);
        manifest.refresh().await.unwrap();

        // Marker write failed, so only this process knows
        manifest.mark_quarantined(Resolution::Raw, "a");
        assert!(manifest.snapshot().visible(Resolution::Raw).is_empty());

        let snapshot = manifest.refresh().await.unwrap();
        assert!(!snapshot.get(Resolution::Raw, "a").unwrap().quarantined);
        assert_eq!(snapshot.visible(Resolution::Raw).len(), 1);
    }

    #[test]
    fn test_insert_and_remove() {
        let archive = ArchiveClient::new(
            Arc::new(ObjectStoreArchive::in_memory()),
            RetryPolicy::immediate(0),
        );
        let manifest = Manifest::new(archive);
        manifest.insert(meta(Resolution::Raw, "a", 0, 10, &[]));
        manifest.insert(meta(Resolution::Raw, "a", 0, 10, &[]));
        assert_eq!(manifest.snapshot().len(), 1);
        // Inserting does not count as a refresh
        assert!(manifest.snapshot().age().is_none());

        manifest.remove(Resolution::Raw, "a");
        assert!(manifest.snapshot().is_empty());
    }
}
