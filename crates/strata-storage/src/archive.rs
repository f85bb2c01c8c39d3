//! Object Archive access
//!
//! [`ObjectArchive`] is the only way Strata touches object storage: put, get,
//! ranged get, head, list and delete of opaque blobs. [`ObjectStoreArchive`]
//! implements it over the `object_store` crate (S3, local filesystem, in-memory);
//! tests substitute failure-injecting doubles.
//!
//! [`ArchiveClient`] wraps an archive with retries, metrics and the block layout:
//!
//! ```text
//! blocks/<resolution>/<external_id>/block        block bytes
//! blocks/<resolution>/<external_id>/meta.json    BlockMeta, written last (commit marker)
//! blocks/<resolution>/<external_id>/quarantine   present when the block is corrupt
//! locks/compactor                                compactor lease record
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use strata_core::{BlockMeta, Resolution};
use strata_observability::metrics;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Prefix under which all blocks live
pub const BLOCKS_PREFIX: &str = "blocks/";
const DATA_FILE: &str = "block";
const META_FILE: &str = "meta.json";
const QUARANTINE_FILE: &str = "quarantine";

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub last_modified_ms: i64,
}

/// Opaque version token used for conditional updates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectVersion {
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

/// Condition attached to a put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional write
    Overwrite,
    /// Fail with `AlreadyExists` if the object exists
    Create,
    /// Fail with `Precondition` unless the object is still at this version
    Match(ObjectVersion),
}

/// Minimal object storage API consumed by Strata
#[async_trait]
pub trait ObjectArchive: Send + Sync + fmt::Debug {
    async fn put(&self, path: &str, data: Bytes, condition: PutCondition) -> Result<ObjectVersion>;

    /// Whole object plus its current version. Missing objects are `Error::NotFound`.
    async fn get(&self, path: &str) -> Result<(Bytes, ObjectVersion)>;

    async fn get_ranges(&self, path: &str, ranges: &[Range<usize>]) -> Result<Vec<Bytes>>;

    async fn head(&self, path: &str) -> Result<ObjectInfo>;

    /// Every object whose path starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Deleting a missing object succeeds
    async fn delete(&self, path: &str) -> Result<()>;
}

/// [`ObjectArchive`] over any `object_store` backend
#[derive(Clone)]
pub struct ObjectStoreArchive {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreArchive {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// In-memory archive, for tests and local experiments
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }
}

impl fmt::Debug for ObjectStoreArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectStoreArchive({})", self.store)
    }
}

fn map_store_error(path: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => Error::NotFound(path.to_string()),
        object_store::Error::AlreadyExists { .. } => Error::AlreadyExists(path.to_string()),
        object_store::Error::Precondition { .. } => Error::Precondition(path.to_string()),
        other => Error::ObjectStore(other),
    }
}

#[async_trait]
impl ObjectArchive for ObjectStoreArchive {
    async fn put(&self, path: &str, data: Bytes, condition: PutCondition) -> Result<ObjectVersion> {
        let mode = match condition {
            PutCondition::Overwrite => PutMode::Overwrite,
            PutCondition::Create => PutMode::Create,
            PutCondition::Match(v) => PutMode::Update(UpdateVersion {
                e_tag: v.e_tag,
                version: v.version,
            }),
        };
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        let result = self
            .store
            .put_opts(&Path::from(path), PutPayload::from(data), opts)
            .await
            .map_err(|e| map_store_error(path, e))?;
        Ok(ObjectVersion {
            e_tag: result.e_tag,
            version: result.version,
        })
    }

    async fn get(&self, path: &str) -> Result<(Bytes, ObjectVersion)> {
        let result = self
            .store
            .get(&Path::from(path))
            .await
            .map_err(|e| map_store_error(path, e))?;
        let version = ObjectVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = result.bytes().await.map_err(|e| map_store_error(path, e))?;
        Ok((bytes, version))
    }

    async fn get_ranges(&self, path: &str, ranges: &[Range<usize>]) -> Result<Vec<Bytes>> {
        self.store
            .get_ranges(&Path::from(path), ranges)
            .await
            .map_err(|e| map_store_error(path, e))
    }

    async fn head(&self, path: &str) -> Result<ObjectInfo> {
        let meta = self
            .store
            .head(&Path::from(path))
            .await
            .map_err(|e| map_store_error(path, e))?;
        Ok(ObjectInfo {
            path: meta.location.to_string(),
            size: meta.size as u64,
            last_modified_ms: meta.last_modified.timestamp_millis(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let prefix_path = Path::from(prefix.trim_end_matches('/'));
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|e| map_store_error(prefix, e))?;
        Ok(objects
            .into_iter()
            .map(|meta| ObjectInfo {
                path: meta.location.to_string(),
                size: meta.size as u64,
                last_modified_ms: meta.last_modified.timestamp_millis(),
            })
            .filter(|info| info.path.starts_with(prefix.trim_end_matches('/')))
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&Path::from(path)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error(path, e)),
        }
    }
}

// ============================================================================
// Block layout
// ============================================================================

/// Which object of a block a path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockObject {
    Data,
    Meta,
    Quarantine,
}

pub fn block_prefix(resolution: Resolution, external_id: &str) -> String {
    format!("{}{}/{}/", BLOCKS_PREFIX, resolution, external_id)
}

pub fn block_data_path(resolution: Resolution, external_id: &str) -> String {
    format!("{}{}", block_prefix(resolution, external_id), DATA_FILE)
}

pub fn block_meta_path(resolution: Resolution, external_id: &str) -> String {
    format!("{}{}", block_prefix(resolution, external_id), META_FILE)
}

pub fn block_quarantine_path(resolution: Resolution, external_id: &str) -> String {
    format!("{}{}", block_prefix(resolution, external_id), QUARANTINE_FILE)
}

/// Split `blocks/<res>/<id>/<file>` into its parts
pub fn parse_block_path(path: &str) -> Option<(Resolution, String, BlockObject)> {
    let rest = path.strip_prefix(BLOCKS_PREFIX)?;
    let mut parts = rest.split('/');
    let resolution = parts.next()?.parse::<Resolution>().ok()?;
    let external_id = parts.next()?;
    let object = match parts.next()? {
        DATA_FILE => BlockObject::Data,
        META_FILE => BlockObject::Meta,
        QUARANTINE_FILE => BlockObject::Quarantine,
        _ => return None,
    };
    if parts.next().is_some() || external_id.is_empty() {
        return None;
    }
    Some((resolution, external_id.to_string(), object))
}

/// What the archive holds for one block id, as seen by a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockObjects {
    pub data: Option<ObjectInfo>,
    pub meta: Option<ObjectInfo>,
    pub quarantine: bool,
}

impl BlockObjects {
    /// Committed: both the data and the commit marker exist
    pub fn is_committed(&self) -> bool {
        self.data.is_some() && self.meta.is_some()
    }
}

// ============================================================================
// Archive client
// ============================================================================

/// Retrying, instrumented access to the archive
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    inner: Arc<dyn ObjectArchive>,
    retry: RetryPolicy,
}

impl ArchiveClient {
    pub fn new(inner: Arc<dyn ObjectArchive>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        metrics::ARCHIVE_REQUESTS_TOTAL
            .with_label_values(&[operation])
            .inc();

        let result = retry_with_backoff(&self.retry, operation, f).await;

        metrics::ARCHIVE_LATENCY
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());

        result.map_err(|e| {
            let error_type = match &e {
                Error::NotFound(_) => "not_found",
                Error::AlreadyExists(_) => "already_exists",
                Error::Precondition(_) => "precondition",
                _ => "unavailable",
            };
            metrics::ARCHIVE_ERRORS_TOTAL
                .with_label_values(&[operation, error_type])
                .inc();
            match e {
                Error::ObjectStore(source) => Error::ArchiveUnavailable { operation, source },
                other => other,
            }
        })
    }

    pub async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.call("put", || self.inner.put(path, data.clone(), PutCondition::Overwrite))
            .await
            .map(|_| ())
    }

    pub async fn put_conditional(
        &self,
        path: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> Result<ObjectVersion> {
        self.call("put", || self.inner.put(path, data.clone(), condition.clone()))
            .await
    }

    pub async fn get(&self, path: &str) -> Result<Bytes> {
        self.call("get", || self.inner.get(path)).await.map(|(b, _)| b)
    }

    pub async fn get_versioned(&self, path: &str) -> Result<(Bytes, ObjectVersion)> {
        self.call("get", || self.inner.get(path)).await
    }

    pub async fn get_ranges(&self, path: &str, ranges: &[Range<usize>]) -> Result<Vec<Bytes>> {
        self.call("get_ranges", || self.inner.get_ranges(path, ranges))
            .await
    }

    pub async fn head(&self, path: &str) -> Result<ObjectInfo> {
        self.call("head", || self.inner.head(path)).await
    }

    /// `head` that maps a missing object to `None`
    pub async fn exists(&self, path: &str) -> Result<Option<ObjectInfo>> {
        match self.head(path).await {
            Ok(info) => Ok(Some(info)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.call("list", || self.inner.list(prefix)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.call("delete", || self.inner.delete(path)).await
    }

    // ------------------------------------------------------------------------
    // Block-level operations
    // ------------------------------------------------------------------------

    /// Group every block object in the archive by `(resolution, external_id)`
    pub async fn scan_blocks(&self) -> Result<BTreeMap<(Resolution, String), BlockObjects>> {
        let mut blocks: BTreeMap<(Resolution, String), BlockObjects> = BTreeMap::new();
        for info in self.list(BLOCKS_PREFIX).await? {
            let Some((resolution, id, object)) = parse_block_path(&info.path) else {
                debug!(path = %info.path, "Ignoring unexpected object under blocks/");
                continue;
            };
            let entry = blocks.entry((resolution, id)).or_default();
            match object {
                BlockObject::Data => entry.data = Some(info),
                BlockObject::Meta => entry.meta = Some(info),
                BlockObject::Quarantine => entry.quarantine = true,
            }
        }
        Ok(blocks)
    }

    pub async fn read_meta(&self, resolution: Resolution, external_id: &str) -> Result<BlockMeta> {
        let bytes = self.get(&block_meta_path(resolution, external_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the commit marker; the block becomes visible to readers
    pub async fn commit_meta(&self, meta: &BlockMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        self.put(
            &block_meta_path(meta.resolution, &meta.external_id),
            Bytes::from(json),
        )
        .await
    }

    pub async fn quarantine(&self, resolution: Resolution, external_id: &str, reason: &str) -> Result<()> {
        self.put(
            &block_quarantine_path(resolution, external_id),
            Bytes::from(reason.to_string()),
        )
        .await
    }

    /// Remove a block. The commit marker goes first so the block disappears
    /// from new listings before its data does.
    pub async fn delete_block(&self, resolution: Resolution, external_id: &str) -> Result<()> {
        self.delete(&block_meta_path(resolution, external_id)).await?;
        self.delete(&block_data_path(resolution, external_id)).await?;
        self.delete(&block_quarantine_path(resolution, external_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ArchiveClient {
        ArchiveClient::new(
            Arc::new(ObjectStoreArchive::in_memory()),
            RetryPolicy::immediate(0),
        )
    }

    #[test]
    fn test_block_paths() {
        let id = "00000000000000000000-abc";
        assert_eq!(
            block_data_path(Resolution::Raw, id),
            "blocks/raw/00000000000000000000-abc/block"
        );
        assert_eq!(
            parse_block_path(&block_meta_path(Resolution::FiveMinutes, id)),
            Some((Resolution::FiveMinutes, id.to_string(), BlockObject::Meta))
        );
        assert_eq!(parse_block_path("blocks/raw/x"), None);
        assert_eq!(parse_block_path("blocks/2h/x/block"), None);
        assert_eq!(parse_block_path("locks/compactor"), None);
    }

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let archive = client();
        archive.put("blocks/raw/a/block", Bytes::from("hello")).await.unwrap();

        assert_eq!(archive.get("blocks/raw/a/block").await.unwrap(), Bytes::from("hello"));
        assert_eq!(archive.head("blocks/raw/a/block").await.unwrap().size, 5);

        let ranges = archive
            .get_ranges("blocks/raw/a/block", &[0..2, 3..5])
            .await
            .unwrap();
        assert_eq!(ranges, vec![Bytes::from("he"), Bytes::from("lo")]);

        archive.delete("blocks/raw/a/block").await.unwrap();
        // Idempotent
        archive.delete("blocks/raw/a/block").await.unwrap();
        assert!(matches!(
            archive.get("blocks/raw/a/block").await,
            Err(Error::NotFound(_))
        ));
        assert!(archive.exists("blocks/raw/a/block").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_puts() {
        let archive = client();
        let v1 = archive
            .put_conditional("locks/compactor", Bytes::from("a"), PutCondition::Create)
            .await
            .unwrap();
        let err = archive
            .put_conditional("locks/compactor", Bytes::from("b"), PutCondition::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        archive
            .put_conditional("locks/compactor", Bytes::from("c"), PutCondition::Match(v1.clone()))
            .await
            .unwrap();
        let err = archive
            .put_conditional("locks/compactor", Bytes::from("d"), PutCondition::Match(v1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_scan_groups_block_objects() {
        let archive = client();
        archive.put("blocks/raw/a/block", Bytes::from("x")).await.unwrap();
        archive.put("blocks/raw/a/meta.json", Bytes::from("{}")).await.unwrap();
        archive.put("blocks/raw/b/block", Bytes::from("y")).await.unwrap();
        archive.put("blocks/5m/c/quarantine", Bytes::from("crc")).await.unwrap();
        archive.put("locks/compactor", Bytes::from("{}")).await.unwrap();

        let blocks = archive.scan_blocks().await.unwrap();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[&(Resolution::Raw, "a".to_string())].is_committed());
        assert!(!blocks[&(Resolution::Raw, "b".to_string())].is_committed());
        assert!(blocks[&(Resolution::FiveMinutes, "c".to_string())].quarantine);
    }
}
