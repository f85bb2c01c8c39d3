//! Compactor Lease - Single Active Compactor per Archive
//!
//! Compaction deletes its inputs once outputs are durable, so two compactors
//! working on the same archive could delete each other's inputs or write
//! divergent outputs. Only the holder of the compactor lease runs cycles.
//!
//! ## How It Works
//!
//! 1. **Acquire**: write a lease record if none exists or the existing one has
//!    expired; the epoch increments on every change of holder
//! 2. **Renew**: a background task extends the lease every `renew_interval`
//! 3. **Checkpoint**: before deleting inputs the compactor renews synchronously;
//!    failure aborts the compaction with `CompactionConflict`
//! 4. **Lost**: a failed renewal, or local expiry, flips the guard to lost
//!
//! ## Lease Record
//!
//! ```json
//! { "holder": "compactor-6f1c...", "epoch": 7, "expires_at_ms": 1700000030000 }
//! ```
//!
//! [`ObjectStoreLeaseStore`] keeps the record at `locks/compactor` and uses
//! conditional puts (create-if-absent, update-if-version-matches), so the lease
//! needs nothing beyond the archive itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_core::now_ms;
use strata_observability::metrics;
use strata_storage::{ArchiveClient, ObjectVersion, PutCondition};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CompactorError, Result};

/// Archive path of the compactor lease record
pub const LEASE_PATH: &str = "locks/compactor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub epoch: u64,
    pub expires_at_ms: i64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// External coordination primitive holding the lease
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Take the lease if free or expired. `Err(LeaseHeld)` if someone else holds it.
    async fn try_acquire(&self, holder: &str, ttl: Duration, now_ms: i64) -> Result<LeaseRecord>;

    /// Extend a lease we hold. `Err(LeaseLost)` if it changed hands or expired.
    async fn renew(&self, lease: &LeaseRecord, ttl: Duration, now_ms: i64) -> Result<LeaseRecord>;

    /// Give the lease up; a no-op if it is no longer ours
    async fn release(&self, lease: &LeaseRecord) -> Result<()>;
}

fn expiry(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

// ============================================================================
// In-memory lease store
// ============================================================================

/// Lease store for a single process and tests
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    record: Mutex<Option<LeaseRecord>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<LeaseRecord> {
        self.record.lock().await.clone()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, holder: &str, ttl: Duration, now_ms: i64) -> Result<LeaseRecord> {
        let mut record = self.record.lock().await;
        let epoch = match record.as_ref() {
            Some(current) if current.holder == holder => current.epoch,
            Some(current) if !current.is_expired(now_ms) => {
                return Err(CompactorError::LeaseHeld {
                    holder: current.holder.clone(),
                    expires_at_ms: current.expires_at_ms,
                })
            }
            Some(current) => current.epoch + 1,
            None => 1,
        };
        let lease = LeaseRecord {
            holder: holder.to_string(),
            epoch,
            expires_at_ms: expiry(now_ms, ttl),
        };
        *record = Some(lease.clone());
        Ok(lease)
    }

    async fn renew(&self, lease: &LeaseRecord, ttl: Duration, now_ms: i64) -> Result<LeaseRecord> {
        let mut record = self.record.lock().await;
        match record.as_mut() {
            Some(current)
                if current.holder == lease.holder
                    && current.epoch == lease.epoch
                    && !current.is_expired(now_ms) =>
            {
                current.expires_at_ms = expiry(now_ms, ttl);
                Ok(current.clone())
            }
            _ => Err(CompactorError::LeaseLost(format!(
                "lease epoch {} no longer held by {}",
                lease.epoch, lease.holder
            ))),
        }
    }

    async fn release(&self, lease: &LeaseRecord) -> Result<()> {
        let mut record = self.record.lock().await;
        if record
            .as_ref()
            .is_some_and(|r| r.holder == lease.holder && r.epoch == lease.epoch)
        {
            *record = None;
        }
        Ok(())
    }
}

// ============================================================================
// Object store lease store
// ============================================================================

/// Lease record kept in the archive, updated with conditional puts
#[derive(Debug)]
pub struct ObjectStoreLeaseStore {
    archive: ArchiveClient,
    path: String,
    /// Version of the record as last written by us
    version: Mutex<Option<ObjectVersion>>,
}

impl ObjectStoreLeaseStore {
    pub fn new(archive: ArchiveClient) -> Self {
        Self {
            archive,
            path: LEASE_PATH.to_string(),
            version: Mutex::new(None),
        }
    }

    async fn read(&self) -> Result<Option<(LeaseRecord, ObjectVersion)>> {
        match self.archive.get_versioned(&self.path).await {
            Ok((bytes, version)) => Ok(Some((serde_json::from_slice(&bytes)?, version))),
            Err(strata_storage::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &LeaseRecord, condition: PutCondition) -> Result<ObjectVersion> {
        let body = Bytes::from(serde_json::to_vec(record)?);
        match self
            .archive
            .put_conditional(&self.path, body, condition)
            .await
        {
            Ok(version) => Ok(version),
            Err(strata_storage::Error::AlreadyExists(_))
            | Err(strata_storage::Error::Precondition(_)) => Err(CompactorError::LeaseLost(
                "lease record changed concurrently".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LeaseStore for ObjectStoreLeaseStore {
    async fn try_acquire(&self, holder: &str, ttl: Duration, now_ms: i64) -> Result<LeaseRecord> {
        let (epoch, condition) = match self.read().await? {
            None => (1, PutCondition::Create),
            Some((current, version)) => {
                if current.holder != holder && !current.is_expired(now_ms) {
                    return Err(CompactorError::LeaseHeld {
                        holder: current.holder,
                        expires_at_ms: current.expires_at_ms,
                    });
                }
                let epoch = if current.holder == holder {
                    current.epoch
                } else {
                    current.epoch + 1
                };
                (epoch, PutCondition::Match(version))
            }
        };

        let lease = LeaseRecord {
            holder: holder.to_string(),
            epoch,
            expires_at_ms: expiry(now_ms, ttl),
        };
        let version = self.write(&lease, condition).await.map_err(|e| match e {
            // Lost the race to another acquirer
            CompactorError::LeaseLost(_) => CompactorError::LeaseHeld {
                holder: "unknown".to_string(),
                expires_at_ms: lease.expires_at_ms,
            },
            other => other,
        })?;
        *self.version.lock().await = Some(version);
        Ok(lease)
    }

    async fn renew(&self, lease: &LeaseRecord, ttl: Duration, now_ms: i64) -> Result<LeaseRecord> {
        let Some((current, version)) = self.read().await? else {
            return Err(CompactorError::LeaseLost("lease record missing".to_string()));
        };
        if current.holder != lease.holder || current.epoch != lease.epoch || current.is_expired(now_ms) {
            return Err(CompactorError::LeaseLost(format!(
                "lease now held by {} at epoch {}",
                current.holder, current.epoch
            )));
        }

        let renewed = LeaseRecord {
            expires_at_ms: expiry(now_ms, ttl),
            ..current
        };
        let version = self.write(&renewed, PutCondition::Match(version)).await?;
        *self.version.lock().await = Some(version);
        Ok(renewed)
    }

    async fn release(&self, lease: &LeaseRecord) -> Result<()> {
        let Some((current, version)) = self.read().await? else {
            return Ok(());
        };
        if current.holder != lease.holder || current.epoch != lease.epoch {
            return Ok(());
        }
        // Expire in place so the epoch keeps increasing for the next holder
        let released = LeaseRecord {
            expires_at_ms: 0,
            ..current
        };
        match self.write(&released, PutCondition::Match(version)).await {
            Ok(_) | Err(CompactorError::LeaseLost(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Lease guard
// ============================================================================

/// A held lease with background renewal
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    record: Arc<Mutex<LeaseRecord>>,
    expires_at_ms: Arc<AtomicI64>,
    lost: Arc<AtomicBool>,
    ttl: Duration,
    renewal: JoinHandle<()>,
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("expires_at_ms", &self.expires_at_ms.load(Ordering::Acquire))
            .field("lost", &self.lost.load(Ordering::Acquire))
            .finish()
    }
}

impl LeaseGuard {
    /// Acquire the lease and start renewing it every `renew_interval`
    pub async fn acquire(
        store: Arc<dyn LeaseStore>,
        holder: &str,
        ttl: Duration,
        renew_interval: Duration,
    ) -> Result<Self> {
        let record = store.try_acquire(holder, ttl, now_ms()).await?;
        info!(
            holder = %record.holder,
            epoch = record.epoch,
            expires_at_ms = record.expires_at_ms,
            "Acquired compactor lease"
        );
        metrics::COMPACTOR_LEASE_HELD.set(1);

        let expires_at_ms = Arc::new(AtomicI64::new(record.expires_at_ms));
        let lost = Arc::new(AtomicBool::new(false));
        let record = Arc::new(Mutex::new(record));

        let renewal = tokio::spawn(renew_loop(
            store.clone(),
            record.clone(),
            expires_at_ms.clone(),
            lost.clone(),
            ttl,
            renew_interval,
        ));

        Ok(Self {
            store,
            record,
            expires_at_ms,
            lost,
            ttl,
            renewal,
        })
    }

    pub async fn epoch(&self) -> u64 {
        self.record.lock().await.epoch
    }

    /// Lost by a failed renewal, or expired locally without one
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire) || now_ms() >= self.expires_at_ms.load(Ordering::Acquire)
    }

    /// Cheap local check between phases
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            metrics::COMPACTOR_LEASE_HELD.set(0);
            return Err(CompactorError::LeaseLost(
                "renewal failed or lease expired".to_string(),
            ));
        }
        Ok(())
    }

    /// Renew against the store now; used right before destructive steps
    pub async fn checkpoint(&self) -> Result<()> {
        self.ensure_held()?;
        let mut record = self.record.lock().await;
        match self.store.renew(&record, self.ttl, now_ms()).await {
            Ok(renewed) => {
                self.expires_at_ms
                    .store(renewed.expires_at_ms, Ordering::Release);
                *record = renewed;
                Ok(())
            }
            Err(e) => {
                self.lost.store(true, Ordering::Release);
                metrics::COMPACTOR_LEASE_HELD.set(0);
                warn!(epoch = record.epoch, error = %e, "Compactor lease checkpoint failed");
                Err(e)
            }
        }
    }

    /// Stop renewing and give the lease up
    pub async fn release(self) -> Result<()> {
        self.renewal.abort();
        metrics::COMPACTOR_LEASE_HELD.set(0);
        let record = self.record.lock().await.clone();
        self.store.release(&record).await?;
        info!(epoch = record.epoch, "Released compactor lease");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

async fn renew_loop(
    store: Arc<dyn LeaseStore>,
    record: Arc<Mutex<LeaseRecord>>,
    expires_at_ms: Arc<AtomicI64>,
    lost: Arc<AtomicBool>,
    ttl: Duration,
    renew_interval: Duration,
) {
    loop {
        tokio::time::sleep(renew_interval).await;

        let mut current = record.lock().await;
        match store.renew(&current, ttl, now_ms()).await {
            Ok(renewed) => {
                debug!(epoch = renewed.epoch, expires_at_ms = renewed.expires_at_ms, "Renewed compactor lease");
                expires_at_ms.store(renewed.expires_at_ms, Ordering::Release);
                *current = renewed;
            }
            Err(e) => {
                error!(epoch = current.epoch, error = %e, "Compactor lease renewal failed");
                lost.store(true, Ordering::Release);
                metrics::COMPACTOR_LEASE_HELD.set(0);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::{ObjectStoreArchive, RetryPolicy};

    const TTL: Duration = Duration::from_secs(30);

    async fn exercise(store: &dyn LeaseStore) {
        let a = store.try_acquire("a", TTL, 1_000).await.unwrap();
        assert_eq!(a.epoch, 1);
        assert_eq!(a.expires_at_ms, 31_000);

        // Held by a: b is refused until expiry
        let err = store.try_acquire("b", TTL, 2_000).await.unwrap_err();
        assert!(err.is_conflict());

        let a = store.renew(&a, TTL, 20_000).await.unwrap();
        assert_eq!(a.expires_at_ms, 50_000);

        // a stalls past expiry; b takes over with a new epoch
        let b = store.try_acquire("b", TTL, 60_000).await.unwrap();
        assert_eq!(b.epoch, 2);
        assert!(store.renew(&a, TTL, 61_000).await.unwrap_err().is_conflict());

        // Releasing a stale lease leaves b in place
        store.release(&a).await.unwrap();
        assert!(store.try_acquire("c", TTL, 62_000).await.is_err());

        store.release(&b).await.unwrap();
        let c = store.try_acquire("c", TTL, 63_000).await.unwrap();
        assert_eq!(c.holder, "c");
    }

    #[tokio::test]
    async fn test_in_memory_lease_store() {
        exercise(&InMemoryLeaseStore::new()).await;
    }

    #[tokio::test]
    async fn test_object_store_lease_store() {
        let archive = ArchiveClient::new(
            Arc::new(ObjectStoreArchive::in_memory()),
            RetryPolicy::immediate(0),
        );
        let store = ObjectStoreLeaseStore::new(archive.clone());
        exercise(&store).await;
        assert!(archive.exists(LEASE_PATH).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_guard_checkpoint_detects_takeover() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let guard = LeaseGuard::acquire(store.clone(), "a", TTL, Duration::from_secs(3600))
            .await
            .unwrap();
        guard.ensure_held().unwrap();
        guard.checkpoint().await.unwrap();

        // Someone else takes the lease as if ours had expired
        store
            .try_acquire("b", TTL, now_ms() + 3_600_000)
            .await
            .unwrap();

        assert!(!guard.is_lost());
        assert!(guard.checkpoint().await.unwrap_err().is_conflict());
        assert!(guard.is_lost());
        assert!(guard.ensure_held().is_err());
    }

    #[tokio::test]
    async fn test_guard_expires_without_renewal() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let guard = LeaseGuard::acquire(
            store,
            "a",
            Duration::from_millis(20),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(guard.is_lost());
    }

    #[tokio::test]
    async fn test_guard_renews_in_background() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let guard = LeaseGuard::acquire(
            store.clone(),
            "a",
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!guard.is_lost());
        guard.release().await.unwrap();
        assert!(store.current().await.is_none());
    }
}
