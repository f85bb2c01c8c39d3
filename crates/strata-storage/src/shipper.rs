//! Block Shipper
//!
//! Uploads sealed blocks from the Block Store to the object archive.
//!
//! ## Protocol
//! For each unshipped block:
//! 1. If `meta.json` already exists for its external id, the archive holds the
//!    block: nothing is uploaded (restart after a crash, or a second shipper).
//! 2. Otherwise the block bytes are written to `blocks/raw/<id>/block`.
//! 3. Verify: `head` of the data object must report the encoded size.
//! 4. `meta.json` is written. The block is now committed and visible.
//! 5. The manifest gains the entry; the Block Store marks the block shipped.
//!
//! Each block runs through the [`BlockUpload`] state machine; an attempt that
//! fails anywhere in steps 2-4 backs off and starts over at step 2. When the
//! attempt budget is spent the block stays unshipped and is retried on the next
//! cycle. The external id is content-derived, so a retried upload writes the
//! same objects again.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use strata_observability::metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{block_data_path, block_meta_path, ArchiveClient};
use crate::config::ShipperConfig;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::store::{BlockStore, LocalBlock};
use crate::upload::BlockUpload;

/// How a successful `ship` got the block into the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipOutcome {
    Uploaded,
    AlreadyPresent,
}

impl ShipOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ShipOutcome::Uploaded => "uploaded",
            ShipOutcome::AlreadyPresent => "already_present",
        }
    }
}

/// Result of one shipper cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipReport {
    pub uploaded: usize,
    pub already_present: usize,
    /// External ids of blocks that exhausted their attempts
    pub failed: Vec<String>,
}

pub struct Shipper {
    store: Arc<BlockStore>,
    archive: ArchiveClient,
    manifest: Arc<Manifest>,
    config: ShipperConfig,
}

impl Shipper {
    pub fn new(
        store: Arc<BlockStore>,
        archive: ArchiveClient,
        manifest: Arc<Manifest>,
        config: ShipperConfig,
    ) -> Self {
        Self {
            store,
            archive,
            manifest,
            config,
        }
    }

    /// Upload one sealed block and mark it shipped
    #[instrument(skip(self, block), fields(block_id = %block.id()))]
    pub async fn ship(&self, block: &LocalBlock) -> Result<ShipOutcome> {
        let meta = block.meta();
        let meta_path = block_meta_path(meta.resolution, &meta.external_id);
        let data_path = block_data_path(meta.resolution, &meta.external_id);
        let mut upload = BlockUpload::new(
            meta.external_id.clone(),
            self.config.max_attempts,
            self.config.backoff.clone(),
        );

        let outcome = loop {
            match self.attempt(&mut upload, block, &meta_path, &data_path).await {
                Ok(outcome) => break outcome,
                Err(e) => match upload.failed(&e) {
                    Some(delay) => {
                        warn!(
                            state = upload.state().name(),
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Block upload attempt failed, backing off"
                        );
                        sleep(delay).await;
                    }
                    None => {
                        metrics::SHIP_FAILURES_TOTAL.inc();
                        return Err(upload.into_error().unwrap_or(e));
                    }
                },
            }
        };

        self.manifest.insert(meta.clone());
        self.store.mark_shipped(&meta.external_id).await?;
        metrics::BLOCKS_SHIPPED_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        info!(
            outcome = outcome.as_str(),
            size_bytes = meta.size_bytes,
            "Block shipped"
        );
        Ok(outcome)
    }

    async fn attempt(
        &self,
        upload: &mut BlockUpload,
        block: &LocalBlock,
        meta_path: &str,
        data_path: &str,
    ) -> Result<ShipOutcome> {
        upload.start();

        if self.archive.exists(meta_path).await?.is_some() {
            upload.already_present();
            return Ok(ShipOutcome::AlreadyPresent);
        }

        let data = block.data();
        let expected = data.len() as u64;
        self.archive.put(data_path, data).await?;
        upload.uploaded();
        metrics::UPLOADED_BYTES_TOTAL.inc_by(expected);

        let info = self.archive.head(data_path).await?;
        if info.size != expected {
            return Err(Error::Internal(format!(
                "uploaded {} has {} bytes, expected {}",
                data_path, info.size, expected
            )));
        }
        self.archive.commit_meta(block.meta()).await?;
        upload.verified();
        Ok(ShipOutcome::Uploaded)
    }

    /// Ship every unshipped block, `upload_concurrency` at a time
    pub async fn run_cycle(&self) -> ShipReport {
        let pending = self.store.unshipped().await;
        if pending.is_empty() {
            return ShipReport::default();
        }
        debug!(blocks = pending.len(), "Shipping sealed blocks");

        let results: Vec<(String, Result<ShipOutcome>)> = stream::iter(pending)
            .map(|block| async move {
                let result = self.ship(&block).await;
                (block.id().to_string(), result)
            })
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .collect()
            .await;

        let mut report = ShipReport::default();
        for (id, result) in results {
            match result {
                Ok(ShipOutcome::Uploaded) => report.uploaded += 1,
                Ok(ShipOutcome::AlreadyPresent) => report.already_present += 1,
                Err(e) => {
                    error!(block_id = %id, error = %e, "Block not shipped, will retry next cycle");
                    report.failed.push(id);
                }
            }
        }
        report
    }

    /// Run shipper cycles every `ship_interval` until shutdown
    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.ship_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.ship_interval, "Block shipper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_cycle().await;
                        if report.uploaded > 0 || !report.failed.is_empty() {
                            info!(
                                uploaded = report.uploaded,
                                already_present = report.already_present,
                                failed = report.failed.len(),
                                "Shipper cycle complete"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Block shipper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
