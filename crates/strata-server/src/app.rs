//! Process wiring
//!
//! Builds every component from a [`ServerConfig`] and owns the background loops:
//! Block Store maintenance (seal and evict), the shipper and the compactor
//! service. All loops share one shutdown channel.

use std::sync::Arc;

use strata_compactor::{
    Compactor, CompactorService, InMemoryLeaseStore, LeaseStore, ObjectStoreLeaseStore,
};
use strata_query::QueryEngine;
use strata_storage::{
    ArchiveClient, BlockStore, Manifest, ObjectStoreArchive, RemoteBlockReader, Shipper,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::AppState;

pub struct Strata {
    pub store: Arc<BlockStore>,
    pub shipper: Arc<Shipper>,
    pub engine: Arc<QueryEngine>,
    pub compactor: Arc<CompactorService>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Strata {
    pub async fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        let object_store = config.object_store.build()?;
        let archive = ArchiveClient::new(
            Arc::new(ObjectStoreArchive::new(object_store)),
            config.archive.retry.clone(),
        );
        let manifest = Arc::new(Manifest::new(archive.clone()));

        let store = Arc::new(BlockStore::open(config.store.clone()).await?);
        let shipper = Arc::new(Shipper::new(
            store.clone(),
            archive.clone(),
            manifest.clone(),
            config.shipper.clone(),
        ));
        let remote = Arc::new(RemoteBlockReader::new(
            archive.clone(),
            manifest.clone(),
            config.reader.clone(),
        ));
        let engine = Arc::new(QueryEngine::new(store.clone(), remote, config.query.clone()));

        // Only a shared archive needs a lease other processes can see
        let leases: Arc<dyn LeaseStore> = if config.object_store.is_shared() {
            Arc::new(ObjectStoreLeaseStore::new(archive.clone()))
        } else {
            Arc::new(InMemoryLeaseStore::new())
        };
        let compactor = Arc::new(CompactorService::new(
            Arc::new(Compactor::new(archive, manifest, config.compactor.clone())),
            leases,
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            store,
            shipper,
            engine,
            compactor,
            shutdown_tx,
            handles: Vec::new(),
        })
    }

    pub fn state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            engine: self.engine.clone(),
        }
    }

    /// Start the background loops
    pub fn spawn(&mut self) {
        let rx = self.shutdown_tx.subscribe();
        self.handles.push(self.store.clone().start(rx.clone()));
        self.handles.push(self.shipper.clone().start(rx.clone()));
        self.handles.push(self.compactor.clone().start(rx));
        info!(holder = %self.compactor.holder(), "Background loops started");
    }

    /// Stop the loops, then seal the open block up to now. Samples ahead of
    /// the clock stay in the write-ahead log.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        match self.store.seal().await {
            Ok(Some(block)) => info!(block_id = %block.id(), "Sealed open block on shutdown"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to seal open block on shutdown"),
        }
    }
}
