//! Compactor leader loop
//!
//! Every process may run a `CompactorService`; only the lease holder compacts.
//! On each tick a process without the lease tries to take it, and the holder
//! runs one [`Compactor::run_cycle`]. A lost lease is dropped and re-contested
//! on the next tick. On shutdown the lease is released so a standby can take
//! over without waiting for the TTL.

use std::sync::Arc;

use strata_core::now_ms;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compactor::{Compactor, CycleReport};
use crate::error::{CompactorError, Result};
use crate::lease::{LeaseGuard, LeaseStore};

pub struct CompactorService {
    compactor: Arc<Compactor>,
    leases: Arc<dyn LeaseStore>,
    holder: String,
}

impl CompactorService {
    pub fn new(compactor: Arc<Compactor>, leases: Arc<dyn LeaseStore>) -> Self {
        Self {
            compactor,
            leases,
            holder: format!("compactor-{}", Uuid::new_v4()),
        }
    }

    /// Lease holder id of this process
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Contest the lease if needed, then run one cycle as the holder.
    ///
    /// Returns `None` while another process holds the lease.
    pub async fn run_once(&self, lease: &mut Option<LeaseGuard>) -> Result<Option<CycleReport>> {
        if lease.as_ref().is_some_and(|guard| guard.is_lost()) {
            warn!(holder = %self.holder, "Compactor lease lost, re-contesting");
            *lease = None;
        }

        if lease.is_none() {
            let config = self.compactor.config();
            match LeaseGuard::acquire(
                self.leases.clone(),
                &self.holder,
                config.lease_ttl,
                config.lease_renew_interval,
            )
            .await
            {
                Ok(guard) => *lease = Some(guard),
                Err(CompactorError::LeaseHeld {
                    holder,
                    expires_at_ms,
                }) => {
                    debug!(%holder, expires_at_ms, "Compactor lease held elsewhere, standing by");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(guard) = lease.as_ref() else {
            return Ok(None);
        };
        match self.compactor.run_cycle(now_ms(), guard).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                if e.is_conflict() {
                    *lease = None;
                }
                Err(e)
            }
        }
    }

    /// Run the leader loop every `interval` until shutdown
    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.compactor.config().interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(holder = %self.holder, interval = ?self.compactor.config().interval, "Compactor started");

            let mut lease: Option<LeaseGuard> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once(&mut lease).await {
                            Ok(Some(report)) => {
                                if report != CycleReport::default() {
                                    info!(
                                        compactions = report.compactions,
                                        downsamples = report.downsamples,
                                        expired = report.expired,
                                        swept = report.swept,
                                        failed = report.failed,
                                        "Compactor cycle complete"
                                    );
                                }
                            }
                            Ok(None) => {}
                            Err(e) if e.is_conflict() => {
                                warn!(error = %e, "Compactor cycle aborted");
                            }
                            Err(e) => {
                                error!(error = %e, "Compactor cycle failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Compactor shutting down");
                        break;
                    }
                }
            }

            if let Some(guard) = lease {
                if let Err(e) = guard.release().await {
                    warn!(error = %e, "Failed to release compactor lease");
                }
            }
        })
    }
}
