//! Periodic background renewal of a session's capability.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{CapabilityLease, RenewalError};
use crate::transport::{CapabilityAuthority, UserCredentials};

/// Handle to the background task renewing a lease every `period`.
///
/// The task stops when [`RenewalTask::shutdown`] is awaited, when the lease is
/// invalidated or has expired, or when the handle is dropped.
pub struct RenewalTask {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RenewalTask {
    /// Spawn the renewal loop on the current tokio runtime.
    ///
    /// The first renewal happens one full `period` after spawning.
    pub fn spawn(
        lease: Arc<CapabilityLease>,
        authority: Arc<dyn CapabilityAuthority>,
        user: UserCredentials,
        period: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        // Sender dropped or shutdown requested
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match lease.renew(authority.as_ref(), &user).await {
                    Ok(capability) => {
                        debug!(
                            expires_at = ?capability.expires_at(),
                            "Background renewal succeeded"
                        );
                    }
                    Err(RenewalError::Invalidated | RenewalError::Expired) => break,
                    Err(err) => {
                        warn!(error = %err, "Background renewal failed, will retry next period");
                    }
                }
            }
            debug!("Renewal task stopped");
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for it to finish.
    ///
    /// A renewal in flight is allowed to complete first.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
            && err.is_panic()
        {
            warn!("Renewal task panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
