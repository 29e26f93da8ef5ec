//! Replica selection with sticky failover.
//!
//! Every storage call goes to the currently selected replica. A communication
//! failure (timeout, connection error, malformed response) moves on to the next
//! replica, wrapping around, until each replica has been tried once. A replica
//! that succeeds after a failover becomes the new selection, so a dead replica
//! is not probed again on the next call. Application-level rejections are
//! returned immediately without trying other replicas.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, instrument, trace, warn};

use super::{ReplicaDescriptor, RouterError};
use crate::context::IoContext;
use crate::stats::SessionStats;
use crate::transport::{FileId, RequestCredentials, StorageTransport, TransportError};

/// A sealed block and the replica that served it.
#[derive(Debug)]
pub struct FetchedBlock<'a> {
    pub sealed: Vec<u8>,
    pub replica: &'a ReplicaDescriptor,
}

/// Routes block operations for one file to its replicas.
pub struct ReplicaRouter {
    file_id: FileId,
    /// Read-only after construction
    replicas: Arc<[ReplicaDescriptor]>,
    /// Always `< replicas.len()`
    selected: AtomicUsize,
    transport: Arc<dyn StorageTransport>,
    io_timeout: Duration,
    stats: Arc<SessionStats>,
}

impl std::fmt::Debug for ReplicaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRouter")
            .field("file_id", &self.file_id)
            .field("replicas", &self.replicas)
            .field("selected", &self.selected.load(Ordering::Relaxed))
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl ReplicaRouter {
    pub fn new(
        file_id: FileId,
        replicas: Vec<ReplicaDescriptor>,
        transport: Arc<dyn StorageTransport>,
        io_timeout: Duration,
        stats: Arc<SessionStats>,
    ) -> Result<Self, RouterError> {
        if replicas.is_empty() {
            return Err(RouterError::NoReplicas {
                file_id: file_id.to_string(),
            });
        }

        Ok(Self {
            file_id,
            replicas: replicas.into(),
            selected: AtomicUsize::new(0),
            transport,
            io_timeout,
            stats,
        })
    }

    /// The ordered replica list.
    pub fn replicas(&self) -> &[ReplicaDescriptor] {
        &self.replicas
    }

    /// Index of the currently preferred replica.
    pub fn selected_index(&self) -> usize {
        self.selected.load(Ordering::Acquire)
    }

    /// The currently preferred replica.
    pub fn selected(&self) -> &ReplicaDescriptor {
        &self.replicas[self.selected_index()]
    }

    /// Fetch a sealed block. `Ok(None)` means the block was never written.
    #[instrument(level = "trace", skip(self, credentials), fields(file = %self.file_id))]
    pub async fn read_block(
        &self,
        block_index: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<Option<FetchedBlock<'_>>, RouterError> {
        let transport = &self.transport;
        let replicas = &self.replicas;
        let file_id = &self.file_id;
        let (sealed, served_by) = self
            .route(Some(block_index), move |i| {
                transport.read_block(&replicas[i], file_id, block_index, credentials)
            })
            .await?;
        Ok(sealed.map(|sealed| FetchedBlock {
            sealed,
            replica: &self.replicas[served_by],
        }))
    }

    /// Store a sealed block on the selected replica.
    #[instrument(
        level = "trace",
        skip(self, sealed, credentials),
        fields(file = %self.file_id, size = sealed.len())
    )]
    pub async fn write_block(
        &self,
        block_index: u64,
        sealed: &[u8],
        credentials: RequestCredentials<'_>,
    ) -> Result<(), RouterError> {
        let transport = &self.transport;
        let replicas = &self.replicas;
        let file_id = &self.file_id;
        self.route(Some(block_index), move |i| {
            transport.write_block(&replicas[i], file_id, block_index, sealed, credentials)
        })
        .await
        .map(|((), _)| ())
    }

    /// Drop blocks at and beyond `block_count` on the selected replica.
    #[instrument(level = "debug", skip(self, credentials), fields(file = %self.file_id))]
    pub async fn truncate(
        &self,
        block_count: u64,
        credentials: RequestCredentials<'_>,
    ) -> Result<(), RouterError> {
        let transport = &self.transport;
        let replicas = &self.replicas;
        let file_id = &self.file_id;
        self.route(None, move |i| {
            transport.truncate(&replicas[i], file_id, block_count, credentials)
        })
        .await
        .map(|((), _)| ())
    }

    /// Tell every non-selected replica that the file changed.
    ///
    /// Best effort: failures are logged and counted, never returned.
    pub async fn notify_others(&self, credentials: RequestCredentials<'_>) -> usize {
        let selected = self.selected_index();
        let notifications = self
            .replicas
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != selected)
            .map(|(_, replica)| async move {
                let outcome = tokio::time::timeout(
                    self.io_timeout,
                    self.transport
                        .notify_update(replica, &self.file_id, credentials),
                )
                .await
                .unwrap_or(Err(TransportError::Timeout(self.io_timeout)));
                if let Err(ref err) = outcome {
                    warn!(
                        replica = %replica.address,
                        error = %err,
                        "Replica update notification failed"
                    );
                }
                outcome.is_err()
            });

        let failed = join_all(notifications)
            .await
            .into_iter()
            .filter(|failed| *failed)
            .count();
        debug!(
            notified = self.replicas.len() - 1 - failed,
            failed, "Notified replicas of update"
        );
        failed
    }

    /// Run `op` against the replicas in failover order. Returns the value and
    /// the index of the replica that produced it.
    async fn route<T, F, Fut>(
        &self,
        block_index: Option<u64>,
        op: F,
    ) -> Result<(T, usize), RouterError>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let count = self.replicas.len();
        let start = self.selected_index();
        let mut last_error = None;

        for attempt in 0..count {
            let index = (start + attempt) % count;
            let replica = &self.replicas[index];

            let outcome = match tokio::time::timeout(self.io_timeout, op(index)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(TransportError::Timeout(self.io_timeout)),
            };

            match outcome {
                Ok(value) => {
                    if index != start {
                        // Keep a newer choice made by a concurrent call
                        if self
                            .selected
                            .compare_exchange(start, index, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            self.stats.record_failover();
                            debug!(
                                from = %self.replicas[start].address,
                                to = %replica.address,
                                "Failed over to replica"
                            );
                        }
                    }
                    trace!(replica = %replica.address, attempt, "Replica call succeeded");
                    return Ok((value, index));
                }
                Err(err) if err.is_communication_failure() => {
                    warn!(
                        replica = %replica.address,
                        attempt,
                        error = %err,
                        "Replica communication failure"
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    return Err(RouterError::Rejected {
                        source: err,
                        context: self.context(block_index, Some(replica)),
                    });
                }
            }
        }

        let last_error = last_error.unwrap_or(TransportError::Timeout(self.io_timeout));
        warn!(attempts = count, "All replicas unavailable");
        Err(RouterError::ReplicaUnavailable {
            attempts: count,
            last_error,
            context: self.context(block_index, None),
        })
    }

    fn context(&self, block_index: Option<u64>, replica: Option<&ReplicaDescriptor>) -> IoContext {
        let mut context = IoContext::new().with_file(self.file_id.as_str());
        if let Some(index) = block_index {
            context = context.with_block(index);
        }
        if let Some(replica) = replica {
            context = context.with_replica(replica.address.clone());
        }
        context
    }
}
