//! The public file handle.
//!
//! # Concurrency
//!
//! A session may be shared between tasks. Synchronized state lives behind
//! short critical sections that are never held across a storage call:
//!
//! - `state` holds the file size and the closed flag.
//! - `locks` holds the byte-range lock table.
//! - The capability is an immutable snapshot inside [`CapabilityLease`].
//! - The selected replica is an atomic inside [`ReplicaRouter`].
//!
//! Two async locks order I/O against everything else:
//!
//! - `io_gate`: reads and writes take it shared; lock acquisition, truncate
//!   and close take it exclusively. A lock is therefore never granted while
//!   a conflicting read-modify-write is in flight.
//! - Per-block locks (see [`block_locks`]) serialize writers touching the same
//!   block, acquired in ascending block order.

pub mod block_locks;
mod io;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::capability::{Capability, CapabilityLease, RenewalError, RenewalTask};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::crypto::BlockCodec;
use crate::error::SessionError;
use crate::lock::{Lock, LockError, LockOwner, LockTable};
use crate::replica::{ReplicaDescriptor, ReplicaRouter};
use crate::stats::{SessionStats, SessionStatsSnapshot};
use crate::transport::{
    CapabilityAuthority, FileId, RequestCredentials, ResolvedFile, StorageTransport,
    UserCredentials,
};

use block_locks::BlockLockManager;

#[derive(Debug)]
struct SessionState {
    /// Authoritative for read clamping
    file_size: u64,
    closed: bool,
    /// Set once any block was stored or the size changed
    dirty: bool,
    /// Offset past which the last block still holds bytes a shrink removed
    stale_tail: Option<u64>,
}

/// An open, encrypted file.
///
/// Created by [`Client::open`](crate::Client::open).
pub struct FileSession {
    file_id: FileId,
    user: UserCredentials,
    owner: LockOwner,
    codec: BlockCodec,
    router: ReplicaRouter,
    lease: Arc<CapabilityLease>,
    authority: Arc<dyn CapabilityAuthority>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    io_gate: tokio::sync::RwLock<()>,
    block_locks: BlockLockManager,
    state: Mutex<SessionState>,
    locks: Mutex<LockTable>,
    renewal: tokio::sync::Mutex<Option<RenewalTask>>,
    stats: Arc<SessionStats>,
}

impl fmt::Debug for FileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSession")
            .field("file_id", &self.file_id)
            .field("owner", &self.owner)
            .field("block_size", &self.codec.block_size())
            .field("state", &*self.state.lock())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Collaborators a session is built from.
pub(crate) struct SessionParts {
    pub file_id: FileId,
    pub resolved: ResolvedFile,
    pub user: UserCredentials,
    pub owner: LockOwner,
    pub storage: Arc<dyn StorageTransport>,
    pub authority: Arc<dyn CapabilityAuthority>,
    pub clock: Arc<dyn Clock>,
    pub config: SessionConfig,
}

impl FileSession {
    /// Build a session and, if configured, start background renewal.
    ///
    /// Must be called from within a tokio runtime when a renewal period is set.
    pub(crate) fn new(parts: SessionParts) -> Result<Self, SessionError> {
        let SessionParts {
            file_id,
            resolved,
            user,
            owner,
            storage,
            authority,
            clock,
            config,
        } = parts;

        let stats = Arc::new(SessionStats::new());
        let codec = BlockCodec::new(resolved.file_key, resolved.block_size)?;
        let router = ReplicaRouter::new(
            file_id.clone(),
            resolved.replicas,
            storage,
            config.io_timeout,
            Arc::clone(&stats),
        )?;
        let lease = Arc::new(CapabilityLease::new(
            file_id.clone(),
            resolved.capability,
            config.renewal_timeout,
            Arc::clone(&stats),
        ));

        let renewal = config.renewal_period.map(|period| {
            RenewalTask::spawn(
                Arc::clone(&lease),
                Arc::clone(&authority),
                user.clone(),
                period,
            )
        });

        Ok(Self {
            file_id,
            user,
            owner,
            codec,
            router,
            lease,
            authority,
            clock,
            config,
            io_gate: tokio::sync::RwLock::new(()),
            block_locks: BlockLockManager::new(),
            state: Mutex::new(SessionState {
                file_size: resolved.file_size,
                closed: false,
                dirty: false,
                stale_tail: None,
            }),
            locks: Mutex::new(LockTable::new()),
            renewal: tokio::sync::Mutex::new(renewal),
            stats,
        })
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Owner used by [`read`](Self::read), [`write`](Self::write) and
    /// [`lock`](Self::lock).
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// The capability currently attached to storage calls.
    pub fn capability(&self) -> Arc<Capability> {
        self.lease.snapshot()
    }

    pub fn replicas(&self) -> &[ReplicaDescriptor] {
        self.router.replicas()
    }

    pub fn selected_replica(&self) -> &ReplicaDescriptor {
        self.router.selected()
    }

    /// Plaintext bytes per encryption block.
    pub fn block_size(&self) -> usize {
        self.codec.block_size()
    }

    /// Logical file size as seen by this session.
    pub fn size(&self) -> u64 {
        self.state.lock().file_size
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Renew the capability now, regardless of its remaining lifetime.
    pub async fn renew_capability(&self) -> Result<Arc<Capability>, SessionError> {
        self.ensure_open()?;
        match self.lease.renew(self.authority.as_ref(), &self.user).await {
            Ok(capability) => Ok(capability),
            Err(RenewalError::Expired) => Err(SessionError::CapabilityExpired {
                file_id: self.file_id.clone(),
                expired_at: self.lease.snapshot().expires_at(),
                source: RenewalError::Expired,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Lock `[start, start + length)` for this handle's owner.
    pub async fn lock(&self, start: u64, length: u64) -> Result<Lock, SessionError> {
        self.lock_as(start, length, self.owner).await
    }

    /// Lock a range on behalf of `owner`. A length of zero locks to the end
    /// of the file.
    ///
    /// Waits for in-flight reads and writes to finish first.
    #[instrument(level = "debug", skip(self), fields(file = %self.file_id))]
    pub async fn lock_as(
        &self,
        start: u64,
        length: u64,
        owner: LockOwner,
    ) -> Result<Lock, SessionError> {
        let _gate = self.io_gate.write().await;
        self.ensure_open()?;

        let result = self.locks.lock().acquire(start, length, owner);
        match result {
            Ok(lock) => {
                debug!(%lock, "Lock granted");
                Ok(lock)
            }
            Err(err) => Err(self.lock_error(err)),
        }
    }

    pub fn unlock(&self, start: u64, length: u64) -> Result<(), SessionError> {
        self.unlock_as(start, length, self.owner)
    }

    pub fn unlock_as(&self, start: u64, length: u64, owner: LockOwner) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.locks.lock().release(start, length, owner)?;
        debug!(start, length, %owner, "Lock released");
        Ok(())
    }

    /// Release every lock held by `owner`, for example when a process sharing
    /// this handle goes away. Returns how many locks were dropped.
    pub fn unlock_owner(&self, owner: LockOwner) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let released = self.locks.lock().release_owner(owner);
        debug!(%owner, released, "Owner locks released");
        Ok(released)
    }

    /// The first lock that would block `owner` from locking the range.
    pub fn test_lock(
        &self,
        start: u64,
        length: u64,
        owner: LockOwner,
    ) -> Result<Option<Lock>, SessionError> {
        self.ensure_open()?;
        Ok(self.locks.lock().test(start, length, owner)?)
    }

    /// Locks currently held through this handle.
    pub fn locks(&self) -> Vec<Lock> {
        self.locks.lock().held().to_vec()
    }

    /// Close the handle.
    ///
    /// New calls fail with [`SessionError::ClosedHandle`] immediately; calls
    /// already in flight run to completion first. If this session stored data
    /// the other replicas are notified. Locks are released and the capability
    /// is invalidated.
    #[instrument(level = "debug", skip(self), fields(file = %self.file_id))]
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            state.closed = true;
        }

        if let Some(mut task) = self.renewal.lock().await.take() {
            task.shutdown().await;
        }

        // Drain in-flight I/O
        let _gate = self.io_gate.write().await;

        let dirty = self.state.lock().dirty;
        if dirty && self.config.notify_replicas_on_close && self.router.replicas().len() > 1 {
            let capability = self.lease.snapshot();
            let credentials = RequestCredentials {
                capability: &capability,
                user: &self.user,
            };
            self.router.notify_others(credentials).await;
        }

        self.locks.lock().clear();
        self.lease.invalidate();
        self.block_locks.cleanup_unused_locks();
        debug!(stats = ?self.stats.snapshot(), "Session closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state.lock().closed {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    fn closed_error(&self) -> SessionError {
        SessionError::ClosedHandle {
            file_id: self.file_id.clone(),
        }
    }

    fn lock_error(&self, err: LockError) -> SessionError {
        if matches!(err, LockError::Conflict { .. }) {
            self.stats.record_lock_conflict();
            debug!(error = %err, "Lock conflict");
        }
        err.into()
    }

    /// A capability valid for at least the renewal margin.
    async fn authorize(&self) -> Result<Arc<Capability>, SessionError> {
        Ok(self
            .lease
            .ensure_valid(
                self.clock.as_ref(),
                self.config.renewal_margin,
                self.authority.as_ref(),
                &self.user,
            )
            .await?)
    }
}
