//! Short-lived access capabilities and their renewal.
//!
//! A [`CapabilityLease`] holds the current capability as an immutable
//! snapshot behind a short critical section. Readers clone the `Arc` and never
//! hold the lock across a network call; renewal swaps in a new snapshot once
//! the authority has answered.

pub mod renewal;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::stats::SessionStats;
use crate::transport::{CapabilityAuthority, FileId, TransportError, UserCredentials};

pub use renewal::RenewalTask;

/// An authorization token with an absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Capability {
    token: Vec<u8>,
    expires_at: SystemTime,
}

impl Capability {
    pub fn new(token: impl Into<Vec<u8>>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// The opaque token bytes presented to storage nodes.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// True iff `now + margin < expiry`.
    pub fn is_valid_for(&self, now: SystemTime, margin: Duration) -> bool {
        now.checked_add(margin)
            .is_some_and(|deadline| deadline < self.expires_at)
    }

    /// True once `now` has reached the expiry.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or_default()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("token", &format_args!("[{} bytes]", self.token.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Errors from a renewal attempt. The current capability is left untouched.
#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("authority refused renewal: {0}")]
    Authority(#[source] TransportError),

    #[error("renewal timed out after {0:?}")]
    Timeout(Duration),

    /// The lease was invalidated by closing the session.
    #[error("capability lease invalidated")]
    Invalidated,

    /// An earlier renewal failed past expiry. Only a fresh open recovers.
    #[error("capability lease expired, reopen the file")]
    Expired,
}

/// Errors from [`CapabilityLease::ensure_valid`].
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Renewal failed and the capability is past its expiry.
    #[error("capability for '{file_id}' expired and could not be renewed: {source}")]
    Expired {
        file_id: FileId,
        expired_at: SystemTime,
        #[source]
        source: RenewalError,
    },

    #[error("capability for '{file_id}' was invalidated")]
    Invalidated { file_id: FileId },
}

/// The capability of one session plus the machinery to keep it fresh.
pub struct CapabilityLease {
    file_id: FileId,
    current: RwLock<Arc<Capability>>,
    /// Serializes renewals so concurrent callers trigger a single exchange
    renewal_gate: tokio::sync::Mutex<()>,
    invalidated: AtomicBool,
    /// Set once renewal failed after expiry; never cleared
    expired: AtomicBool,
    renewal_timeout: Duration,
    stats: Arc<SessionStats>,
}

impl fmt::Debug for CapabilityLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityLease")
            .field("file_id", &self.file_id)
            .field("current", &*self.current.read())
            .field("invalidated", &self.invalidated.load(Ordering::Relaxed))
            .field("expired", &self.expired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CapabilityLease {
    pub fn new(
        file_id: FileId,
        capability: Capability,
        renewal_timeout: Duration,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            file_id,
            current: RwLock::new(Arc::new(capability)),
            renewal_gate: tokio::sync::Mutex::new(()),
            invalidated: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            renewal_timeout,
            stats,
        }
    }

    /// The current capability.
    pub fn snapshot(&self) -> Arc<Capability> {
        Arc::clone(&self.current.read())
    }

    /// True iff the current capability satisfies `now + margin < expiry`.
    pub fn is_valid_for(&self, now: SystemTime, margin: Duration) -> bool {
        !self.is_invalidated()
            && !self.has_expired()
            && self.current.read().is_valid_for(now, margin)
    }

    /// True once the capability expired without a successful renewal. The
    /// lease stays unusable from then on.
    pub fn has_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Permanently invalidate the lease. Later renewals fail.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Exchange the current capability for a fresh one.
    ///
    /// On success the token and expiry are replaced together; on failure the
    /// existing capability is kept.
    #[instrument(level = "debug", skip(self, authority, user), fields(file = %self.file_id))]
    pub async fn renew(
        &self,
        authority: &dyn CapabilityAuthority,
        user: &UserCredentials,
    ) -> Result<Arc<Capability>, RenewalError> {
        let _gate = self.renewal_gate.lock().await;
        self.renew_locked(authority, user).await
    }

    /// Return a capability valid for at least `margin`, renewing synchronously
    /// if needed.
    ///
    /// Concurrent callers that all find the capability inside the margin share
    /// one renewal. If renewal fails while the capability is still valid the
    /// old one is returned; once it has expired the call fails, and so does
    /// every later call without contacting the authority.
    pub async fn ensure_valid(
        &self,
        clock: &dyn Clock,
        margin: Duration,
        authority: &dyn CapabilityAuthority,
        user: &UserCredentials,
    ) -> Result<Arc<Capability>, LeaseError> {
        if self.is_invalidated() {
            return Err(self.invalidated_error());
        }
        if self.has_expired() {
            return Err(self.expired_error(RenewalError::Expired));
        }

        let current = self.snapshot();
        if current.is_valid_for(clock.now(), margin) {
            return Ok(current);
        }

        let _gate = self.renewal_gate.lock().await;

        // Another caller may have renewed, or given up, while we waited
        if self.has_expired() {
            return Err(self.expired_error(RenewalError::Expired));
        }
        let current = self.snapshot();
        if current.is_valid_for(clock.now(), margin) {
            return Ok(current);
        }

        match self.renew_locked(authority, user).await {
            Ok(renewed) => Ok(renewed),
            Err(RenewalError::Invalidated) => Err(self.invalidated_error()),
            Err(source) => {
                let now = clock.now();
                if current.is_expired(now) {
                    warn!(
                        file = %self.file_id,
                        error = %source,
                        "Capability expired and renewal failed"
                    );
                    self.expired.store(true, Ordering::Release);
                    Err(self.expired_error(source))
                } else {
                    warn!(
                        file = %self.file_id,
                        error = %source,
                        remaining = ?current.remaining(now),
                        "Renewal failed, continuing with current capability"
                    );
                    Ok(current)
                }
            }
        }
    }

    async fn renew_locked(
        &self,
        authority: &dyn CapabilityAuthority,
        user: &UserCredentials,
    ) -> Result<Arc<Capability>, RenewalError> {
        if self.is_invalidated() {
            return Err(RenewalError::Invalidated);
        }
        if self.has_expired() {
            return Err(RenewalError::Expired);
        }

        let current = self.snapshot();
        let outcome = tokio::time::timeout(
            self.renewal_timeout,
            authority.renew_capability(&self.file_id, &current, user),
        )
        .await;

        let renewed = match outcome {
            Ok(Ok(capability)) => Arc::new(capability),
            Ok(Err(err)) => {
                self.stats.record_renewal_failure();
                return Err(RenewalError::Authority(err));
            }
            Err(_elapsed) => {
                self.stats.record_renewal_failure();
                return Err(RenewalError::Timeout(self.renewal_timeout));
            }
        };

        // Closing may have raced with the round trip
        if self.is_invalidated() {
            return Err(RenewalError::Invalidated);
        }

        *self.current.write() = Arc::clone(&renewed);
        self.stats.record_renewal();
        debug!(expires_at = ?renewed.expires_at(), "Capability renewed");
        Ok(renewed)
    }

    fn expired_error(&self, source: RenewalError) -> LeaseError {
        LeaseError::Expired {
            file_id: self.file_id.clone(),
            expired_at: self.snapshot().expires_at(),
            source,
        }
    }

    fn invalidated_error(&self) -> LeaseError {
        LeaseError::Invalidated {
            file_id: self.file_id.clone(),
        }
    }
}
