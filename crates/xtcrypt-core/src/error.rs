//! Errors surfaced by [`FileSession`](crate::FileSession) and
//! [`Client`](crate::Client).
//!
//! Lower layers report through their own enums ([`RouterError`],
//! [`CryptoError`], [`LeaseError`], [`LockError`]); this module folds them
//! into the taxonomy callers match on.

use std::time::SystemTime;

use thiserror::Error;

use crate::capability::{LeaseError, RenewalError};
use crate::context::IoContext;
use crate::crypto::{CryptoError, IntegrityFailure};
use crate::lock::{Lock, LockError, LockOwner};
use crate::replica::RouterError;
use crate::transport::{FileId, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    /// The capability expired and could not be renewed. The handle is unusable.
    #[error("capability for '{file_id}' expired: {source}")]
    CapabilityExpired {
        file_id: FileId,
        expired_at: SystemTime,
        #[source]
        source: RenewalError,
    },

    /// An explicit renewal failed; the previous capability is still in use.
    #[error("capability renewal failed: {0}")]
    Renewal(#[from] RenewalError),

    /// Every replica failed with a communication error.
    #[error("all {attempts} replicas unavailable for {context}: {source}")]
    ReplicaUnavailable {
        attempts: usize,
        #[source]
        source: TransportError,
        context: IoContext,
    },

    /// A replica refused the request.
    #[error("storage rejected request for {context}: {source}")]
    Rejected {
        #[source]
        source: TransportError,
        context: IoContext,
    },

    /// **[INTEGRITY VIOLATION]** A stored block failed verification.
    #[error("[INTEGRITY VIOLATION] block rejected for {context}: {reason}")]
    Integrity {
        reason: IntegrityFailure,
        context: IoContext,
    },

    /// Non-integrity codec failure, such as a bad key or block size.
    #[error(transparent)]
    Crypto(CryptoError),

    #[error("lock {requested} conflicts with {held}")]
    LockConflict { requested: Lock, held: Lock },

    #[error("{owner} holds no lock in [{start}, +{length})")]
    LockNotHeld {
        start: u64,
        length: u64,
        owner: LockOwner,
    },

    /// `offset + length` does not fit in a `u64`.
    #[error("range at offset {offset} with length {length} overflows")]
    InvalidRange { offset: u64, length: u64 },

    #[error("handle for '{file_id}' is closed")]
    ClosedHandle { file_id: FileId },

    /// The metadata service could not resolve the file.
    #[error("failed to resolve '{file_id}': {source}")]
    Resolve {
        file_id: FileId,
        #[source]
        source: TransportError,
    },

    /// The metadata service returned unusable data.
    #[error("invalid metadata for '{file_id}': {reason}")]
    InvalidMetadata { file_id: FileId, reason: String },
}

impl SessionError {
    /// Whether re-issuing the same call may succeed.
    ///
    /// Replica outages and lock conflicts are transient. Expiry, integrity
    /// failures and closed handles are permanent for this handle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ReplicaUnavailable { .. }
                | SessionError::LockConflict { .. }
                | SessionError::Renewal(_)
        )
    }

    /// Whether this error reports corrupted or tampered data.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, SessionError::Integrity { .. })
    }
}

impl From<RouterError> for SessionError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::ReplicaUnavailable {
                attempts,
                last_error,
                context,
            } => SessionError::ReplicaUnavailable {
                attempts,
                source: last_error,
                context,
            },
            RouterError::Rejected { source, context } => SessionError::Rejected { source, context },
            RouterError::NoReplicas { file_id } => SessionError::InvalidMetadata {
                file_id: FileId::from(file_id),
                reason: "empty replica list".to_string(),
            },
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Integrity { reason, context } => {
                SessionError::Integrity { reason, context }
            }
            other => SessionError::Crypto(other),
        }
    }
}

impl From<LockError> for SessionError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict { requested, held } => {
                SessionError::LockConflict { requested, held }
            }
            LockError::NotHeld {
                start,
                length,
                owner,
            } => SessionError::LockNotHeld {
                start,
                length,
                owner,
            },
            LockError::InvalidRange { start, length } => SessionError::InvalidRange {
                offset: start,
                length,
            },
        }
    }
}

impl From<LeaseError> for SessionError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Expired {
                file_id,
                expired_at,
                source,
            } => SessionError::CapabilityExpired {
                file_id,
                expired_at,
                source,
            },
            // Only closing invalidates a lease
            LeaseError::Invalidated { file_id } => SessionError::ClosedHandle { file_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_integrity_is_not_retryable() {
        let err: SessionError = CryptoError::Integrity {
            reason: IntegrityFailure::TagMismatch,
            context: IoContext::new().with_file("f").with_block(3),
        }
        .into();
        assert!(err.is_integrity_violation());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "[INTEGRITY VIOLATION] block rejected for file 'f', block 3: authentication tag mismatch"
        );
    }

    #[test]
    fn test_router_errors_map() {
        let err: SessionError = RouterError::ReplicaUnavailable {
            attempts: 3,
            last_error: TransportError::Connection(io::Error::from(io::ErrorKind::ConnectionReset)),
            context: IoContext::new().with_block(1),
        }
        .into();
        assert!(matches!(err, SessionError::ReplicaUnavailable { attempts: 3, .. }));
        assert!(err.is_retryable());

        let err: SessionError = RouterError::Rejected {
            source: TransportError::Unauthorized("stale".into()),
            context: IoContext::new(),
        }
        .into();
        assert!(matches!(err, SessionError::Rejected { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_lock_errors_map() {
        let held = Lock::new(0, 4, LockOwner(1)).unwrap();
        let requested = Lock::new(2, 4, LockOwner(2)).unwrap();
        let err: SessionError = LockError::Conflict { requested, held }.into();
        assert!(matches!(err, SessionError::LockConflict { .. }));
        assert!(err.is_retryable());

        let err: SessionError = LockError::InvalidRange {
            start: u64::MAX,
            length: 2,
        }
        .into();
        assert!(matches!(
            err,
            SessionError::InvalidRange {
                offset: u64::MAX,
                length: 2
            }
        ));
    }

    #[test]
    fn test_invalidated_lease_means_closed() {
        let err: SessionError = LeaseError::Invalidated {
            file_id: FileId::from("vol/file"),
        }
        .into();
        assert!(matches!(err, SessionError::ClosedHandle { .. }));
        assert_eq!(err.to_string(), "handle for 'vol/file' is closed");
    }
}
