//! Replica failover and integrity behaviour seen through a session.

mod common;

use std::time::Duration;

use common::{FILE, Harness, address};
use xtcrypt_core::crypto::IntegrityFailure;
use xtcrypt_core::{FileId, SessionError};

#[tokio::test]
async fn test_dead_first_replica_fails_over_and_sticks() {
    let h = Harness::new(3, 4);
    h.storage.unreachable.insert(address(0));
    let session = h.open().await;

    session.write(b"ABCDEFGH", 0).await.unwrap();
    assert_eq!(session.selected_replica().address, address(1));
    assert_eq!(Harness::read(&session, 0, 8).await, b"ABCDEFGH");

    // The dead replica was only probed by the first call
    assert_eq!(h.storage.calls_to(&address(0)), 1);
    assert_eq!(session.stats().failovers, 1);
    assert_eq!(h.storage.calls_to(&address(2)), 0);
}

#[tokio::test]
async fn test_failover_mid_session_keeps_reading_your_writes() {
    // Replicas share state, as if they replicate among themselves
    let h = Harness::shared(2, 4);
    let session = h.open().await;
    session.write(b"ABCD", 0).await.unwrap();
    assert_eq!(session.selected_replica().address, address(0));

    h.storage.unreachable.insert(address(0));
    assert_eq!(Harness::read(&session, 0, 4).await, b"ABCD");
    assert_eq!(session.selected_replica().address, address(1));

    session.write(b"EFGH", 4).await.unwrap();
    assert_eq!(Harness::read(&session, 0, 8).await, b"ABCDEFGH");
}

#[tokio::test]
async fn test_all_replicas_down() {
    let h = Harness::new(2, 4);
    h.storage.unreachable.insert(address(0));
    h.storage.unreachable.insert(address(1));
    let session = h.open().await;

    let err = session.write(b"ABCD", 0).await.unwrap_err();
    match err {
        SessionError::ReplicaUnavailable {
            attempts, context, ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(context.block_index, Some(0));
            assert_eq!(context.file_id.as_deref(), Some(FILE));
        }
        other => panic!("expected ReplicaUnavailable, got {other:?}"),
    }
    assert!(session.size() == 0);
    assert_eq!(session.selected_replica().address, address(0));
}

#[tokio::test]
async fn test_rejection_is_not_failed_over() {
    let h = Harness::new(2, 4);
    h.storage.rejecting.insert(address(0));
    let session = h.open().await;

    let err = session.write(b"ABCD", 0).await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected { .. }));
    assert!(!err.is_retryable());
    assert_eq!(h.storage.calls_to(&address(1)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_replica_times_out_and_fails_over() {
    let h = Harness::new(2, 4);
    h.storage.hanging.insert(address(0));
    let session = h.open().await;

    session.write(b"ABCD", 0).await.unwrap();
    assert_eq!(session.selected_replica().address, address(1));
    assert_eq!(session.stats().failovers, 1);
}

#[tokio::test]
async fn test_partial_failure_keeps_lower_blocks() {
    let h = Harness::new(1, 4);
    let session = h.open().await;
    session.write(b"ABCD", 0).await.unwrap();

    // Block 1 lands, block 2 hits a broken connection
    *h.storage.write_budget.lock() = Some(1);
    let err = session.write(b"EFGHIJKL", 4).await.unwrap_err();
    assert!(matches!(err, SessionError::ReplicaUnavailable { .. }));
    assert!(err.is_retryable());
    assert_eq!(session.size(), 8);

    *h.storage.write_budget.lock() = None;
    assert_eq!(Harness::read(&session, 0, 12).await, b"ABCDEFGH");

    let file = FileId::from(FILE);
    assert_eq!(h.storage.inner.stored_blocks(&address(0), &file), vec![0, 1]);
}

#[tokio::test]
async fn test_corrupted_block_is_an_integrity_error() {
    let h = Harness::new(2, 4);
    let session = h.open().await;
    session.write(b"ABCDEFGH", 0).await.unwrap();

    let file = FileId::from(FILE);
    let mut sealed = h.storage.inner.block(&address(0), &file, 1).unwrap();
    sealed[0] ^= 0x01;
    h.storage.inner.put_raw(&address(0), &file, 1, sealed);

    let mut buf = [0u8; 8];
    let err = session.read(&mut buf, 0).await.unwrap_err();
    match &err {
        SessionError::Integrity { reason, context } => {
            assert_eq!(*reason, IntegrityFailure::TagMismatch);
            assert_eq!(context.block_index, Some(1));
            assert_eq!(context.replica.as_deref(), Some(address(0).as_str()));
        }
        other => panic!("expected Integrity, got {other:?}"),
    }
    assert!(err.is_integrity_violation());
    assert!(!err.is_retryable());

    // Never retried on another replica, never read as zeros
    assert_eq!(h.storage.calls_to(&address(1)), 0);
    assert_eq!(session.stats().failovers, 0);
}

#[tokio::test]
async fn test_integrity_error_names_serving_replica() {
    let h = Harness::new(3, 4);
    h.storage.unreachable.insert(address(0));
    let session = h.open().await;
    session.write(b"ABCD", 0).await.unwrap();

    let file = FileId::from(FILE);
    let mut sealed = h.storage.inner.block(&address(1), &file, 0).unwrap();
    sealed[0] ^= 0x80;
    h.storage.inner.put_raw(&address(1), &file, 0, sealed);

    let err = session.read(&mut [0u8; 4], 0).await.unwrap_err();
    match err {
        SessionError::Integrity { context, .. } => {
            assert_eq!(context.replica.as_deref(), Some(address(1).as_str()));
        }
        other => panic!("expected Integrity, got {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_block_is_an_integrity_error() {
    let h = Harness::new(1, 4);
    let session = h.open().await;
    session.write(b"ABCD", 0).await.unwrap();

    let file = FileId::from(FILE);
    let mut sealed = h.storage.inner.block(&address(0), &file, 0).unwrap();
    sealed.pop();
    h.storage.inner.put_raw(&address(0), &file, 0, sealed);

    // A merge needs the stored block too
    let err = session.write(b"x", 1).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Integrity {
            reason: IntegrityFailure::Truncated { .. },
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_slow_replica_within_timeout_is_kept() {
    let h = Harness::new(2, 4);
    *h.storage.write_delay.lock() = Some(Duration::from_millis(500));
    let session = h.open().await;

    session.write(b"ABCD", 0).await.unwrap();
    assert_eq!(session.selected_replica().address, address(0));
    assert_eq!(session.stats().failovers, 0);
}
