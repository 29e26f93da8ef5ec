//! Per-block reader-writer locks for one session.
//!
//! Writers hold a block exclusively across its read-modify-write cycle so two
//! straddling writes on the same handle cannot lose each other's bytes.
//!
//! # Deadlock Prevention
//!
//! Every caller locks a contiguous block range in ascending index order and
//! never upgrades a read guard to a write guard.

use std::ops::RangeInclusive;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Lazily created lock per block index.
#[derive(Debug, Default)]
pub struct BlockLockManager {
    locks: DashMap<u64, Arc<RwLock<()>>>,
}

impl BlockLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock of one block.
    pub fn block_lock(&self, index: u64) -> Arc<RwLock<()>> {
        self.locks
            .entry(index)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared guards on every block of `range`, acquired in ascending order.
    pub async fn read_range(&self, range: RangeInclusive<u64>) -> Vec<OwnedRwLockReadGuard<()>> {
        let mut guards = Vec::new();
        for index in range {
            guards.push(self.block_lock(index).read_owned().await);
        }
        guards
    }

    /// Exclusive guards on every block of `range`, acquired in ascending order.
    pub async fn write_range(&self, range: RangeInclusive<u64>) -> Vec<OwnedRwLockWriteGuard<()>> {
        let mut guards = Vec::new();
        for index in range {
            guards.push(self.block_lock(index).write_owned().await);
        }
        guards
    }

    /// Drop locks nobody is holding.
    pub fn cleanup_unused_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_lock_reuse() {
        let manager = BlockLockManager::new();
        let a = manager.block_lock(3);
        let b = manager.block_lock(3);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_readers_share() {
        let manager = BlockLockManager::new();
        let first = manager.read_range(0..=3).await;
        let second = timeout(Duration::from_millis(100), manager.read_range(2..=5)).await;
        assert!(second.is_ok(), "Readers should not block each other");
        drop(first);
    }

    #[tokio::test]
    async fn test_writer_blocks_overlapping_range() {
        let manager = Arc::new(BlockLockManager::new());
        let acquired = Arc::new(AtomicBool::new(false));

        let guards = manager.write_range(4..=6).await;

        let handle = tokio::spawn({
            let manager = Arc::clone(&manager);
            let acquired = Arc::clone(&acquired);
            async move {
                let _guards = manager.read_range(6..=8).await;
                acquired.store(true, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquired.load(Ordering::SeqCst), "Reader should wait for writer");

        drop(guards);
        timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_held_locks() {
        let manager = BlockLockManager::new();
        let held = manager.write_range(0..=1).await;
        let _ = manager.block_lock(9);
        assert_eq!(manager.lock_count(), 3);

        manager.cleanup_unused_locks();
        assert_eq!(manager.lock_count(), 2);

        drop(held);
        manager.cleanup_unused_locks();
        assert_eq!(manager.lock_count(), 0);
    }
}
