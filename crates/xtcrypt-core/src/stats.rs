//! Per-session I/O counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one file session.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Completed `read` calls
    pub reads: AtomicU64,
    /// Completed `write` calls
    pub writes: AtomicU64,
    /// Bytes returned by `read`
    pub bytes_read: AtomicU64,
    /// Bytes accepted by `write`
    pub bytes_written: AtomicU64,
    /// Sealed blocks fetched from storage
    pub blocks_fetched: AtomicU64,
    /// Sealed blocks stored
    pub blocks_stored: AtomicU64,
    /// Blocks synthesized as zeros (never written or beyond end of file)
    pub zero_blocks: AtomicU64,
    /// Partially covered blocks merged with existing content
    pub merges: AtomicU64,
    /// Times the preferred replica changed
    pub failovers: AtomicU64,
    /// Successful capability renewals
    pub renewals: AtomicU64,
    /// Failed capability renewals
    pub renewal_failures: AtomicU64,
    /// I/O or lock requests refused because of a conflicting lock
    pub lock_conflicts: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_block_fetched(&self) {
        self.blocks_fetched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_block_stored(&self) {
        self.blocks_stored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zero_block(&self) {
        self.zero_blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_merge(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_renewal_failure(&self) {
        self.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of the counters
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            blocks_fetched: self.blocks_fetched.load(Ordering::Relaxed),
            blocks_stored: self.blocks_stored.load(Ordering::Relaxed),
            zero_blocks: self.zero_blocks.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub blocks_fetched: u64,
    pub blocks_stored: u64,
    pub zero_blocks: u64,
    pub merges: u64,
    pub failovers: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub lock_conflicts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_snapshot_reflects_records() {
        let stats = SessionStats::new();
        stats.record_read(10);
        stats.record_read(5);
        stats.record_write(7);
        stats.record_failover();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.reads, 2);
        assert_eq!(snapshot.bytes_read, 15);
        assert_eq!(snapshot.writes, 1);
        assert_eq!(snapshot.bytes_written, 7);
        assert_eq!(snapshot.failovers, 1);
        assert_eq!(snapshot.renewals, 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(SessionStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_block_fetched();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().blocks_fetched, 8000);
    }
}
