//! Advisory byte-range locks held through one file handle.
//!
//! Locks are exclusive: a range held by one owner conflicts with any
//! overlapping lock request or I/O from another owner. A length of zero means
//! "to the end of the file".

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies the holder of a lock, typically a process or handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwner(pub u64);

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner {}", self.0)
    }
}

/// A claim on `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lock {
    pub start: u64,
    /// Zero covers everything from `start` onwards.
    pub length: u64,
    pub owner: LockOwner,
}

impl Lock {
    /// Build a lock, rejecting ranges whose end does not fit in a `u64`.
    pub fn new(start: u64, length: u64, owner: LockOwner) -> Result<Self, LockError> {
        if length != 0 && start.checked_add(length).is_none() {
            return Err(LockError::InvalidRange { start, length });
        }
        Ok(Self {
            start,
            length,
            owner,
        })
    }

    fn from_bounds(start: u64, end: u64, owner: LockOwner) -> Self {
        let length = if end == u64::MAX { 0 } else { end - start };
        Self {
            start,
            length,
            owner,
        }
    }

    /// Exclusive end offset; `u64::MAX` for locks that run to the end.
    pub fn end(&self) -> u64 {
        if self.length == 0 {
            u64::MAX
        } else {
            self.start.saturating_add(self.length)
        }
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end()
    }

    fn touches(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end()
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.length == 0 {
            write!(f, "[{}, EOF) held by {}", self.start, self.owner)
        } else {
            write!(f, "[{}, {}) held by {}", self.start, self.end(), self.owner)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {requested} conflicts with {held}")]
    Conflict { requested: Lock, held: Lock },

    #[error("{owner} holds no lock in [{start}, +{length})")]
    NotHeld {
        start: u64,
        length: u64,
        owner: LockOwner,
    },

    #[error("range start {start} length {length} overflows")]
    InvalidRange { start: u64, length: u64 },
}

/// The set of locks held through one handle.
///
/// Locks of the same owner are kept coalesced: after every operation no two
/// locks of one owner overlap or touch.
#[derive(Debug, Default, Clone)]
pub struct LockTable {
    locks: Vec<Lock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `[start, start + length)` for `owner`.
    ///
    /// Returns the coalesced lock now covering the range. Re-acquiring a range
    /// the owner already holds is a no-op.
    pub fn acquire(
        &mut self,
        start: u64,
        length: u64,
        owner: LockOwner,
    ) -> Result<Lock, LockError> {
        let requested = Lock::new(start, length, owner)?;
        if let Some(held) = self.conflicting(&requested) {
            return Err(LockError::Conflict { requested, held });
        }

        let (mut merged_start, mut merged_end) = (requested.start, requested.end());
        self.locks.retain(|lock| {
            if lock.owner == owner && lock.touches(merged_start, merged_end) {
                merged_start = merged_start.min(lock.start);
                merged_end = merged_end.max(lock.end());
                false
            } else {
                true
            }
        });

        let merged = Lock::from_bounds(merged_start, merged_end, owner);
        let at = self.locks.partition_point(|lock| lock.start <= merged.start);
        self.locks.insert(at, merged);
        Ok(merged)
    }

    /// Give up `[start, start + length)`. Locks partly inside the range are
    /// trimmed or split.
    pub fn release(&mut self, start: u64, length: u64, owner: LockOwner) -> Result<(), LockError> {
        let range = Lock::new(start, length, owner)?;
        let (start, end) = (range.start, range.end());

        if !self
            .locks
            .iter()
            .any(|lock| lock.owner == owner && lock.overlaps(start, end))
        {
            return Err(LockError::NotHeld {
                start,
                length,
                owner,
            });
        }

        let mut remaining = Vec::with_capacity(self.locks.len() + 1);
        for lock in self.locks.drain(..) {
            if lock.owner != owner || !lock.overlaps(start, end) {
                remaining.push(lock);
                continue;
            }
            if lock.start < start {
                remaining.push(Lock::from_bounds(lock.start, start, owner));
            }
            if end < lock.end() {
                remaining.push(Lock::from_bounds(end, lock.end(), owner));
            }
        }
        remaining.sort_by_key(|lock| lock.start);
        self.locks = remaining;
        Ok(())
    }

    /// First lock of another owner that would block the request, if any.
    pub fn test(
        &self,
        start: u64,
        length: u64,
        owner: LockOwner,
    ) -> Result<Option<Lock>, LockError> {
        let requested = Lock::new(start, length, owner)?;
        Ok(self.conflicting(&requested))
    }

    /// Check that `owner` may perform I/O on `[offset, offset + length)`.
    ///
    /// Empty ranges never conflict.
    pub fn check_io(&self, offset: u64, length: u64, owner: LockOwner) -> Result<(), LockError> {
        if length == 0 {
            return Ok(());
        }
        let requested = Lock::new(offset, length, owner)?;
        match self.conflicting(&requested) {
            Some(held) => Err(LockError::Conflict { requested, held }),
            None => Ok(()),
        }
    }

    /// Drop every lock of `owner`, returning how many were held.
    pub fn release_owner(&mut self, owner: LockOwner) -> usize {
        let before = self.locks.len();
        self.locks.retain(|lock| lock.owner != owner);
        before - self.locks.len()
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }

    /// Held locks ordered by start offset.
    pub fn held(&self) -> &[Lock] {
        &self.locks
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn conflicting(&self, requested: &Lock) -> Option<Lock> {
        let end = requested.end();
        self.locks
            .iter()
            .find(|lock| lock.owner != requested.owner && lock.overlaps(requested.start, end))
            .copied()
    }
}
