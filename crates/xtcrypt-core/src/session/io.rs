//! Block-aligned read, write and truncate.

use std::ops::{Range, RangeInclusive};

use tracing::{debug, instrument, trace};

use super::FileSession;
use crate::context::IoContext;
use crate::error::SessionError;
use crate::lock::LockOwner;
use crate::transport::RequestCredentials;

/// Keep the per-block lock map from growing without bound on large files.
const BLOCK_LOCK_CLEANUP_THRESHOLD: usize = 1024;

/// The part of one block touched by a byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockSpan {
    index: u64,
    /// Offset of the block's first byte in the file
    block_start: u64,
    /// Touched bytes, relative to the block
    within_block: Range<usize>,
    /// Touched bytes, relative to the caller's buffer
    within_buffer: Range<usize>,
}

impl BlockSpan {
    fn covers_block(&self, block_size: usize) -> bool {
        self.within_block.start == 0 && self.within_block.end == block_size
    }
}

/// Indices of the blocks overlapping `[offset, offset + length)`. `length`
/// must be non-zero.
fn block_range(offset: u64, length: u64, block_size: usize) -> RangeInclusive<u64> {
    let bs = block_size as u64;
    (offset / bs)..=((offset + length - 1) / bs)
}

/// Split `[offset, offset + length)` into per-block spans in ascending order.
fn plan_spans(offset: u64, length: u64, block_size: usize) -> Vec<BlockSpan> {
    let bs = block_size as u64;
    let end = offset + length;

    block_range(offset, length, block_size)
        .map(|index| {
            let block_start = index * bs;
            let from = offset.max(block_start);
            let to = end.min(block_start.saturating_add(bs));
            BlockSpan {
                index,
                block_start,
                within_block: (from - block_start) as usize..(to - block_start) as usize,
                within_buffer: (from - offset) as usize..(to - offset) as usize,
            }
        })
        .collect()
}

impl FileSession {
    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read, which is smaller than `buf.len()`
    /// when the range crosses the end of file and zero at or past it.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, SessionError> {
        self.read_as(buf, offset, self.owner).await
    }

    /// Read on behalf of `owner`, checked against other owners' locks.
    #[instrument(level = "debug", skip(self, buf), fields(file = %self.file_id, len = buf.len()))]
    pub async fn read_as(
        &self,
        buf: &mut [u8],
        offset: u64,
        owner: LockOwner,
    ) -> Result<usize, SessionError> {
        let _gate = self.io_gate.read().await;
        self.ensure_open()?;

        let file_size = self.state.lock().file_size;
        if buf.is_empty() || offset >= file_size {
            self.stats.record_read(0);
            return Ok(0);
        }
        let length = (buf.len() as u64).min(file_size - offset);

        self.check_io(offset, length, owner)?;

        let block_size = self.codec.block_size();
        let _guards = self
            .block_locks
            .read_range(block_range(offset, length, block_size))
            .await;

        for span in plan_spans(offset, length, block_size) {
            let plaintext = self.fetch_block(span.index).await?;
            let dest = &mut buf[span.within_buffer.clone()];
            match plaintext {
                Some(block) => dest.copy_from_slice(&block[span.within_block.clone()]),
                None => dest.fill(0),
            }
        }

        let n = length as usize;
        self.stats.record_read(n);
        trace!(offset, n, "Read complete");
        Ok(n)
    }

    /// Write `data` at `offset`, returning `data.len()`.
    ///
    /// Blocks are stored in ascending order. On failure the blocks before the
    /// failing one are durable and the size reflects them; nothing after it
    /// was written.
    pub async fn write(&self, data: &[u8], offset: u64) -> Result<usize, SessionError> {
        self.write_as(data, offset, self.owner).await
    }

    /// Write on behalf of `owner`, checked against other owners' locks.
    #[instrument(level = "debug", skip(self, data), fields(file = %self.file_id, len = data.len()))]
    pub async fn write_as(
        &self,
        data: &[u8],
        offset: u64,
        owner: LockOwner,
    ) -> Result<usize, SessionError> {
        let _gate = self.io_gate.read().await;
        self.ensure_open()?;

        if data.is_empty() {
            self.stats.record_write(0);
            return Ok(0);
        }
        let length = data.len() as u64;
        let end = offset
            .checked_add(length)
            .ok_or(SessionError::InvalidRange { offset, length })?;

        self.check_io(offset, length, owner)?;

        let block_size = self.codec.block_size();
        let _guards = self
            .block_locks
            .write_range(block_range(offset, length, block_size))
            .await;

        // Sampled under the block guards: any writer of these blocks has
        // already published its size
        let file_size = self.state.lock().file_size;

        for span in plan_spans(offset, length, block_size) {
            let source = &data[span.within_buffer.clone()];
            let plaintext = if span.covers_block(block_size) {
                source.to_vec()
            } else {
                let existing = if span.block_start >= file_size {
                    None
                } else {
                    self.fetch_block(span.index).await?
                };
                let mut block = existing.unwrap_or_else(|| vec![0u8; block_size]);
                self.stats.record_merge();
                block[span.within_block.clone()].copy_from_slice(source);
                block
            };

            self.store_block(span.index, &plaintext).await?;

            let committed_end = end.min(span.block_start.saturating_add(block_size as u64));
            let mut state = self.state.lock();
            state.file_size = state.file_size.max(committed_end);
            state.dirty = true;
            if state
                .stale_tail
                .is_some_and(|from| from / block_size as u64 == span.index)
            {
                state.stale_tail = None;
            }
        }

        self.stats.record_write(data.len());
        if self.block_locks.lock_count() > BLOCK_LOCK_CLEANUP_THRESHOLD {
            self.block_locks.cleanup_unused_locks();
        }
        trace!(offset, n = data.len(), "Write complete");
        Ok(data.len())
    }

    /// Set the logical size.
    ///
    /// Shrinking drops the blocks past the new last block from storage, then
    /// re-seals that block with its tail zeroed. The size changes only once
    /// storage has dropped the blocks, so a failed shrink leaves the file as
    /// it was. Growing only moves the size; the gap reads as zeros.
    #[instrument(level = "debug", skip(self), fields(file = %self.file_id))]
    pub async fn truncate(&self, new_size: u64) -> Result<(), SessionError> {
        let _gate = self.io_gate.write().await;
        self.ensure_open()?;

        let old_size = self.state.lock().file_size;
        if new_size == old_size {
            return Ok(());
        }
        let (low, high) = (old_size.min(new_size), old_size.max(new_size));
        self.check_io(low, high - low, self.owner)?;

        if new_size < old_size {
            let block_size = self.codec.block_size() as u64;
            let block_count = new_size.div_ceil(block_size);
            let capability = self.authorize().await?;
            let credentials = RequestCredentials {
                capability: &capability,
                user: &self.user,
            };
            self.router.truncate(block_count, credentials).await?;

            let index = new_size / block_size;
            let tail = new_size % block_size;
            {
                let mut state = self.state.lock();
                state.file_size = new_size;
                state.dirty = true;
                // Bytes of the new last block past `new_size` are stale until
                // it is re-sealed
                state.stale_tail = match state.stale_tail {
                    _ if tail == 0 => None,
                    Some(from) if from / block_size == index => Some(from.min(new_size)),
                    _ => Some(new_size),
                };
            }

            if tail != 0 {
                // Fetching applies the stale-tail mask
                if let Some(block) = self.fetch_block(index).await? {
                    self.stats.record_merge();
                    self.store_block(index, &block).await?;
                }
                self.state.lock().stale_tail = None;
            }
        } else {
            let mut state = self.state.lock();
            state.file_size = new_size;
            state.dirty = true;
        }

        debug!(old_size, new_size, "Truncated");
        Ok(())
    }

    /// Fetch and open one block. `None` means storage never saw it.
    async fn fetch_block(&self, index: u64) -> Result<Option<Vec<u8>>, SessionError> {
        let capability = self.authorize().await?;
        let credentials = RequestCredentials {
            capability: &capability,
            user: &self.user,
        };

        match self.router.read_block(index, credentials).await? {
            Some(fetched) => {
                let context = IoContext::new()
                    .with_file(self.file_id.as_str())
                    .with_block(index)
                    .with_replica(fetched.replica.address.clone());
                let mut plaintext = self.codec.decrypt(index, &fetched.sealed, &context)?;
                self.mask_stale_tail(index, &mut plaintext);
                self.stats.record_block_fetched();
                Ok(Some(plaintext))
            }
            None => {
                self.stats.record_zero_block();
                trace!(block = index, "Block not stored, reading zeros");
                Ok(None)
            }
        }
    }

    /// Seal and store one full block.
    async fn store_block(&self, index: u64, plaintext: &[u8]) -> Result<(), SessionError> {
        let sealed = self.codec.encrypt(index, plaintext)?;
        let capability = self.authorize().await?;
        let credentials = RequestCredentials {
            capability: &capability,
            user: &self.user,
        };
        self.router.write_block(index, &sealed, credentials).await?;
        self.stats.record_block_stored();
        Ok(())
    }

    /// Zero the bytes a failed shrink left behind in block `index`.
    fn mask_stale_tail(&self, index: u64, block: &mut [u8]) {
        let block_size = self.codec.block_size() as u64;
        if let Some(from) = self.state.lock().stale_tail
            && from / block_size == index
        {
            block[(from % block_size) as usize..].fill(0);
        }
    }

    fn check_io(&self, offset: u64, length: u64, owner: LockOwner) -> Result<(), SessionError> {
        let result = self.locks.lock().check_io(offset, length, owner);
        result.map_err(|err| self.lock_error(err))
    }
}
