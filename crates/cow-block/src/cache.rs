//! Bounded write-back staging cache.
//!
//! Writes are held in memory, keyed by block, in staging order. When the
//! cache is full the least-recently-staged block is written to the device
//! before the new one is admitted. [`WriteBackCache::flush`] drains every
//! staged block in staging order and is the only way staged data becomes
//! physical. Reads consult the cache first, so a session always observes its
//! own pending writes.
//!
//! Single-writer discipline is assumed: the internal mutex keeps the state
//! consistent but does not order competing writers.

use crate::{RawDevice, blocks_in_buffer};
use cow_error::{CowError, Result};
use cow_types::{BlockIv, BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct StagedBlock {
    bytes: Vec<u8>,
    iv: BlockIv,
}

#[derive(Debug, Default)]
struct StagingState {
    /// Oldest staging at the front.
    order: VecDeque<BlockNumber>,
    staged: HashMap<BlockNumber, StagedBlock>,
    evictions: u64,
    flushed_blocks: u64,
    read_hits: u64,
    read_misses: u64,
}

impl StagingState {
    fn remove_from_order(&mut self, block: BlockNumber) {
        if let Some(pos) = self.order.iter().position(|b| *b == block) {
            let _ = self.order.remove(pos);
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub staged: usize,
    pub evictions: u64,
    pub flushed_blocks: u64,
    pub read_hits: u64,
    pub read_misses: u64,
}

/// Write-back cache in front of a [`RawDevice`].
#[derive(Debug)]
pub struct WriteBackCache<D: RawDevice> {
    inner: D,
    capacity: usize,
    state: Mutex<StagingState>,
}

impl<D: RawDevice> WriteBackCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(CowError::InvalidArgument(
                "WriteBackCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            capacity: capacity_blocks,
            state: Mutex::new(StagingState::default()),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of staged, not yet physical blocks.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().staged.len()
    }

    #[must_use]
    pub fn is_staged(&self, block: BlockNumber) -> bool {
        self.state.lock().staged.contains_key(&block)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        CacheStats {
            capacity: self.capacity,
            staged: guard.staged.len(),
            evictions: guard.evictions,
            flushed_blocks: guard.flushed_blocks,
            read_hits: guard.read_hits,
            read_misses: guard.read_misses,
        }
    }

    /// Stage one block, evicting the oldest staged block if full.
    fn stage(&self, state: &mut StagingState, block: BlockNumber, bytes: Vec<u8>, iv: BlockIv) -> Result<()> {
        if state.staged.contains_key(&block) {
            state.remove_from_order(block);
        } else if state.staged.len() >= self.capacity {
            if let Some(victim) = state.order.pop_front() {
                if let Some(entry) = state.staged.remove(&victim) {
                    if let Err(err) = self.inner.write_blocks(victim, &entry.bytes, entry.iv) {
                        warn!(
                            target: "cow::block",
                            event = "cache_evict_failed",
                            block = victim.0,
                            error = %err
                        );
                        state.order.push_front(victim);
                        state.staged.insert(victim, entry);
                        return Err(err);
                    }
                    state.evictions += 1;
                    debug!(
                        target: "cow::block",
                        event = "cache_evict",
                        block = victim.0,
                        staged = state.staged.len()
                    );
                }
            }
        }
        state.order.push_back(block);
        state.staged.insert(block, StagedBlock { bytes, iv });
        trace!(target: "cow::block", event = "cache_stage", block = block.0);
        Ok(())
    }

    /// Physically write every staged block in staging order and empty the cache.
    ///
    /// On failure the blocks not yet written stay staged.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let pending = guard.order.len();
        while let Some(block) = guard.order.pop_front() {
            let Some(entry) = guard.staged.remove(&block) else {
                continue;
            };
            if let Err(err) = self.inner.write_blocks(block, &entry.bytes, entry.iv) {
                warn!(
                    target: "cow::block",
                    event = "cache_flush_failed",
                    block = block.0,
                    error = %err
                );
                guard.order.push_front(block);
                guard.staged.insert(block, entry);
                return Err(err);
            }
            guard.flushed_blocks += 1;
        }
        drop(guard);
        if pending > 0 {
            debug!(target: "cow::block", event = "cache_flush", blocks = pending);
        }
        Ok(())
    }

    /// Drop every staged block without writing it.
    pub fn discard(&self) -> usize {
        let mut guard = self.state.lock();
        let dropped = guard.staged.len();
        guard.staged.clear();
        guard.order.clear();
        drop(guard);
        if dropped > 0 {
            debug!(target: "cow::block", event = "cache_discard", blocks = dropped);
        }
        dropped
    }
}

impl<D: RawDevice> RawDevice for WriteBackCache<D> {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    /// Physical length; staged blocks past the end do not count until flushed.
    fn len_blocks(&self) -> u64 {
        self.inner.len_blocks()
    }

    fn read_blocks(&self, block: BlockNumber, buf: &mut [u8], iv: BlockIv) -> Result<()> {
        let size = self.block_size().as_usize();
        blocks_in_buffer(self.block_size(), buf.len())?;

        let mut misses = Vec::new();
        {
            let mut guard = self.state.lock();
            for (i, chunk) in buf.chunks_exact_mut(size).enumerate() {
                let index = BlockNumber(block.0 + i as u64);
                if let Some(entry) = guard.staged.get(&index) {
                    chunk.copy_from_slice(&entry.bytes);
                } else {
                    misses.push(i);
                }
            }
            guard.read_hits += (buf.len() / size - misses.len()) as u64;
            guard.read_misses += misses.len() as u64;
        }

        // Read each contiguous run of misses with one device call.
        let mut run = 0;
        while run < misses.len() {
            let first = misses[run];
            let mut last = first;
            while run + 1 < misses.len() && misses[run + 1] == last + 1 {
                run += 1;
                last = misses[run];
            }
            self.inner.read_blocks(
                BlockNumber(block.0 + first as u64),
                &mut buf[first * size..(last + 1) * size],
                iv,
            )?;
            run += 1;
        }
        Ok(())
    }

    fn write_blocks(&self, block: BlockNumber, data: &[u8], iv: BlockIv) -> Result<()> {
        let size = self.block_size().as_usize();
        blocks_in_buffer(self.block_size(), data.len())?;
        let mut guard = self.state.lock();
        for (i, chunk) in data.chunks_exact(size).enumerate() {
            self.stage(&mut guard, BlockNumber(block.0 + i as u64), chunk.to_vec(), iv)?;
        }
        drop(guard);
        Ok(())
    }

    fn set_len_blocks(&self, blocks: u64) -> Result<()> {
        self.inner.set_len_blocks(blocks)
    }

    /// Flush staged blocks, then sync the device.
    fn sync(&self, force_metadata: bool) -> Result<()> {
        self.flush()?;
        self.inner.sync(force_metadata)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
