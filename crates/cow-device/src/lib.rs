#![forbid(unsafe_code)]
//! Transactional managed block device.
//!
//! [`ManagedBlockDevice`] layers allocation and atomic commits over a
//! [`RawDevice`]. Every write goes through a [`WriteBackCache`]; nothing is
//! durable until [`ManagedBlockDevice::commit`] returns.
//!
//! # Layout
//!
//! ```text
//! raw block:   0          1          2 ...
//!            +----------+----------+---------------------------+
//!            | sb slot A| sb slot B| managed space (index 0..) |
//!            +----------+----------+---------------------------+
//! ```
//!
//! The free map is itself stored in managed blocks, allocated copy-on-write
//! at every commit.
//!
//! # Free-space generations
//!
//! - `committed`: the free map as of the last successful commit.
//! - `pending`: what `allocate` carves from during the open transaction.
//! - `pending_frees`: ranges freed in the open transaction. They are not
//!   allocatable until the commit that frees them is durable.
//!
//! # Commit sequence
//!
//! 1. Free the previous free-map extent into `pending_frees`.
//! 2. Allocate a fresh extent for the new map from `pending`.
//! 3. Write `pending ∪ pending_frees` there and flush the cache.
//! 4. Sync the raw device (barrier).
//! 5. Write the superblock to slot `txn % 2` and sync again.
//!
//! A crash anywhere before step 5 completes leaves the previous superblock,
//! and everything it references, intact.

mod free_map;
mod superblock;

pub use free_map::{FREE_MAP_MAGIC, FREE_MAP_VERSION, decode_free_map, encode_free_map};
pub use superblock::{
    FORMAT_VERSION, MapExtent, SUPERBLOCK_LABEL, SUPERBLOCK_SIZE, SUPERBLOCK_SLOTS, Superblock,
};

use cow_alloc::FreeSpaceMap;
use cow_block::{CacheStats, RawDevice, WriteBackCache, blocks_in_buffer};
use cow_error::{CowError, Result};
use cow_types::{BlockIv, BlockNumber, BlockSize, TxnId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Raw blocks ahead of managed index 0.
pub const RESERVED_BLOCKS: u64 = SUPERBLOCK_SLOTS;

/// Tunables for a managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Write-back cache size in blocks.
    pub cache_capacity_blocks: usize,
    /// Growth is rounded up to a multiple of this many blocks.
    pub growth_increment_blocks: u64,
    /// Pass `force_metadata` to the raw device sync at commit.
    pub force_metadata_on_commit: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            cache_capacity_blocks: 256,
            growth_increment_blocks: 64,
            force_metadata_on_commit: true,
        }
    }
}

impl DeviceOptions {
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity_blocks == 0 {
            return Err(CowError::InvalidArgument(
                "cache_capacity_blocks must be > 0".to_owned(),
            ));
        }
        if self.growth_increment_blocks == 0 {
            return Err(CowError::InvalidArgument(
                "growth_increment_blocks must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters for a managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub block_size: BlockSize,
    pub len_blocks: u64,
    pub free_blocks: u64,
    pub pending_free_blocks: u64,
    pub committed_txn: TxnId,
    pub dirty: bool,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceState {
    Open,
    /// Terminal until reopen; holds the error that poisoned the device.
    Failed(String),
    Closed,
}

/// Allocating, transactional view of a raw device.
///
/// Single-writer: mutating calls take `&mut self`. Reads take `&self` and
/// observe the open transaction's own writes.
#[derive(Debug)]
pub struct ManagedBlockDevice<D: RawDevice> {
    cache: WriteBackCache<D>,
    options: DeviceOptions,
    block_size: BlockSize,
    state: Mutex<DeviceState>,
    committed: FreeSpaceMap,
    pending: FreeSpaceMap,
    pending_frees: FreeSpaceMap,
    committed_txn: TxnId,
    committed_len: u64,
    len_blocks: u64,
    free_map_extent: MapExtent,
    dirty: bool,
}

impl<D: RawDevice> ManagedBlockDevice<D> {
    /// Format `raw` as an empty managed device.
    ///
    /// Existing contents are discarded.
    pub fn create(raw: D, options: DeviceOptions) -> Result<Self> {
        options.validate()?;
        let block_size = raw.block_size();
        raw.set_len_blocks(RESERVED_BLOCKS)?;

        let superblock = Superblock {
            block_size,
            txn: TxnId(0),
            managed_len: 0,
            free_map: MapExtent::EMPTY,
        };
        raw.write_blocks(BlockNumber(0), &superblock.encode_block(), BlockIv::NONE)?;
        // A stale superblock from an earlier format must not win at open.
        raw.write_blocks(
            BlockNumber(1),
            &vec![0_u8; block_size.as_usize()],
            BlockIv::NONE,
        )?;
        raw.sync(true)?;
        info!(
            target: "cow::device",
            event = "device_format",
            block_size = block_size.get()
        );
        Self::assemble(raw, options, &superblock, FreeSpaceMap::new())
    }

    /// Open a formatted device, recovering the last durable commit.
    pub fn open(raw: D, options: DeviceOptions) -> Result<Self> {
        options.validate()?;
        let block_size = raw.block_size();
        if raw.len_blocks() < RESERVED_BLOCKS {
            return Err(CowError::UnsupportedFormat(format!(
                "device has {} blocks, fewer than the {RESERVED_BLOCKS} superblock slots",
                raw.len_blocks()
            )));
        }

        let mut candidates = Vec::new();
        let mut rejected = Vec::new();
        let mut buf = vec![0_u8; block_size.as_usize()];
        for slot in 0..SUPERBLOCK_SLOTS {
            raw.read_blocks(BlockNumber(slot), &mut buf, BlockIv::NONE)?;
            match Superblock::decode(slot, &buf) {
                Ok(sb) if sb.block_size != block_size => rejected.push(format!(
                    "slot {slot}: recorded block size {} != device block size {block_size}",
                    sb.block_size
                )),
                Ok(sb) => candidates.push(sb),
                Err(err) => {
                    debug!(target: "cow::device", event = "superblock_rejected", slot, error = %err);
                    rejected.push(format!("slot {slot}: {err}"));
                }
            }
        }
        if candidates.is_empty() {
            return Err(CowError::UnsupportedFormat(format!(
                "no valid superblock ({})",
                rejected.join("; ")
            )));
        }

        candidates.sort_by(|a, b| b.txn.cmp(&a.txn));
        let mut last_error = None;
        for superblock in candidates {
            match load_free_map(&raw, &superblock) {
                Ok(committed) => {
                    info!(
                        target: "cow::device",
                        event = "device_open",
                        txn = superblock.txn.0,
                        managed_len = superblock.managed_len,
                        free_blocks = committed.free_blocks()
                    );
                    return Self::assemble(raw, options, &superblock, committed);
                }
                Err(err) => {
                    warn!(
                        target: "cow::device",
                        event = "superblock_fallback",
                        txn = superblock.txn.0,
                        error = %err
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CowError::UnsupportedFormat("no loadable superblock".to_owned())
        }))
    }

    /// Format a zero-length device, open anything else.
    pub fn open_or_create(raw: D, options: DeviceOptions) -> Result<Self> {
        if raw.len_blocks() == 0 {
            Self::create(raw, options)
        } else {
            Self::open(raw, options)
        }
    }

    fn assemble(
        raw: D,
        options: DeviceOptions,
        superblock: &Superblock,
        committed: FreeSpaceMap,
    ) -> Result<Self> {
        let raw_len = raw.len_blocks();
        let recorded = RESERVED_BLOCKS
            .checked_add(superblock.managed_len)
            .ok_or_else(|| CowError::UnsupportedFormat("managed length overflows".to_owned()))?;
        if raw_len < recorded {
            return Err(CowError::UnsupportedFormat(format!(
                "device truncated: {raw_len} blocks, superblock expects {recorded}"
            )));
        }

        // Growth from a transaction that never committed.
        let len_blocks = raw_len - RESERVED_BLOCKS;
        let mut pending = committed.clone();
        if len_blocks > superblock.managed_len {
            let tail = len_blocks - superblock.managed_len;
            pending.free(superblock.managed_len, tail)?;
            debug!(target: "cow::device", event = "tail_reclaimed", blocks = tail);
        }

        Ok(Self {
            cache: WriteBackCache::new(raw, options.cache_capacity_blocks)?,
            options,
            block_size: superblock.block_size,
            state: Mutex::new(DeviceState::Open),
            committed,
            pending,
            pending_frees: FreeSpaceMap::new(),
            committed_txn: superblock.txn,
            committed_len: superblock.managed_len,
            len_blocks,
            free_map_extent: superblock.free_map,
            dirty: false,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Managed length in blocks, including growth in the open transaction.
    #[must_use]
    pub fn len_blocks(&self) -> u64 {
        self.len_blocks
    }

    /// Id of the open transaction; extents written now carry this id.
    #[must_use]
    pub fn transaction_id(&self) -> TxnId {
        self.committed_txn.next()
    }

    #[must_use]
    pub fn committed_transaction_id(&self) -> TxnId {
        self.committed_txn
    }

    #[must_use]
    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Whether the open transaction has uncommitted changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), DeviceState::Failed(_))
    }

    /// The raw device underneath the cache.
    #[must_use]
    pub fn raw(&self) -> &D {
        self.cache.inner()
    }

    /// True iff `[index, index + count)` is allocatable right now.
    ///
    /// Ranges freed in the open transaction are not.
    #[must_use]
    pub fn is_free(&self, index: BlockNumber, count: u64) -> bool {
        self.pending.is_free(index.0, count)
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            block_size: self.block_size,
            len_blocks: self.len_blocks,
            free_blocks: self.pending.free_blocks(),
            pending_free_blocks: self.pending_frees.free_blocks(),
            committed_txn: self.committed_txn,
            dirty: self.dirty,
            cache: self.cache.stats(),
        }
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate `count` contiguous blocks, growing the device if needed.
    pub fn allocate(&mut self, count: u64) -> Result<BlockNumber> {
        self.ensure_writable()?;
        let result = self.allocate_inner(count);
        let start = self.track(result)?;
        self.dirty = true;
        Ok(start)
    }

    fn allocate_inner(&mut self, count: u64) -> Result<BlockNumber> {
        if count == 0 {
            return Err(CowError::InvalidArgument(
                "allocation count must be > 0".to_owned(),
            ));
        }
        if self.pending.find_first_fit(count).is_none() {
            self.grow_for(count)?;
        }
        let start = self.pending.allocate(count)?;
        trace!(
            target: "cow::device",
            event = "allocate",
            start = start.0,
            count,
            txn = self.transaction_id().0
        );
        Ok(start)
    }

    /// Extend the device so a run of `count` blocks exists at the tail.
    ///
    /// Growth is rounded up to the configured increment; if the raw device
    /// refuses that, the exact shortfall is tried once.
    fn grow_for(&mut self, count: u64) -> Result<()> {
        let tail = self.pending.free_run_ending_at(self.len_blocks);
        let need = count.saturating_sub(tail);
        let increment = self.options.growth_increment_blocks;
        let rounded = need.div_ceil(increment).saturating_mul(increment);

        let grown = match self.extend_raw(rounded) {
            Ok(()) => rounded,
            Err(CowError::OutOfSpace { .. }) if rounded > need => match self.extend_raw(need) {
                Ok(()) => need,
                Err(CowError::OutOfSpace { .. }) => {
                    return Err(CowError::OutOfSpace { requested: count });
                }
                Err(err) => return Err(err),
            },
            Err(CowError::OutOfSpace { .. }) => {
                return Err(CowError::OutOfSpace { requested: count });
            }
            Err(err) => return Err(err),
        };

        self.pending.free(self.len_blocks, grown)?;
        self.len_blocks += grown;
        debug!(
            target: "cow::device",
            event = "device_grow",
            grown,
            len_blocks = self.len_blocks
        );
        Ok(())
    }

    fn extend_raw(&self, extra: u64) -> Result<()> {
        let target = RESERVED_BLOCKS
            .checked_add(self.len_blocks)
            .and_then(|n| n.checked_add(extra))
            .ok_or(CowError::OutOfSpace { requested: extra })?;
        self.cache.set_len_blocks(target)
    }

    /// Mark a range free once the open transaction commits.
    pub fn free(&mut self, index: BlockNumber, count: u64) -> Result<()> {
        self.ensure_writable()?;
        if count == 0 {
            return Ok(());
        }
        self.check_range(index, count)?;
        if self.pending.intersects(index.0, count) {
            return Err(CowError::InvalidArgument(format!(
                "double free: [{index}, +{count}) is already free"
            )));
        }
        self.pending_frees.free(index.0, count)?;
        self.dirty = true;
        trace!(
            target: "cow::device",
            event = "free_pending",
            start = index.0,
            count,
            txn = self.transaction_id().0
        );
        Ok(())
    }

    // ── Block I/O ───────────────────────────────────────────────────────

    /// Read whole blocks starting at managed `index`.
    ///
    /// `iv` is forwarded unchanged to the raw device.
    pub fn read_blocks(&self, index: BlockNumber, buf: &mut [u8], iv: BlockIv) -> Result<()> {
        self.ensure_readable()?;
        let count = blocks_in_buffer(self.block_size, buf.len())?;
        self.check_range(index, count)?;
        let result = self.cache.read_blocks(raw_index(index), buf, iv);
        self.track(result)
    }

    /// Stage whole blocks at managed `index` for the open transaction.
    pub fn write_blocks(&mut self, index: BlockNumber, data: &[u8], iv: BlockIv) -> Result<()> {
        self.ensure_writable()?;
        let count = blocks_in_buffer(self.block_size, data.len())?;
        self.check_range(index, count)?;
        let result = self.cache.write_blocks(raw_index(index), data, iv);
        self.track(result)?;
        self.dirty = true;
        Ok(())
    }

    fn check_range(&self, index: BlockNumber, count: u64) -> Result<()> {
        match index.0.checked_add(count) {
            Some(end) if end <= self.len_blocks => Ok(()),
            _ => Err(CowError::InvalidArgument(format!(
                "range [{index}, +{count}) outside managed length {}",
                self.len_blocks
            ))),
        }
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Make the open transaction durable and start the next one.
    ///
    /// Returns the committed transaction id. A clean transaction commits
    /// nothing and returns the previous id.
    pub fn commit(&mut self) -> Result<TxnId> {
        self.ensure_writable()?;
        if !self.dirty {
            return Ok(self.committed_txn);
        }
        let txn = self.transaction_id();
        let saved_pending = self.pending.clone();
        let saved_frees = self.pending_frees.clone();
        let saved_len = self.len_blocks;

        match self.commit_inner(txn) {
            Ok(()) => Ok(txn),
            Err(err) => {
                if !err.poisons_device() {
                    // Nothing reached the device; keep the transaction open.
                    self.pending = saved_pending;
                    self.pending_frees = saved_frees;
                    if self.len_blocks > saved_len {
                        self.pending.free(saved_len, self.len_blocks - saved_len)?;
                    }
                }
                self.track(Err(err))
            }
        }
    }

    fn commit_inner(&mut self, txn: TxnId) -> Result<()> {
        if !self.free_map_extent.is_empty() {
            let old = self.free_map_extent;
            self.pending_frees.free(old.start, old.blocks)?;
        }

        // Allocation never adds more than one range (growth), so this bounds
        // the encoded map regardless of where the extent lands.
        let bound = free_map::encoded_len(
            self.pending.range_count() + self.pending_frees.range_count() + 1,
        );
        let map_blocks = self.block_size.blocks_for(bound as u64).max(1);
        let map_start = self.allocate_inner(map_blocks)?;

        let mut merged = self.pending.clone();
        merged.merge_from(&self.pending_frees)?;
        let encoded = encode_free_map(&merged);
        let extent = MapExtent {
            start: map_start.0,
            blocks: map_blocks,
            byte_len: encoded.len() as u64,
            crc: crc32c::crc32c(&encoded),
        };
        let mut padded = vec![0_u8; byte_len(self.block_size, map_blocks)?];
        padded[..encoded.len()].copy_from_slice(&encoded);

        let force = self.options.force_metadata_on_commit;
        self.cache
            .write_blocks(raw_index(map_start), &padded, BlockIv::NONE)?;
        self.cache.flush()?;
        self.cache.inner().sync(force)?;

        let superblock = Superblock {
            block_size: self.block_size,
            txn,
            managed_len: self.len_blocks,
            free_map: extent,
        };
        self.cache.inner().write_blocks(
            BlockNumber(superblock.slot()),
            &superblock.encode_block(),
            BlockIv::NONE,
        )?;
        self.cache.inner().sync(force)?;

        debug!(
            target: "cow::device",
            event = "commit",
            txn = txn.0,
            free_map_start = extent.start,
            free_map_blocks = extent.blocks,
            released = self.pending_frees.free_blocks(),
            free_blocks = merged.free_blocks()
        );
        self.pending = merged.clone();
        self.committed = merged;
        self.pending_frees = FreeSpaceMap::new();
        self.committed_txn = txn;
        self.committed_len = self.len_blocks;
        self.free_map_extent = extent;
        self.dirty = false;
        Ok(())
    }

    /// Discard the open transaction.
    ///
    /// Staged writes are dropped and allocations and frees forgotten. Blocks
    /// the device grew by stay, as free space.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_readable()?;
        let dropped = self.cache.discard();
        let mut pending = self.committed.clone();
        if self.len_blocks > self.committed_len {
            pending.free(self.committed_len, self.len_blocks - self.committed_len)?;
        }
        self.pending = pending;
        self.pending_frees = FreeSpaceMap::new();
        self.dirty = false;
        debug!(
            target: "cow::device",
            event = "abort",
            txn = self.transaction_id().0,
            dropped_blocks = dropped
        );
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Release the raw device. Uncommitted work is discarded.
    pub fn close(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == DeviceState::Closed {
                return Ok(());
            }
            *state = DeviceState::Closed;
        }
        if self.dirty {
            warn!(
                target: "cow::device",
                event = "close_discards_uncommitted",
                txn = self.transaction_id().0
            );
            self.cache.discard();
            self.dirty = false;
        }
        info!(target: "cow::device", event = "device_close", txn = self.committed_txn.0);
        self.cache.close()
    }

    /// Close without flushing anything, refusing all further use.
    ///
    /// For use after an integrity failure; never fails.
    pub fn force_close(&mut self) {
        let dropped = self.cache.discard();
        *self.state.lock() = DeviceState::Closed;
        self.dirty = false;
        if let Err(err) = self.cache.close() {
            warn!(target: "cow::device", event = "force_close_error", error = %err);
        }
        info!(
            target: "cow::device",
            event = "device_force_close",
            dropped_blocks = dropped
        );
    }

    // ── State ───────────────────────────────────────────────────────────

    fn ensure_readable(&self) -> Result<()> {
        if *self.state.lock() == DeviceState::Closed {
            return Err(CowError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        match &*self.state.lock() {
            DeviceState::Open => Ok(()),
            DeviceState::Failed(reason) => Err(CowError::DeviceFailed(reason.clone())),
            DeviceState::Closed => Err(CowError::Closed),
        }
    }

    /// Poison the device if `result` carries a poisoning error.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.poisons_device() {
                let mut state = self.state.lock();
                if *state == DeviceState::Open {
                    warn!(target: "cow::device", event = "device_poisoned", error = %err);
                    *state = DeviceState::Failed(err.to_string());
                }
            }
        }
        result
    }
}

fn raw_index(index: BlockNumber) -> BlockNumber {
    BlockNumber(index.0 + RESERVED_BLOCKS)
}

fn byte_len(block_size: BlockSize, blocks: u64) -> Result<usize> {
    usize::try_from(blocks)
        .ok()
        .and_then(|b| b.checked_mul(block_size.as_usize()))
        .ok_or_else(|| CowError::InvalidArgument(format!("{blocks} blocks overflow usize")))
}

fn load_free_map<D: RawDevice>(raw: &D, superblock: &Superblock) -> Result<FreeSpaceMap> {
    let extent = superblock.free_map;
    if extent.is_empty() {
        if superblock.managed_len != 0 {
            return Err(CowError::integrity(
                superblock.slot(),
                "superblock has managed blocks but no free map",
            ));
        }
        return Ok(FreeSpaceMap::new());
    }

    let in_bounds = extent
        .start
        .checked_add(extent.blocks)
        .is_some_and(|end| end <= superblock.managed_len);
    let capacity = byte_len(superblock.block_size, extent.blocks)?;
    if !in_bounds || extent.byte_len > capacity as u64 {
        return Err(CowError::integrity(
            extent.start,
            format!("free map extent {extent:?} outside managed length {}", superblock.managed_len),
        ));
    }

    let mut buf = vec![0_u8; capacity];
    raw.read_blocks(raw_index(BlockNumber(extent.start)), &mut buf, BlockIv::NONE)?;
    let encoded = &buf[..extent.byte_len as usize];
    let crc = crc32c::crc32c(encoded);
    if crc != extent.crc {
        return Err(CowError::integrity(
            extent.start,
            format!("free map crc mismatch: stored {:#010x}, computed {crc:#010x}", extent.crc),
        ));
    }
    decode_free_map(encoded, superblock.managed_len)
        .map_err(|err| CowError::integrity(extent.start, format!("free map: {err}")))
}
