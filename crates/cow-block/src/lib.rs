#![forbid(unsafe_code)]
//! Raw block I/O layer.
//!
//! Provides the [`RawDevice`] capability the managed device is built on,
//! in-memory and file-backed implementations, an [`EncryptingDevice`]
//! wrapper that hands per-block IV material to a pluggable [`BlockCipher`],
//! and the bounded [`WriteBackCache`] that stages writes until flush.
//!
//! All calls are synchronous and blocking. There is no cancellation: a
//! caller that needs a timeout enforces it outside this crate.

mod cache;
mod cipher;

pub use cache::{CacheStats, WriteBackCache};
pub use cipher::{BlockCipher, EncryptingDevice};

use cow_error::{CowError, Result};
use cow_types::{BlockIv, BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Block-addressed raw storage.
///
/// Buffers passed to `read_blocks`/`write_blocks` must be a whole number of
/// blocks; the call covers `buf.len() / block_size` consecutive blocks
/// starting at `block`. `iv` is opaque key material for an encrypting layer
/// beneath; plain devices ignore it.
pub trait RawDevice: Send + Sync {
    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Current length in blocks.
    fn len_blocks(&self) -> u64;

    /// Read consecutive blocks into `buf`.
    fn read_blocks(&self, block: BlockNumber, buf: &mut [u8], iv: BlockIv) -> Result<()>;

    /// Write consecutive blocks. Writing past the end extends the device.
    fn write_blocks(&self, block: BlockNumber, data: &[u8], iv: BlockIv) -> Result<()>;

    /// Resize to exactly `blocks` blocks.
    ///
    /// A device that cannot grow any further reports `OutOfSpace`.
    fn set_len_blocks(&self, blocks: u64) -> Result<()>;

    /// Force written data to stable storage; `force_metadata` also syncs
    /// file metadata such as the length.
    fn sync(&self, force_metadata: bool) -> Result<()>;

    /// Release the device. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;
}

/// Check that `len` is a whole number of blocks and return the block count.
pub fn blocks_in_buffer(block_size: BlockSize, len: usize) -> Result<u64> {
    let size = block_size.as_usize();
    if len % size != 0 {
        return Err(CowError::InvalidArgument(format!(
            "buffer length {len} is not a multiple of block size {size}"
        )));
    }
    Ok((len / size) as u64)
}

fn byte_range(block_size: BlockSize, block: BlockNumber, len: usize) -> Result<(u64, u64)> {
    let start = block_size
        .block_to_byte(block)
        .ok_or_else(|| CowError::InvalidArgument(format!("block {block} offset overflows u64")))?;
    let end = start
        .checked_add(len as u64)
        .ok_or_else(|| CowError::InvalidArgument("block range overflows u64".to_owned()))?;
    Ok((start, end))
}

fn out_of_bounds(block: BlockNumber, count: u64, len_blocks: u64) -> CowError {
    CowError::StorageIo(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read out of bounds: block={block} count={count} len_blocks={len_blocks}"),
    ))
}

// ── In-memory device ────────────────────────────────────────────────────────

#[derive(Debug)]
struct MemoryInner {
    block_size: BlockSize,
    bytes: Mutex<Vec<u8>>,
    max_blocks: Option<u64>,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    /// Blocks that may still be written before writes start failing.
    write_budget: AtomicU64,
    block_writes: AtomicU64,
    syncs: AtomicU64,
}

/// Memory-backed raw device.
///
/// Clones share the same storage, so a test can keep a handle for
/// inspection (or corruption) while the engine owns another.
#[derive(Debug, Clone)]
pub struct MemoryRawDevice {
    inner: Arc<MemoryInner>,
}

impl MemoryRawDevice {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self::build(block_size, None)
    }

    /// A device that refuses to grow beyond `max_blocks`.
    #[must_use]
    pub fn with_max_blocks(block_size: BlockSize, max_blocks: u64) -> Self {
        Self::build(block_size, Some(max_blocks))
    }

    fn build(block_size: BlockSize, max_blocks: Option<u64>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                block_size,
                bytes: Mutex::new(Vec::new()),
                max_blocks,
                closed: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                write_budget: AtomicU64::new(u64::MAX),
                block_writes: AtomicU64::new(0),
                syncs: AtomicU64::new(0),
            }),
        }
    }

    /// Flip every bit of the byte at absolute `offset`.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut bytes = self.inner.bytes.lock();
        if let Some(byte) = bytes.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }

    /// Make every subsequent write and sync fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.write_budget.store(u64::MAX, Ordering::SeqCst);
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Allow `blocks` more block writes, then fail like [`fail_writes`].
    ///
    /// Simulates a crash partway through a multi-write sequence.
    ///
    /// [`fail_writes`]: Self::fail_writes
    pub fn fail_writes_after(&self, blocks: u64) {
        self.inner.fail_writes.store(false, Ordering::SeqCst);
        self.inner.write_budget.store(blocks, Ordering::SeqCst);
    }

    fn consume_write_budget(&self, count: u64) -> Result<()> {
        let budget = self.inner.write_budget.load(Ordering::SeqCst);
        if budget == u64::MAX {
            return Ok(());
        }
        if budget < count {
            self.inner.fail_writes.store(true, Ordering::SeqCst);
            return Err(CowError::StorageIo(io::Error::other("injected crash")));
        }
        self.inner.write_budget.store(budget - count, Ordering::SeqCst);
        Ok(())
    }

    /// Copy of the raw contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.bytes.lock().clone()
    }

    /// Total blocks physically written since creation.
    #[must_use]
    pub fn block_writes(&self) -> u64 {
        self.inner.block_writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.inner.syncs.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CowError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(CowError::StorageIo(io::Error::other("injected write failure")));
        }
        Ok(())
    }
}

impl RawDevice for MemoryRawDevice {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    fn len_blocks(&self) -> u64 {
        (self.inner.bytes.lock().len() / self.inner.block_size.as_usize()) as u64
    }

    fn read_blocks(&self, block: BlockNumber, buf: &mut [u8], _iv: BlockIv) -> Result<()> {
        self.ensure_open()?;
        let count = blocks_in_buffer(self.inner.block_size, buf.len())?;
        let (start, end) = byte_range(self.inner.block_size, block, buf.len())?;
        let bytes = self.inner.bytes.lock();
        if end > bytes.len() as u64 {
            let len_blocks = (bytes.len() / self.inner.block_size.as_usize()) as u64;
            drop(bytes);
            return Err(out_of_bounds(block, count, len_blocks));
        }
        buf.copy_from_slice(&bytes[start as usize..end as usize]);
        drop(bytes);
        Ok(())
    }

    fn write_blocks(&self, block: BlockNumber, data: &[u8], _iv: BlockIv) -> Result<()> {
        self.ensure_writable()?;
        let count = blocks_in_buffer(self.inner.block_size, data.len())?;
        let (start, end) = byte_range(self.inner.block_size, block, data.len())?;
        if let Some(max) = self.inner.max_blocks {
            if block.0.saturating_add(count) > max {
                return Err(CowError::StorageIo(io::Error::new(
                    io::ErrorKind::StorageFull,
                    format!("write past device limit of {max} blocks"),
                )));
            }
        }
        self.consume_write_budget(count)?;
        let mut bytes = self.inner.bytes.lock();
        if end > bytes.len() as u64 {
            bytes.resize(end as usize, 0);
        }
        bytes[start as usize..end as usize].copy_from_slice(data);
        drop(bytes);
        self.inner.block_writes.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }

    fn set_len_blocks(&self, blocks: u64) -> Result<()> {
        self.ensure_writable()?;
        if self.inner.max_blocks.is_some_and(|max| blocks > max) {
            return Err(CowError::OutOfSpace { requested: blocks });
        }
        let len = usize::try_from(blocks)
            .ok()
            .and_then(|b| b.checked_mul(self.inner.block_size.as_usize()))
            .ok_or(CowError::OutOfSpace { requested: blocks })?;
        self.inner.bytes.lock().resize(len, 0);
        Ok(())
    }

    fn sync(&self, _force_metadata: bool) -> Result<()> {
        self.ensure_writable()?;
        self.inner.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed raw device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug)]
pub struct FileRawDevice {
    file: File,
    block_size: BlockSize,
    len_blocks: AtomicU64,
    max_blocks: Option<u64>,
    closed: AtomicBool,
}

impl FileRawDevice {
    /// Open (creating if missing) a file as a block device.
    ///
    /// The file length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let size = u64::from(block_size.get());
        let remainder = len % size;
        if remainder != 0 {
            return Err(CowError::UnsupportedFormat(format!(
                "image length is not block-aligned: len_bytes={len} block_size={size} remainder={remainder}"
            )));
        }
        info!(
            target: "cow::block",
            event = "file_device_open",
            path = %path.display(),
            len_blocks = len / size,
            block_size = size
        );
        Ok(Self {
            file,
            block_size,
            len_blocks: AtomicU64::new(len / size),
            max_blocks: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Cap growth at `max_blocks`; larger resizes report `OutOfSpace`.
    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: u64) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CowError::Closed);
        }
        Ok(())
    }
}

impl RawDevice for FileRawDevice {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn len_blocks(&self) -> u64 {
        self.len_blocks.load(Ordering::SeqCst)
    }

    fn read_blocks(&self, block: BlockNumber, buf: &mut [u8], _iv: BlockIv) -> Result<()> {
        self.ensure_open()?;
        let count = blocks_in_buffer(self.block_size, buf.len())?;
        let (start, _) = byte_range(self.block_size, block, buf.len())?;
        let len_blocks = self.len_blocks();
        if block.0.saturating_add(count) > len_blocks {
            return Err(out_of_bounds(block, count, len_blocks));
        }
        self.file.read_exact_at(buf, start)?;
        Ok(())
    }

    fn write_blocks(&self, block: BlockNumber, data: &[u8], _iv: BlockIv) -> Result<()> {
        self.ensure_open()?;
        let count = blocks_in_buffer(self.block_size, data.len())?;
        let (start, _) = byte_range(self.block_size, block, data.len())?;
        let end_block = block.0.saturating_add(count);
        if let Some(max) = self.max_blocks {
            if end_block > max {
                return Err(CowError::StorageIo(io::Error::new(
                    io::ErrorKind::StorageFull,
                    format!("write past device limit of {max} blocks"),
                )));
            }
        }
        self.file.write_all_at(data, start)?;
        self.len_blocks.fetch_max(end_block, Ordering::SeqCst);
        Ok(())
    }

    fn set_len_blocks(&self, blocks: u64) -> Result<()> {
        self.ensure_open()?;
        if self.max_blocks.is_some_and(|max| blocks > max) {
            return Err(CowError::OutOfSpace { requested: blocks });
        }
        let len = self
            .block_size
            .block_to_byte(BlockNumber(blocks))
            .ok_or(CowError::OutOfSpace { requested: blocks })?;
        self.file.set_len(len)?;
        self.len_blocks.store(blocks, Ordering::SeqCst);
        debug!(target: "cow::block", event = "file_device_resize", len_blocks = blocks);
        Ok(())
    }

    fn sync(&self, force_metadata: bool) -> Result<()> {
        self.ensure_open()?;
        if force_metadata {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(target: "cow::block", event = "file_device_close");
        }
        Ok(())
    }
}
