#![forbid(unsafe_code)]

use cow_block::{MemoryRawDevice, RawDevice, WriteBackCache};
use cow_error::Result;
use cow_types::{BlockIv, BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK_SIZE: u32 = 4096;

#[derive(Debug)]
struct CountingRawDevice<D: RawDevice> {
    inner: D,
    writes: Mutex<Vec<BlockNumber>>,
    sync_calls: AtomicUsize,
}

impl<D: RawDevice> CountingRawDevice<D> {
    fn new(inner: D) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
            sync_calls: AtomicUsize::new(0),
        }
    }

    fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    fn write_sequence(&self) -> Vec<BlockNumber> {
        self.writes.lock().clone()
    }

    fn sync_count(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }
}

impl<D: RawDevice> RawDevice for CountingRawDevice<D> {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn len_blocks(&self) -> u64 {
        self.inner.len_blocks()
    }

    fn read_blocks(&self, block: BlockNumber, buf: &mut [u8], iv: BlockIv) -> Result<()> {
        self.inner.read_blocks(block, buf, iv)
    }

    fn write_blocks(&self, block: BlockNumber, data: &[u8], iv: BlockIv) -> Result<()> {
        let count = data.len() / self.block_size().as_usize();
        let mut writes = self.writes.lock();
        for i in 0..count as u64 {
            writes.push(BlockNumber(block.0 + i));
        }
        drop(writes);
        self.inner.write_blocks(block, data, iv)
    }

    fn set_len_blocks(&self, blocks: u64) -> Result<()> {
        self.inner.set_len_blocks(blocks)
    }

    fn sync(&self, force_metadata: bool) -> Result<()> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.sync(force_metadata)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

type TestCache = WriteBackCache<CountingRawDevice<MemoryRawDevice>>;

fn block_payload(block: u64, salt: u8) -> Vec<u8> {
    let mut out = vec![salt; BLOCK_SIZE as usize];
    out[..8].copy_from_slice(&block.to_le_bytes());
    out
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn build_cache(capacity: usize) -> (TestCache, MemoryRawDevice) {
    let raw = MemoryRawDevice::new(BlockSize::new(BLOCK_SIZE).expect("block size"));
    let probe = raw.clone();
    let cache =
        WriteBackCache::new(CountingRawDevice::new(raw), capacity).expect("write-back cache");
    (cache, probe)
}

fn read_block(dev: &impl RawDevice, block: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; BLOCK_SIZE as usize];
    dev.read_blocks(BlockNumber(block), &mut buf, BlockIv::NONE)
        .expect("read block");
    buf
}

#[test]
fn scenario_1_within_capacity_nothing_is_physical_before_flush() {
    let (cache, probe) = build_cache(64);
    let mut checksums = HashMap::new();
    for block in 0_u64..64_u64 {
        let payload = block_payload(block, 0xA5);
        checksums.insert(block, blake3_hex(&payload));
        cache
            .write_blocks(BlockNumber(block), &payload, BlockIv::NONE)
            .expect("write block");
    }

    assert_eq!(probe.len_blocks(), 0, "raw length must not move before flush");
    assert_eq!(cache.inner().write_count(), 0);

    cache.flush().expect("flush");
    assert_eq!(probe.len_blocks(), 64);

    for block in 0_u64..64_u64 {
        assert_eq!(blake3_hex(&read_block(&probe, block)), checksums[&block]);
        assert_eq!(blake3_hex(&read_block(&cache, block)), checksums[&block]);
    }
}

#[test]
fn scenario_2_flush_follows_staging_order() {
    let (cache, _probe) = build_cache(16);
    let order = [5_u64, 1, 9, 3, 7];
    for block in order {
        cache
            .write_blocks(BlockNumber(block), &block_payload(block, 0x11), BlockIv::NONE)
            .expect("write");
    }
    cache.flush().expect("flush");
    let expected: Vec<BlockNumber> = order.iter().map(|b| BlockNumber(*b)).collect();
    assert_eq!(cache.inner().write_sequence(), expected);
}

#[test]
fn scenario_3_overflow_evicts_and_reads_stay_correct() {
    let (cache, probe) = build_cache(8);
    let mut checksums = HashMap::new();
    for block in 0_u64..40_u64 {
        let payload = block_payload(block, 0x2A);
        checksums.insert(block, blake3_hex(&payload));
        cache
            .write_blocks(BlockNumber(block), &payload, BlockIv::NONE)
            .expect("write block");
        assert!(cache.dirty_count() <= 8);
    }
    assert_eq!(cache.stats().evictions, 32);
    assert_eq!(cache.inner().write_count(), 32);

    // Evicted and still-staged blocks read back identically.
    for block in 0_u64..40_u64 {
        assert_eq!(blake3_hex(&read_block(&cache, block)), checksums[&block]);
    }

    cache.flush().expect("flush");
    for block in 0_u64..40_u64 {
        assert_eq!(blake3_hex(&read_block(&probe, block)), checksums[&block]);
    }
}

#[test]
fn scenario_4_crash_before_flush_loses_only_staged_blocks() {
    let (cache, probe) = build_cache(256);
    let mut durable = HashMap::new();
    for block in 0_u64..20_u64 {
        let payload = block_payload(block, 0x10);
        durable.insert(block, blake3_hex(&payload));
        cache
            .write_blocks(BlockNumber(block), &payload, BlockIv::NONE)
            .expect("baseline write");
    }
    cache.sync(true).expect("sync durable baseline");
    assert_eq!(cache.inner().sync_count(), 1, "expected one explicit sync");

    for block in 0_u64..20_u64 {
        cache
            .write_blocks(BlockNumber(block), &block_payload(block, 0x77), BlockIv::NONE)
            .expect("unsynced overwrite");
    }

    // Simulated crash: the cache goes away without flushing.
    drop(cache);

    for block in 0_u64..20_u64 {
        assert_eq!(blake3_hex(&read_block(&probe, block)), durable[&block]);
    }
}

#[test]
fn scenario_5_discard_leaves_device_untouched() {
    let (cache, probe) = build_cache(64);
    for block in 0_u64..10_u64 {
        cache
            .write_blocks(BlockNumber(block), &block_payload(block, 0x33), BlockIv::NONE)
            .expect("write");
    }
    cache.flush().expect("flush baseline");
    let writes_before = cache.inner().write_count();

    for block in 0_u64..10_u64 {
        cache
            .write_blocks(BlockNumber(block), &block_payload(block, 0xF0), BlockIv::NONE)
            .expect("staged write");
    }
    assert_eq!(cache.discard(), 10);
    cache.flush().expect("flush after discard");
    assert_eq!(cache.inner().write_count(), writes_before);
    assert_eq!(read_block(&probe, 4)[8], 0x33);
}
