#![forbid(unsafe_code)]
//! Blob write/read behaviour on 4 KiB blocks with default configuration.

use cow_blob::{BlobConfig, BlobHeader, BlobReader, BlobWriter, free_blob};
use cow_block::MemoryRawDevice;
use cow_device::{DeviceOptions, ManagedBlockDevice, RESERVED_BLOCKS};
use cow_error::CowError;
use cow_extent::{BlockAccessor, DescriptorType};
use cow_types::BlockSize;
use proptest::prelude::*;
use std::io::{self, Read, Seek, SeekFrom};

const MIB: usize = 1 << 20;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn device() -> (ManagedBlockDevice<MemoryRawDevice>, MemoryRawDevice) {
    init_tracing();
    let raw = MemoryRawDevice::new(BlockSize::new(4096).expect("block size"));
    let probe = raw.clone();
    let dev = ManagedBlockDevice::create(raw, DeviceOptions::default()).expect("create");
    (dev, probe)
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed) | 0x9E37_0000;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

fn store(dev: &mut ManagedBlockDevice<MemoryRawDevice>, data: &[u8]) -> BlobHeader {
    let mut writer =
        BlobWriter::new(dev, BlockAccessor::default(), BlobConfig::default()).expect("writer");
    writer.write_bytes(data).expect("write");
    let header = writer.finish().expect("finish");
    dev.commit().expect("commit");
    header
}

#[test]
fn sizes_round_trip_with_expected_shape() {
    let (mut dev, _) = device();
    let cases = [
        (0, 1, DescriptorType::Hole),
        (1000, 1, DescriptorType::Data),
        (MIB, 1, DescriptorType::Data),
        (4 * MIB, 4, DescriptorType::Data),
        (10 * MIB, 1, DescriptorType::Dir),
    ];
    for (i, (len, extents, kind)) in cases.into_iter().enumerate() {
        let data = payload(len, i as u8);
        let header = store(&mut dev, &data);
        assert_eq!(header.total_len, len as u64);
        assert_eq!(header.extents.len(), extents, "len {len}");
        assert!(header.extents.iter().all(|e| e.kind == kind), "len {len}");

        let encoded = header.encode();
        let mut reader = BlobReader::from_header_bytes(&dev, &encoded).expect("reader");
        assert_eq!(reader.len(), len as u64);
        assert_eq!(reader.read_to_vec().expect("read"), data, "len {len}");
    }
}

#[test]
fn indirect_root_covers_whole_blob() {
    let (mut dev, _) = device();
    let header = store(&mut dev, &payload(10 * MIB, 3));
    let root = header.extents[0];
    assert!(header.is_indirect());
    assert_eq!(root.level, 1);
    assert_eq!(root.user_data, 10 * MIB as u64);
}

#[test]
fn seek_and_read_at_cross_extent_boundaries() {
    let (mut dev, _) = device();
    let data = payload(10 * MIB + 123, 9);
    let header = store(&mut dev, &data);
    let mut reader = BlobReader::new(&dev, header).expect("reader");

    let mut buf = vec![0_u8; 8192];
    for offset in [MIB - 4096, 3 * MIB - 1, 9 * MIB + 10] {
        assert_eq!(reader.read_at(offset as u64, &mut buf).expect("read_at"), buf.len());
        assert_eq!(buf, data[offset..offset + buf.len()]);
    }
    assert_eq!(reader.position(), 0);

    reader.seek(SeekFrom::Start(5 * MIB as u64 - 10)).expect("seek");
    let mut small = [0_u8; 20];
    reader.read_exact(&mut small).expect("read_exact");
    assert_eq!(small, data[5 * MIB - 10..5 * MIB + 10]);

    reader.seek(SeekFrom::End(-100)).expect("seek end");
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).expect("tail");
    assert_eq!(tail, data[data.len() - 100..]);

    reader.seek(SeekFrom::End(50)).expect("seek past end");
    assert_eq!(reader.read(&mut small).expect("read past end"), 0);
}

#[test]
fn io_copy_streams_through_writer() {
    let (mut dev, _) = device();
    let data = payload(3 * MIB + 17, 4);
    let mut writer =
        BlobWriter::new(&mut dev, BlockAccessor::default(), BlobConfig::default()).expect("writer");
    let copied = io::copy(&mut io::Cursor::new(&data), &mut writer).expect("copy");
    assert_eq!(copied, data.len() as u64);
    let header = writer.finish().expect("finish");
    dev.commit().expect("commit");

    let mut reader = BlobReader::new(&dev, header).expect("reader");
    let mut out = Vec::new();
    io::copy(&mut reader, &mut out).expect("copy out");
    assert_eq!(out, data);
}

#[test]
fn freeing_blob_returns_all_space() {
    let (mut dev, _) = device();
    let header = store(&mut dev, &payload(10 * MIB, 5));
    assert!(dev.stats().free_blocks < dev.len_blocks() - 2560);

    let freed = free_blob(&mut dev, &header).expect("free");
    assert_eq!(freed, 11);
    dev.commit().expect("commit");

    let stats = dev.stats();
    assert_eq!(stats.free_blocks, stats.len_blocks - 1);
}

#[test]
fn corrupt_leaf_reports_integrity() {
    let (mut dev, probe) = device();
    let header = store(&mut dev, &payload(1000, 6));
    let leaf = header.extents[0].block_index[0];
    probe.corrupt_byte(((leaf + RESERVED_BLOCKS) * 4096) as usize + 10);

    let mut reader = BlobReader::new(&dev, header).expect("reader");
    match reader.read_to_vec() {
        Err(CowError::Integrity { block, .. }) => assert_eq!(block, leaf),
        other => panic!("expected integrity error, got {other:?}"),
    }
}

#[test]
fn forged_root_span_fails_without_reserving_it() {
    let (mut dev, _) = device();
    let mut header = store(&mut dev, &payload(10 * MIB, 8));
    assert!(header.is_indirect());
    // Header and root agree with each other but not with the DIR node.
    header.extents[0].user_data = 1 << 46;
    header.total_len = 1 << 46;

    let mut reader = BlobReader::from_header_bytes(&dev, &header.encode()).expect("reader");
    assert_eq!(reader.len(), 1 << 46);
    match reader.read_to_vec() {
        Err(CowError::Integrity { block, .. }) => {
            assert_eq!(block, header.extents[0].block_index[0]);
        }
        other => panic!("expected integrity error, got {:?}", other.map(|v| v.len())),
    }
}

#[test]
fn dropped_writer_leaks_extents() {
    let (mut dev, _) = device();
    let used = |d: &ManagedBlockDevice<MemoryRawDevice>| {
        let s = d.stats();
        s.len_blocks - s.free_blocks
    };
    let before = used(&dev);
    {
        let mut writer = BlobWriter::new(&mut dev, BlockAccessor::default(), BlobConfig::default())
            .expect("writer");
        writer.write_bytes(&payload(2 * MIB, 7)).expect("write");
    }
    assert!(dev.is_dirty());
    assert!(used(&dev) >= before + 512);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Small extents and fanout force deep trees from modest payloads.
    #[test]
    fn arbitrary_lengths_round_trip_with_random_access(
        len in 0_usize..12_000,
        seed in any::<u8>(),
        probe in any::<prop::sample::Index>(),
        window in 1_usize..700,
    ) {
        let raw = MemoryRawDevice::new(BlockSize::new(512).expect("block size"));
        let mut dev = ManagedBlockDevice::create(raw, DeviceOptions::default()).expect("create");
        let config = BlobConfig { max_extent_size: 200, direct_pointers: 3, dir_fanout: 3 };
        let data = payload(len, seed);

        let mut writer = BlobWriter::new(&mut dev, BlockAccessor::default(), config).expect("writer");
        // Uneven write sizes exercise chunk splitting.
        for piece in data.chunks(97) {
            writer.write_bytes(piece).expect("write");
        }
        let header = writer.finish().expect("finish");
        prop_assert_eq!(header.is_indirect(), len > 600);
        dev.commit().expect("commit");

        let mut reader = BlobReader::new(&dev, header).expect("reader");
        prop_assert_eq!(reader.read_to_vec().expect("read"), data.clone());
        if len > 0 {
            let offset = probe.index(len);
            let mut buf = vec![0_u8; window];
            let n = reader.read_at(offset as u64, &mut buf).expect("read_at");
            prop_assert_eq!(n, window.min(len - offset));
            prop_assert_eq!(&buf[..n], &data[offset..offset + n]);
        }
    }
}
