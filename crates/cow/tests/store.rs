#![forbid(unsafe_code)]
//! End-to-end store behaviour across the engine crates.

use cow::{
    AccessorOptions, BlobReader, BlockCipher, BlockIv, BlockNumber, BlockSize, ChecksumAlgorithm,
    CompressionAlgorithm, CowError, DeviceOptions, EncryptingDevice, ManagedBlockDevice,
    MemoryRawDevice, StoreConfig, TxnId, read_blob, write_blob,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sample(len: usize) -> Vec<u8> {
    // Zero runs interleaved with noise so compression has work to do.
    (0..len)
        .map(|i| if (i / 512) % 3 == 0 { 0 } else { (i * 31 % 241) as u8 })
        .collect()
}

/// XOR keystream keyed on (block, iv); blocks with a zero IV pass in clear.
struct XofCipher {
    key: [u8; 32],
}

impl XofCipher {
    fn apply(&self, block: BlockNumber, iv: BlockIv, data: &mut [u8]) {
        if iv == BlockIv::NONE {
            return;
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(&block.0.to_le_bytes());
        hasher.update(&iv.high.to_le_bytes());
        hasher.update(&iv.low.to_le_bytes());
        let mut pad = vec![0_u8; data.len()];
        hasher.finalize_xof().fill(&mut pad);
        for (byte, k) in data.iter_mut().zip(pad) {
            *byte ^= k;
        }
    }
}

impl BlockCipher for XofCipher {
    fn encrypt_block(&self, block: BlockNumber, iv: BlockIv, data: &mut [u8]) {
        self.apply(block, iv, data);
    }

    fn decrypt_block(&self, block: BlockNumber, iv: BlockIv, data: &mut [u8]) {
        self.apply(block, iv, data);
    }
}

#[test]
fn file_store_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.img");
    let config_path = dir.path().join("store.json");
    std::fs::write(
        &config_path,
        r#"{ "block_size": 1024, "blob": { "max_extent_size": 65536 } }"#,
    )
    .unwrap();
    let config = StoreConfig::from_file(&config_path).unwrap();

    let data = sample(300_000);
    let header = {
        let mut dev = cow::open_file_device(&path, &config).unwrap();
        let header = write_blob(&mut dev, &config, &data).unwrap();
        assert!(header.is_indirect());
        assert_eq!(dev.commit().unwrap(), TxnId(1));
        dev.close().unwrap();
        header.encode()
    };

    let dev = cow::open_file_device(&path, &config).unwrap();
    assert_eq!(dev.committed_transaction_id(), TxnId(1));
    assert_eq!(read_blob(&dev, &header).unwrap(), data);
}

#[test]
fn missing_config_file_is_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = StoreConfig::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, CowError::StorageIo(_)));
}

#[test]
fn encrypted_compressed_ditto_blob_round_trip() {
    init_tracing();
    let config = StoreConfig {
        block_size: 4096,
        accessor: AccessorOptions {
            checksum: ChecksumAlgorithm::Blake3,
            compression: CompressionAlgorithm::ZeroRun,
            encrypt: true,
            copies: 2,
        },
        ..StoreConfig::default()
    };
    let bs = config.block_size().unwrap();
    let raw = MemoryRawDevice::new(bs);
    let probe = raw.clone();
    let mut dev = ManagedBlockDevice::create(
        EncryptingDevice::new(raw, XofCipher { key: [3; 32] }),
        config.device,
    )
    .unwrap();

    let data = sample(3 << 20);
    let header = write_blob(&mut dev, &config, &data).unwrap();
    dev.commit().unwrap();
    let encoded = header.encode();
    assert_eq!(read_blob(&dev, &encoded).unwrap(), data);
    drop(dev);

    // Same key: readable after reopen.
    let dev = ManagedBlockDevice::open(
        EncryptingDevice::new(probe.clone(), XofCipher { key: [3; 32] }),
        DeviceOptions::default(),
    )
    .unwrap();
    assert_eq!(read_blob(&dev, &encoded).unwrap(), data);
    drop(dev);

    // Wrong key: metadata opens, payloads fail verification.
    let dev = ManagedBlockDevice::open(
        EncryptingDevice::new(probe, XofCipher { key: [4; 32] }),
        DeviceOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        read_blob(&dev, &encoded),
        Err(CowError::Integrity { .. })
    ));
}

#[test]
fn second_copy_masks_corrupt_first_copy() {
    init_tracing();
    let config = StoreConfig {
        block_size: 512,
        accessor: AccessorOptions {
            copies: 2,
            ..AccessorOptions::default()
        },
        ..StoreConfig::default()
    };
    let raw = MemoryRawDevice::new(config.block_size().unwrap());
    let probe = raw.clone();
    let mut dev = ManagedBlockDevice::create(raw, config.device).unwrap();

    let data = sample(2000);
    let header = write_blob(&mut dev, &config, &data).unwrap();
    dev.commit().unwrap();
    let leaf = header.extents[0];
    assert_eq!(leaf.copies().count(), 2);

    let first = leaf.block_index[0] + cow::RESERVED_BLOCKS;
    probe.corrupt_byte((first * 512) as usize + 100);
    assert_eq!(read_blob(&dev, &header.encode()).unwrap(), data);

    let second = leaf.block_index[1] + cow::RESERVED_BLOCKS;
    probe.corrupt_byte((second * 512) as usize + 100);
    assert!(matches!(
        read_blob(&dev, &header.encode()),
        Err(CowError::Integrity { .. })
    ));
}

#[test]
fn crash_mid_commit_keeps_previous_blob() {
    init_tracing();
    let config = StoreConfig {
        block_size: 512,
        blob: cow::BlobConfig {
            max_extent_size: 4096,
            ..cow::BlobConfig::default()
        },
        ..StoreConfig::default()
    };
    let raw = MemoryRawDevice::new(config.block_size().unwrap());
    let probe = raw.clone();
    let mut dev = ManagedBlockDevice::create(raw, config.device).unwrap();

    let first = sample(50_000);
    let kept = write_blob(&mut dev, &config, &first).unwrap().encode();
    dev.commit().unwrap();
    let free_after_first = dev.stats().free_blocks;

    let _lost = write_blob(&mut dev, &config, &sample(20_000)).unwrap();
    probe.fail_writes_after(3);
    assert!(matches!(dev.commit(), Err(CowError::StorageIo(_))));
    assert!(dev.is_failed());
    drop(dev);
    probe.fail_writes(false);

    let dev = ManagedBlockDevice::open(probe, DeviceOptions::default()).unwrap();
    assert_eq!(dev.committed_transaction_id(), TxnId(1));
    assert!(dev.stats().free_blocks >= free_after_first);
    assert_eq!(read_blob(&dev, &kept).unwrap(), first);
}

#[test]
fn blob_reader_reports_header_geometry() {
    let config = StoreConfig::default();
    let raw = MemoryRawDevice::new(BlockSize::new(4096).unwrap());
    let mut dev = ManagedBlockDevice::create(raw, config.device).unwrap();
    let header = write_blob(&mut dev, &config, &[]).unwrap();
    let reader = BlobReader::new(&dev, header).unwrap();
    assert!(reader.is_empty());
    assert!(reader.header().extents[0].is_hole());
}
