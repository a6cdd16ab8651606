#![forbid(unsafe_code)]
//! cowstore public API facade.
//!
//! Re-exports the engine crates through one stable interface and adds the
//! store-level configuration that ties them together.
//!
//! ```no_run
//! use cow::{BlobReader, BlobWriter, StoreConfig};
//!
//! # fn main() -> cow::Result<()> {
//! let config = StoreConfig::default();
//! let mut device = cow::open_file_device("store.img", &config)?;
//! let mut writer = BlobWriter::new(&mut device, config.accessor()?, config.blob)?;
//! writer.write_bytes(b"hello")?;
//! let header = writer.finish()?;
//! device.commit()?;
//!
//! let bytes = BlobReader::new(&device, header)?.read_to_vec()?;
//! assert_eq!(bytes, b"hello");
//! # Ok(())
//! # }
//! ```

mod config;

pub use config::StoreConfig;

pub use cow_alloc::FreeSpaceMap;
pub use cow_blob::{
    BlobConfig, BlobHeader, BlobReader, BlobWriter, MAX_TREE_DEPTH, collect_extents, free_blob,
    free_tree,
};
pub use cow_block::{
    BlockCipher, CacheStats, EncryptingDevice, FileRawDevice, MemoryRawDevice, RawDevice,
    WriteBackCache,
};
pub use cow_device::{DeviceOptions, DeviceStats, ManagedBlockDevice, RESERVED_BLOCKS};
pub use cow_error::{CowError, Result};
pub use cow_extent::{
    AccessorOptions, BlockAccessor, ChecksumAlgorithm, CompressionAlgorithm, DescriptorType,
    ExtentDescriptor,
};
pub use cow_types::{BlockIv, BlockNumber, BlockSize, TxnId};

use std::path::Path;
use tracing::info;

/// Open the store image at `path`, formatting it if the file is new or empty.
pub fn open_file_device(
    path: impl AsRef<Path>,
    config: &StoreConfig,
) -> Result<ManagedBlockDevice<FileRawDevice>> {
    config.validate()?;
    let path = path.as_ref();
    let raw = FileRawDevice::open(path, config.block_size()?)?;
    let formatted = raw.len_blocks() > 0;
    let device = ManagedBlockDevice::open_or_create(raw, config.device)?;
    info!(
        target: "cow::device",
        event = "store_open",
        path = %path.display(),
        formatted,
        txn = device.committed_transaction_id().0
    );
    Ok(device)
}

/// Write `data` as one blob in the device's open transaction.
///
/// The caller commits.
pub fn write_blob<D: RawDevice>(
    device: &mut ManagedBlockDevice<D>,
    config: &StoreConfig,
    data: &[u8],
) -> Result<BlobHeader> {
    let mut writer = BlobWriter::new(device, config.accessor()?, config.blob)?;
    writer.write_bytes(data)?;
    writer.finish()
}

/// Read a whole blob from its encoded header.
pub fn read_blob<D: RawDevice>(
    device: &ManagedBlockDevice<D>,
    header_bytes: &[u8],
) -> Result<Vec<u8>> {
    BlobReader::from_header_bytes(device, header_bytes)?.read_to_vec()
}
