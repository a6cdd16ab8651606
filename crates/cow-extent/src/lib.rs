#![forbid(unsafe_code)]
//! Extent descriptors and single-extent I/O.
//!
//! [`BlockAccessor`] persists one payload as one extent: compress, checksum
//! the physical bytes, allocate contiguous blocks, write, and describe the
//! result in an [`ExtentDescriptor`]. Reading verifies the checksum before
//! decompressing; a mismatch is always an `Integrity` error.

mod compression;
mod descriptor;

pub use compression::{MIN_ZERO_RUN, compress_zero_runs, decompress_zero_runs};
pub use descriptor::{
    ChecksumAlgorithm, CompressionAlgorithm, DescriptorType, ExtentDescriptor, MAX_COPIES,
    NO_BLOCK, decode_descriptors, encode_descriptors,
};

use cow_block::RawDevice;
use cow_device::ManagedBlockDevice;
use cow_error::{CowError, Result};
use cow_types::{BlockIv, BlockNumber, TxnId};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{trace, warn};

/// How payloads are encoded on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessorOptions {
    pub checksum: ChecksumAlgorithm,
    pub compression: CompressionAlgorithm,
    /// Derive a per-extent block key and hand it to the encrypting device.
    pub encrypt: bool,
    /// Physical copies per extent, 1..=3.
    pub copies: u8,
}

impl Default for AccessorOptions {
    fn default() -> Self {
        Self {
            checksum: ChecksumAlgorithm::Crc32c,
            compression: CompressionAlgorithm::None,
            encrypt: false,
            copies: 1,
        }
    }
}

impl AccessorOptions {
    pub fn validate(&self) -> Result<()> {
        if self.copies == 0 || usize::from(self.copies) > MAX_COPIES {
            return Err(CowError::InvalidArgument(format!(
                "copies must be in 1..={MAX_COPIES}, got {}",
                self.copies
            )));
        }
        Ok(())
    }
}

/// Reads and writes single extents through a managed device.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockAccessor {
    options: AccessorOptions,
}

impl BlockAccessor {
    pub fn new(options: AccessorOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    #[must_use]
    pub fn options(&self) -> &AccessorOptions {
        &self.options
    }

    /// Persist `payload` as a leaf extent. An empty payload yields a hole.
    pub fn write<D: RawDevice>(
        &self,
        device: &mut ManagedBlockDevice<D>,
        payload: &[u8],
    ) -> Result<ExtentDescriptor> {
        self.write_node(device, DescriptorType::Data, 0, payload, 0)
    }

    /// Persist `payload` as an extent of the given type and tree level.
    pub fn write_node<D: RawDevice>(
        &self,
        device: &mut ManagedBlockDevice<D>,
        kind: DescriptorType,
        level: u8,
        payload: &[u8],
        user_data: u64,
    ) -> Result<ExtentDescriptor> {
        let txn = device.transaction_id();
        if kind == DescriptorType::Hole && !payload.is_empty() {
            return Err(CowError::InvalidArgument(format!(
                "a HOLE extent cannot carry a {}-byte payload",
                payload.len()
            )));
        }
        if payload.is_empty() {
            let mut hole = ExtentDescriptor::hole(txn);
            hole.user_data = user_data;
            return Ok(hole);
        }
        let logical_size = u32::try_from(payload.len()).map_err(|_| {
            CowError::InvalidArgument(format!(
                "payload of {} bytes exceeds the extent size limit",
                payload.len()
            ))
        })?;

        let (compression, physical) = self.compress(payload);
        let physical_size = u32::try_from(physical.len()).map_err(|_| {
            CowError::InvalidArgument("compressed payload exceeds the extent size limit".to_owned())
        })?;
        let block_size = device.block_size();
        let blocks = block_size.blocks_for(physical.len() as u64);
        let allocated_blocks = u32::try_from(blocks).map_err(|_| {
            CowError::InvalidArgument(format!("{blocks} blocks exceed the extent size limit"))
        })?;

        let mut block_index = [NO_BLOCK; MAX_COPIES];
        for slot in block_index.iter_mut().take(usize::from(self.options.copies)) {
            *slot = device.allocate(blocks)?.0;
        }
        let block_key = if self.options.encrypt {
            derive_block_key(txn, block_index[0])
        } else {
            0
        };

        let descriptor = ExtentDescriptor {
            kind,
            level,
            checksum_algorithm: self.options.checksum,
            compression,
            allocated_blocks,
            logical_size,
            physical_size,
            block_index,
            user_data,
            txn,
            block_key,
            checksum: self.options.checksum.compute(&physical),
        };

        let mut padded = physical.into_owned();
        padded.resize(blocks as usize * block_size.as_usize(), 0);
        let iv = extent_iv(&descriptor);
        for start in descriptor.copies() {
            device.write_blocks(start, &padded, iv)?;
        }
        trace!(
            target: "cow::extent",
            event = "extent_write",
            kind = ?kind,
            level,
            start = block_index[0],
            blocks,
            logical_size,
            physical_size,
            txn = txn.0
        );
        Ok(descriptor)
    }

    fn compress<'a>(&self, payload: &'a [u8]) -> (CompressionAlgorithm, Cow<'a, [u8]>) {
        match self.options.compression {
            CompressionAlgorithm::None => (CompressionAlgorithm::None, Cow::Borrowed(payload)),
            CompressionAlgorithm::ZeroRun => {
                let packed = compress_zero_runs(payload);
                if packed.len() < payload.len() {
                    (CompressionAlgorithm::ZeroRun, Cow::Owned(packed))
                } else {
                    (CompressionAlgorithm::None, Cow::Borrowed(payload))
                }
            }
        }
    }

    /// Read and verify the payload of `descriptor`.
    ///
    /// Copies are tried in order; the first one that verifies wins. If none
    /// does, the last `Integrity` error is returned.
    pub fn read<D: RawDevice>(
        &self,
        device: &ManagedBlockDevice<D>,
        descriptor: &ExtentDescriptor,
    ) -> Result<Vec<u8>> {
        if descriptor.is_hole() {
            return Ok(Vec::new());
        }
        let block_size = device.block_size();
        let start = descriptor.block_index[0];
        let blocks = u64::from(descriptor.allocated_blocks);
        if blocks == 0 || blocks != block_size.blocks_for(u64::from(descriptor.physical_size)) {
            return Err(CowError::integrity(
                start,
                format!(
                    "physical size {} does not match {} allocated blocks",
                    descriptor.physical_size, descriptor.allocated_blocks
                ),
            ));
        }
        // Every copy must lie on the device before the buffer is sized.
        let len_blocks = device.len_blocks();
        for copy in descriptor.copies() {
            if copy.0.checked_add(blocks).is_none_or(|end| end > len_blocks) {
                return Err(CowError::integrity(
                    copy.0,
                    format!("extent of {blocks} blocks lies outside the {len_blocks}-block device"),
                ));
            }
        }
        let capacity = usize::try_from(blocks * u64::from(block_size.get())).map_err(|_| {
            CowError::integrity(start, format!("{blocks} blocks do not fit in memory"))
        })?;

        let mut buf = vec![0_u8; capacity];
        let iv = extent_iv(descriptor);
        let mut last_error = CowError::integrity(start, "extent records no block copies");
        for copy in descriptor.copies() {
            device.read_blocks(copy, &mut buf, iv)?;
            match decode_payload(descriptor, copy, &buf) {
                Ok(payload) => {
                    trace!(
                        target: "cow::extent",
                        event = "extent_read",
                        start = copy.0,
                        logical_size = descriptor.logical_size
                    );
                    return Ok(payload);
                }
                Err(err) => {
                    warn!(
                        target: "cow::extent",
                        event = "extent_integrity_failure",
                        start = copy.0,
                        txn = descriptor.txn.0,
                        error = %err
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Free every copy of `descriptor` in the open transaction.
    pub fn free<D: RawDevice>(
        &self,
        device: &mut ManagedBlockDevice<D>,
        descriptor: &ExtentDescriptor,
    ) -> Result<()> {
        for copy in descriptor.copies() {
            device.free(copy, u64::from(descriptor.allocated_blocks))?;
        }
        Ok(())
    }
}

fn decode_payload(descriptor: &ExtentDescriptor, copy: BlockNumber, raw: &[u8]) -> Result<Vec<u8>> {
    let physical = &raw[..descriptor.physical_size as usize];
    let computed = descriptor.checksum_algorithm.compute(physical);
    if computed != descriptor.checksum {
        return Err(CowError::integrity(
            copy.0,
            format!("{:?} checksum mismatch", descriptor.checksum_algorithm),
        ));
    }
    let logical = descriptor.logical_size as usize;
    match descriptor.compression {
        CompressionAlgorithm::None if physical.len() == logical => Ok(physical.to_vec()),
        CompressionAlgorithm::None => Err(CowError::integrity(
            copy.0,
            format!("uncompressed extent has physical size {} but logical size {logical}", physical.len()),
        )),
        CompressionAlgorithm::ZeroRun => decompress_zero_runs(physical, logical)
            .map_err(|err| CowError::integrity(copy.0, format!("zero-run stream: {err}"))),
    }
}

/// IV forwarded with every block of an extent.
///
/// Unencrypted extents have a zero block key; plain devices ignore the IV.
fn extent_iv(descriptor: &ExtentDescriptor) -> BlockIv {
    BlockIv::new(descriptor.block_key, descriptor.txn.0)
}

fn derive_block_key(txn: TxnId, start: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"cowstore.block_key.v1");
    hasher.update(&txn.0.to_le_bytes());
    hasher.update(&start.to_le_bytes());
    let digest = hasher.finalize();
    let mut key = [0_u8; 8];
    key.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(key)
}
