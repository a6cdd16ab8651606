//! Superblock format.
//!
//! ```text
//! Superblock (one per slot, raw blocks 0 and 1, rest of the block zero):
//! +------------------+---------+
//! | label            | 8 bytes | = "COWBLKS\0"
//! | format_version   | 2 bytes | = 1
//! | reserved         | 2 bytes | = 0
//! | block_size       | 4 bytes |
//! | txn_id           | 8 bytes | last committed transaction
//! | managed_len      | 8 bytes | managed blocks covered by the free map
//! | free_map_start   | 8 bytes | managed index
//! | free_map_blocks  | 8 bytes | 0 = empty map, nothing stored
//! | free_map_len     | 8 bytes | encoded bytes
//! | free_map_crc     | 4 bytes | CRC32c of the encoded map
//! | superblock_crc   | 4 bytes | CRC32c of bytes 0..60
//! +------------------+---------+
//! ```
//!
//! Commit `n` writes slot `n % 2`, so the superblock of the previous commit
//! is never overwritten by the commit that supersedes it.

use cow_error::{CowError, Result};
use cow_types::{BlockSize, TxnId, read_fixed, read_le_u16, read_le_u32, read_le_u64};

pub const SUPERBLOCK_LABEL: [u8; 8] = *b"COWBLKS\0";
pub const FORMAT_VERSION: u16 = 1;
pub const SUPERBLOCK_SIZE: usize = 64;
/// Raw blocks reserved for superblock slots ahead of the managed space.
pub const SUPERBLOCK_SLOTS: u64 = 2;

const CRC_OFFSET: usize = 60;

/// Location and checksum of a persisted free map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapExtent {
    pub start: u64,
    pub blocks: u64,
    pub byte_len: u64,
    pub crc: u32,
}

impl MapExtent {
    pub const EMPTY: Self = Self {
        start: 0,
        blocks: 0,
        byte_len: 0,
        crc: 0,
    };

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: BlockSize,
    pub txn: TxnId,
    pub managed_len: u64,
    pub free_map: MapExtent,
}

impl Superblock {
    /// Raw block this superblock is written to.
    #[must_use]
    pub fn slot(&self) -> u64 {
        self.txn.0 % SUPERBLOCK_SLOTS
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0_u8; SUPERBLOCK_SIZE];
        buf[0..8].copy_from_slice(&SUPERBLOCK_LABEL);
        buf[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_size.get().to_le_bytes());
        buf[16..24].copy_from_slice(&self.txn.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.managed_len.to_le_bytes());
        buf[32..40].copy_from_slice(&self.free_map.start.to_le_bytes());
        buf[40..48].copy_from_slice(&self.free_map.blocks.to_le_bytes());
        buf[48..56].copy_from_slice(&self.free_map.byte_len.to_le_bytes());
        buf[56..60].copy_from_slice(&self.free_map.crc.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Encode into a zero-padded block.
    #[must_use]
    pub fn encode_block(&self) -> Vec<u8> {
        let mut block = vec![0_u8; self.block_size.as_usize()];
        block[..SUPERBLOCK_SIZE].copy_from_slice(&self.encode());
        block
    }

    /// Decode and verify the superblock in `bytes`.
    ///
    /// A wrong label or version is `UnsupportedFormat`; a checksum mismatch
    /// on a correctly labelled record is `Integrity` at raw block `slot`.
    pub fn decode(slot: u64, bytes: &[u8]) -> Result<Self> {
        let label: [u8; 8] = read_fixed(bytes, 0).map_err(format_error)?;
        if label != SUPERBLOCK_LABEL {
            return Err(CowError::UnsupportedFormat(format!(
                "superblock label mismatch: expected {SUPERBLOCK_LABEL:?}, got {label:?}"
            )));
        }

        let stored_crc = read_le_u32(bytes, CRC_OFFSET).map_err(format_error)?;
        let computed = crc32c::crc32c(&bytes[..CRC_OFFSET]);
        if stored_crc != computed {
            return Err(CowError::integrity(
                slot,
                format!("superblock crc mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"),
            ));
        }

        let version = read_le_u16(bytes, 8).map_err(format_error)?;
        if version != FORMAT_VERSION {
            return Err(CowError::UnsupportedFormat(format!(
                "unsupported format version: {version} (expected {FORMAT_VERSION})"
            )));
        }

        let raw_block_size = read_le_u32(bytes, 12).map_err(format_error)?;
        let block_size = BlockSize::new(raw_block_size).map_err(|_| {
            CowError::UnsupportedFormat(format!("invalid recorded block size {raw_block_size}"))
        })?;

        Ok(Self {
            block_size,
            txn: TxnId(read_le_u64(bytes, 16).map_err(format_error)?),
            managed_len: read_le_u64(bytes, 24).map_err(format_error)?,
            free_map: MapExtent {
                start: read_le_u64(bytes, 32).map_err(format_error)?,
                blocks: read_le_u64(bytes, 40).map_err(format_error)?,
                byte_len: read_le_u64(bytes, 48).map_err(format_error)?,
                crc: read_le_u32(bytes, 56).map_err(format_error)?,
            },
        })
    }
}

fn format_error(err: cow_types::ParseError) -> CowError {
    CowError::UnsupportedFormat(format!("superblock: {err}"))
}
