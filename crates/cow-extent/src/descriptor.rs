//! Fixed-size extent descriptor ("block pointer").
//!
//! ```text
//! offset  size  field
//!      0     1  type                  0 HOLE, 1 DATA, 2 DIR
//!      1     1  level                 0 = leaf
//!      2     1  checksum algorithm    0 none, 1 crc32c, 2 blake3
//!      3     1  compression algorithm 0 none, 1 zero-run
//!      4     4  allocated blocks      per copy
//!      8     4  logical size          bytes after decompression
//!     12     4  physical size         bytes on disk
//!     16    24  block index [3]       NO_BLOCK when unused
//!     40     8  user data
//!     48     8  transaction id
//!     56     8  block key
//!     64    16  checksum
//! ```
//!
//! All integers are little-endian.

use cow_types::{BlockNumber, ParseError, TxnId, read_fixed, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};

/// Marks an unused `block_index` slot.
pub const NO_BLOCK: u64 = u64::MAX;

/// Maximum number of physical copies an extent can record.
pub const MAX_COPIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Hole,
    Data,
    Dir,
}

impl DescriptorType {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Hole => 0,
            Self::Data => 1,
            Self::Dir => 2,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, ParseError> {
        match id {
            0 => Ok(Self::Hole),
            1 => Ok(Self::Data),
            2 => Ok(Self::Dir),
            _ => Err(ParseError::InvalidField {
                field: "extent_type",
                reason: "unknown type id",
            }),
        }
    }
}

/// Digest over the physical bytes of an extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    None,
    #[default]
    Crc32c,
    Blake3,
}

impl ChecksumAlgorithm {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Crc32c => 1,
            Self::Blake3 => 2,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, ParseError> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Crc32c),
            2 => Ok(Self::Blake3),
            _ => Err(ParseError::InvalidField {
                field: "checksum_algorithm",
                reason: "unknown algorithm id",
            }),
        }
    }

    /// Digest of `data`, zero-padded to the descriptor's 16 bytes.
    #[must_use]
    pub fn compute(self, data: &[u8]) -> [u8; 16] {
        let mut out = [0_u8; 16];
        match self {
            Self::None => {}
            Self::Crc32c => out[..4].copy_from_slice(&crc32c::crc32c(data).to_le_bytes()),
            Self::Blake3 => out.copy_from_slice(&blake3::hash(data).as_bytes()[..16]),
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    /// Run-length coding of zero bytes; see [`crate::compress_zero_runs`].
    ZeroRun,
}

impl CompressionAlgorithm {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::ZeroRun => 1,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, ParseError> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::ZeroRun),
            _ => Err(ParseError::InvalidField {
                field: "compression_algorithm",
                reason: "unknown algorithm id",
            }),
        }
    }
}

/// Location and integrity metadata for one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentDescriptor {
    pub kind: DescriptorType,
    pub level: u8,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub compression: CompressionAlgorithm,
    pub allocated_blocks: u32,
    pub logical_size: u32,
    pub physical_size: u32,
    pub block_index: [u64; MAX_COPIES],
    pub user_data: u64,
    pub txn: TxnId,
    pub block_key: u64,
    pub checksum: [u8; 16],
}

impl ExtentDescriptor {
    pub const SIZE: usize = 80;

    /// A descriptor with no physical allocation.
    #[must_use]
    pub fn hole(txn: TxnId) -> Self {
        Self {
            kind: DescriptorType::Hole,
            level: 0,
            checksum_algorithm: ChecksumAlgorithm::None,
            compression: CompressionAlgorithm::None,
            allocated_blocks: 0,
            logical_size: 0,
            physical_size: 0,
            block_index: [NO_BLOCK; MAX_COPIES],
            user_data: 0,
            txn,
            block_key: 0,
            checksum: [0; 16],
        }
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.kind == DescriptorType::Hole
    }

    /// Start block of every recorded copy, primary first.
    pub fn copies(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.block_index
            .iter()
            .take_while(|b| **b != NO_BLOCK)
            .map(|b| BlockNumber(*b))
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        buf[0] = self.kind.id();
        buf[1] = self.level;
        buf[2] = self.checksum_algorithm.id();
        buf[3] = self.compression.id();
        buf[4..8].copy_from_slice(&self.allocated_blocks.to_le_bytes());
        buf[8..12].copy_from_slice(&self.logical_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.physical_size.to_le_bytes());
        for (i, block) in self.block_index.iter().enumerate() {
            let at = 16 + i * 8;
            buf[at..at + 8].copy_from_slice(&block.to_le_bytes());
        }
        buf[40..48].copy_from_slice(&self.user_data.to_le_bytes());
        buf[48..56].copy_from_slice(&self.txn.0.to_le_bytes());
        buf[56..64].copy_from_slice(&self.block_key.to_le_bytes());
        buf[64..80].copy_from_slice(&self.checksum);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let head: [u8; 4] = read_fixed(bytes, 0)?;
        Ok(Self {
            kind: DescriptorType::from_id(head[0])?,
            level: head[1],
            checksum_algorithm: ChecksumAlgorithm::from_id(head[2])?,
            compression: CompressionAlgorithm::from_id(head[3])?,
            allocated_blocks: read_le_u32(bytes, 4)?,
            logical_size: read_le_u32(bytes, 8)?,
            physical_size: read_le_u32(bytes, 12)?,
            block_index: [
                read_le_u64(bytes, 16)?,
                read_le_u64(bytes, 24)?,
                read_le_u64(bytes, 32)?,
            ],
            user_data: read_le_u64(bytes, 40)?,
            txn: TxnId(read_le_u64(bytes, 48)?),
            block_key: read_le_u64(bytes, 56)?,
            checksum: read_fixed(bytes, 64)?,
        })
    }
}

/// Concatenate descriptors, as stored in a DIR node.
#[must_use]
pub fn encode_descriptors(descriptors: &[ExtentDescriptor]) -> Vec<u8> {
    let mut out = Vec::with_capacity(descriptors.len() * ExtentDescriptor::SIZE);
    for descriptor in descriptors {
        out.extend_from_slice(&descriptor.encode());
    }
    out
}

/// Split `bytes` into descriptors; the length must be a whole multiple of
/// [`ExtentDescriptor::SIZE`].
pub fn decode_descriptors(bytes: &[u8]) -> Result<Vec<ExtentDescriptor>, ParseError> {
    if bytes.len() % ExtentDescriptor::SIZE != 0 {
        return Err(ParseError::InvalidField {
            field: "descriptor_array",
            reason: "length not a multiple of descriptor size",
        });
    }
    bytes
        .chunks_exact(ExtentDescriptor::SIZE)
        .map(ExtentDescriptor::decode)
        .collect()
}
