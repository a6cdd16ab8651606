#![forbid(unsafe_code)]
//! Blob codec: arbitrary-length values as a tree of extents.
//!
//! A blob is persisted as leaf DATA extents of at most
//! [`BlobConfig::max_extent_size`] bytes each. Its header is
//!
//! ```text
//! varint(total_len) ++ ExtentDescriptor+
//! ```
//!
//! - empty value: exactly one HOLE descriptor;
//! - up to `direct_pointers` leaves: the leaf descriptors themselves;
//! - more leaves: exactly one DIR descriptor, the root of a tree whose DIR
//!   nodes store arrays of child descriptors.
//!
//! Every DIR node at level `L` holds children of level `L - 1`, and its
//! `user_data` records the number of blob bytes below it, so a reader can
//! seek without touching sibling subtrees.

mod reader;
mod writer;

pub use reader::BlobReader;
pub use writer::BlobWriter;

use cow_block::RawDevice;
use cow_device::ManagedBlockDevice;
use cow_error::{CowError, Result};
use cow_extent::{BlockAccessor, DescriptorType, ExtentDescriptor, decode_descriptors};
use cow_types::{BlockSize, read_varint, write_varint};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Deepest tree a reader will follow before reporting corruption.
pub const MAX_TREE_DEPTH: usize = 64;

/// Chunking and indirection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Largest leaf payload in bytes.
    pub max_extent_size: u32,
    /// Leaves a header may reference directly.
    pub direct_pointers: usize,
    /// Children per DIR node; 0 derives it from the block size.
    pub dir_fanout: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            max_extent_size: 1 << 20,
            direct_pointers: 4,
            dir_fanout: 0,
        }
    }
}

impl BlobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_extent_size == 0 {
            return Err(CowError::InvalidArgument(
                "max_extent_size must be > 0".to_owned(),
            ));
        }
        if self.direct_pointers == 0 {
            return Err(CowError::InvalidArgument(
                "direct_pointers must be > 0".to_owned(),
            ));
        }
        if self.dir_fanout == 1 {
            return Err(CowError::InvalidArgument(
                "dir_fanout must be 0 (derived) or >= 2".to_owned(),
            ));
        }
        Ok(())
    }

    /// Effective DIR fanout: as many descriptors as fit one block, at least 2.
    #[must_use]
    pub fn fanout(&self, block_size: BlockSize) -> usize {
        if self.dir_fanout == 0 {
            (block_size.as_usize() / ExtentDescriptor::SIZE).max(2)
        } else {
            self.dir_fanout
        }
    }
}

/// Decoded blob header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub total_len: u64,
    pub extents: Vec<ExtentDescriptor>,
}

impl BlobHeader {
    /// True if the header references a DIR tree rather than leaves.
    #[must_use]
    pub fn is_indirect(&self) -> bool {
        matches!(self.extents.as_slice(), [root] if root.kind == DescriptorType::Dir)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.extents.len() * ExtentDescriptor::SIZE);
        write_varint(&mut out, self.total_len);
        for extent in &self.extents {
            out.extend_from_slice(&extent.encode());
        }
        out
    }

    /// Parse a header; the descriptor count is implied by the length.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (total_len, used) = read_varint(bytes, 0)
            .map_err(|err| CowError::InvalidArgument(format!("blob header length: {err}")))?;
        let extents = decode_descriptors(&bytes[used..])
            .map_err(|err| CowError::InvalidArgument(format!("blob header extents: {err}")))?;
        if extents.is_empty() {
            return Err(CowError::InvalidArgument(
                "blob header holds no extent descriptors".to_owned(),
            ));
        }
        Ok(Self { total_len, extents })
    }
}

/// Bytes of blob data below `descriptor`.
pub(crate) fn span(descriptor: &ExtentDescriptor) -> u64 {
    match descriptor.kind {
        DescriptorType::Hole => 0,
        DescriptorType::Data => u64::from(descriptor.logical_size),
        DescriptorType::Dir => descriptor.user_data,
    }
}

/// Read a DIR node and check it against its parent descriptor.
pub(crate) fn read_dir<D: RawDevice>(
    device: &ManagedBlockDevice<D>,
    accessor: &BlockAccessor,
    dir: &ExtentDescriptor,
) -> Result<Vec<ExtentDescriptor>> {
    let block = dir.block_index[0];
    let payload = accessor.read(device, dir)?;
    let children = decode_descriptors(&payload)
        .map_err(|err| CowError::integrity(block, format!("DIR node: {err}")))?;
    if children.is_empty() {
        return Err(CowError::integrity(block, "empty DIR node"));
    }
    let expected_level = dir.level.checked_sub(1);
    let mut covered = 0_u64;
    for child in &children {
        if Some(child.level) != expected_level || child.kind == DescriptorType::Hole {
            return Err(CowError::integrity(
                block,
                format!(
                    "DIR node at level {} has {:?} child at level {}",
                    dir.level, child.kind, child.level
                ),
            ));
        }
        covered = covered.saturating_add(span(child));
    }
    if covered != dir.user_data {
        return Err(CowError::integrity(
            block,
            format!("DIR node covers {covered} bytes, parent records {}", dir.user_data),
        ));
    }
    Ok(children)
}

/// Every extent reachable from `roots`, parents before children.
///
/// Traversal uses an explicit stack, so tree depth never grows the call
/// stack.
pub fn collect_extents<D: RawDevice>(
    device: &ManagedBlockDevice<D>,
    accessor: &BlockAccessor,
    roots: &[ExtentDescriptor],
) -> Result<Vec<ExtentDescriptor>> {
    let mut out = Vec::new();
    let mut stack: Vec<(ExtentDescriptor, usize)> =
        roots.iter().rev().map(|root| (*root, 0)).collect();
    while let Some((extent, depth)) = stack.pop() {
        if depth > MAX_TREE_DEPTH {
            return Err(CowError::integrity(
                extent.block_index[0],
                format!("extent tree deeper than {MAX_TREE_DEPTH}"),
            ));
        }
        if extent.kind == DescriptorType::Dir {
            let children = read_dir(device, accessor, &extent)?;
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
        out.push(extent);
    }
    Ok(out)
}

/// Free every extent reachable from `roots` in the open transaction.
///
/// Returns the number of extents freed.
pub fn free_tree<D: RawDevice>(
    device: &mut ManagedBlockDevice<D>,
    accessor: &BlockAccessor,
    roots: &[ExtentDescriptor],
) -> Result<usize> {
    let extents = collect_extents(device, accessor, roots)?;
    for extent in &extents {
        accessor.free(device, extent)?;
    }
    debug!(
        target: "cow::blob",
        event = "tree_free",
        extents = extents.len(),
        txn = device.transaction_id().0
    );
    Ok(extents.len())
}

/// Free every extent of a blob.
pub fn free_blob<D: RawDevice>(
    device: &mut ManagedBlockDevice<D>,
    header: &BlobHeader,
) -> Result<usize> {
    free_tree(device, &BlockAccessor::default(), &header.extents)
}
