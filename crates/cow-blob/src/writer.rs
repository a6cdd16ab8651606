//! Streaming blob writer.

use crate::{BlobConfig, BlobHeader, span};
use cow_block::RawDevice;
use cow_device::ManagedBlockDevice;
use cow_error::{CowError, Result};
use cow_extent::{BlockAccessor, DescriptorType, ExtentDescriptor, encode_descriptors};
use std::io;
use tracing::{debug, trace, warn};

/// Splits a byte stream into extents and builds the indirection tree.
///
/// Leaves are written as soon as a full extent's worth of bytes is
/// buffered. Pending descriptors are kept per tree level; once the blob has
/// gone indirect, any level that reaches the fanout is packed into a DIR
/// node one level up, so memory stays bounded by `fanout * depth`.
///
/// Call [`finish`](Self::finish) to obtain the header. A writer dropped
/// without finishing leaks the extents it already wrote.
pub struct BlobWriter<'d, D: RawDevice> {
    device: &'d mut ManagedBlockDevice<D>,
    accessor: BlockAccessor,
    config: BlobConfig,
    fanout: usize,
    buffer: Vec<u8>,
    total_len: u64,
    /// `levels[0]` holds leaves, `levels[n]` DIR nodes of level `n`.
    levels: Vec<Vec<ExtentDescriptor>>,
    leaf_count: u64,
    indirect: bool,
    done: bool,
}

impl<'d, D: RawDevice> BlobWriter<'d, D> {
    pub fn new(
        device: &'d mut ManagedBlockDevice<D>,
        accessor: BlockAccessor,
        config: BlobConfig,
    ) -> Result<Self> {
        config.validate()?;
        let fanout = config.fanout(device.block_size());
        Ok(Self {
            device,
            accessor,
            config,
            fanout,
            buffer: Vec::new(),
            total_len: 0,
            levels: vec![Vec::new()],
            leaf_count: 0,
            indirect: false,
            done: false,
        })
    }

    /// Bytes accepted so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.total_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Append bytes to the blob.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        let max = self.config.max_extent_size as usize;
        while !data.is_empty() {
            let take = (max - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            self.total_len += take as u64;
            data = &data[take..];
            if self.buffer.len() == max {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        let chunk = std::mem::take(&mut self.buffer);
        let leaf = self.accessor.write(self.device, &chunk)?;
        self.leaf_count += 1;
        self.levels[0].push(leaf);
        if !self.indirect && self.levels[0].len() > self.config.direct_pointers {
            self.indirect = true;
            debug!(
                target: "cow::blob",
                event = "blob_indirect",
                leaves = self.levels[0].len(),
                fanout = self.fanout
            );
        }
        if self.indirect {
            self.cascade()?;
        }
        Ok(())
    }

    /// Pack every full level into DIR nodes one level up.
    fn cascade(&mut self) -> Result<()> {
        let mut level = 0;
        while level < self.levels.len() {
            while self.levels[level].len() >= self.fanout {
                let group: Vec<ExtentDescriptor> =
                    self.levels[level].drain(..self.fanout).collect();
                let node = self.write_dir(level, &group)?;
                self.push_at(level + 1, node);
            }
            level += 1;
        }
        Ok(())
    }

    fn push_at(&mut self, level: usize, node: ExtentDescriptor) {
        if self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(node);
    }

    /// Write `children` (all at `child_level`) as one DIR node.
    fn write_dir(
        &mut self,
        child_level: usize,
        children: &[ExtentDescriptor],
    ) -> Result<ExtentDescriptor> {
        let level = u8::try_from(child_level + 1)
            .map_err(|_| CowError::InvalidArgument("blob tree too deep".to_owned()))?;
        let covered: u64 = children.iter().map(span).sum();
        let node = self.accessor.write_node(
            self.device,
            DescriptorType::Dir,
            level,
            &encode_descriptors(children),
            covered,
        )?;
        trace!(
            target: "cow::blob",
            event = "dir_write",
            level,
            children = children.len(),
            covered,
            start = node.block_index[0]
        );
        Ok(node)
    }

    /// Persist the remaining bytes and return the header.
    pub fn finish(mut self) -> Result<BlobHeader> {
        if !self.buffer.is_empty() {
            self.flush_chunk()?;
        }
        let extents = if self.indirect {
            vec![self.collapse()?]
        } else if self.levels[0].is_empty() {
            vec![ExtentDescriptor::hole(self.device.transaction_id())]
        } else {
            std::mem::take(&mut self.levels[0])
        };
        self.done = true;
        debug!(
            target: "cow::blob",
            event = "blob_finish",
            total_len = self.total_len,
            leaves = self.leaf_count,
            indirect = self.indirect,
            depth = extents[0].level
        );
        Ok(BlobHeader {
            total_len: self.total_len,
            extents,
        })
    }

    /// Fold partial levels upward until a single root remains.
    fn collapse(&mut self) -> Result<ExtentDescriptor> {
        let mut level = 0;
        while level < self.levels.len() {
            let is_top = level + 1 == self.levels.len();
            if is_top && level > 0 && self.levels[level].len() == 1 {
                return Ok(self.levels[level][0]);
            }
            if !self.levels[level].is_empty() {
                let group = std::mem::take(&mut self.levels[level]);
                let node = self.write_dir(level, &group)?;
                self.push_at(level + 1, node);
            }
            level += 1;
        }
        Err(CowError::InvalidArgument(
            "indirect blob has no extents to collapse".to_owned(),
        ))
    }

    /// Stop writing and hand back the roots of everything persisted so far.
    ///
    /// Buffered bytes not yet written are discarded. The caller may free the
    /// returned extents with [`free_tree`](crate::free_tree).
    #[must_use]
    pub fn abandon(mut self) -> Vec<ExtentDescriptor> {
        self.done = true;
        self.buffer.clear();
        let roots: Vec<ExtentDescriptor> = self.levels.drain(..).rev().flatten().collect();
        debug!(
            target: "cow::blob",
            event = "blob_abandon",
            roots = roots.len(),
            written = self.total_len
        );
        roots
    }
}

impl<D: RawDevice> Drop for BlobWriter<'_, D> {
    fn drop(&mut self) {
        if !self.done && self.leaf_count > 0 {
            warn!(
                target: "cow::blob",
                event = "blob_writer_leaked",
                leaves = self.leaf_count,
                bytes = self.total_len
            );
        }
    }
}

impl<D: RawDevice> io::Write for BlobWriter<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    /// Leaves are written as they fill; a partial chunk waits for `finish`.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect_extents;
    use cow_block::MemoryRawDevice;
    use cow_device::DeviceOptions;
    use cow_types::BlockSize;

    fn device() -> ManagedBlockDevice<MemoryRawDevice> {
        let raw = MemoryRawDevice::new(BlockSize::new(512).unwrap());
        ManagedBlockDevice::create(raw, DeviceOptions::default()).unwrap()
    }

    fn small_config(direct: usize, fanout: usize) -> BlobConfig {
        BlobConfig {
            max_extent_size: 100,
            direct_pointers: direct,
            dir_fanout: fanout,
        }
    }

    fn write_blob(
        dev: &mut ManagedBlockDevice<MemoryRawDevice>,
        config: BlobConfig,
        len: usize,
    ) -> BlobHeader {
        let mut writer = BlobWriter::new(dev, BlockAccessor::default(), config).unwrap();
        let payload: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        writer.write_bytes(&payload).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn exact_direct_budget_stays_direct() {
        let mut dev = device();
        let header = write_blob(&mut dev, small_config(4, 3), 400);
        assert_eq!(header.extents.len(), 4);
        assert!(!header.is_indirect());
        assert!(header.extents.iter().all(|e| e.kind == DescriptorType::Data));
    }

    #[test]
    fn one_byte_over_budget_goes_indirect() {
        let mut dev = device();
        let header = write_blob(&mut dev, small_config(4, 3), 401);
        assert_eq!(header.extents.len(), 1);
        assert!(header.is_indirect());
        assert_eq!(header.extents[0].user_data, 401);
    }

    #[test]
    fn tree_levels_are_uniform() {
        let mut dev = device();
        // 47 leaves with fanout 3: several partial levels at finish.
        let header = write_blob(&mut dev, small_config(2, 3), 4650);
        let root = header.extents[0];
        assert_eq!(root.kind, DescriptorType::Dir);
        assert_eq!(root.user_data, 4650);

        let all = collect_extents(&dev, &BlockAccessor::default(), &header.extents).unwrap();
        let leaves = all.iter().filter(|e| e.kind == DescriptorType::Data).count();
        assert_eq!(leaves, 47);
        assert!(all.iter().filter(|e| e.kind == DescriptorType::Data).all(|e| e.level == 0));
        assert!(all.iter().filter(|e| e.kind == DescriptorType::Dir).all(|e| e.level >= 1));
        assert!(root.level >= 3);
    }

    #[test]
    fn empty_blob_is_single_hole() {
        let mut dev = device();
        let writer = BlobWriter::new(&mut dev, BlockAccessor::default(), BlobConfig::default())
            .unwrap();
        let header = writer.finish().unwrap();
        assert_eq!(header.total_len, 0);
        assert_eq!(header.extents.len(), 1);
        assert!(header.extents[0].is_hole());
        assert!(!dev.is_dirty());
    }

    #[test]
    fn chunks_split_across_writes() {
        let mut dev = device();
        let mut writer = BlobWriter::new(&mut dev, BlockAccessor::default(), small_config(8, 3))
            .unwrap();
        for _ in 0..25 {
            writer.write_bytes(&[1_u8; 10]).unwrap();
        }
        assert_eq!(writer.len(), 250);
        let header = writer.finish().unwrap();
        let sizes: Vec<u32> = header.extents.iter().map(|e| e.logical_size).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn abandon_returns_persisted_roots() {
        let mut dev = device();
        let mut writer = BlobWriter::new(&mut dev, BlockAccessor::default(), small_config(1, 2))
            .unwrap();
        writer.write_bytes(&[7_u8; 550]).unwrap();
        let roots = writer.abandon();
        let covered: u64 = roots.iter().map(span).sum();
        assert_eq!(covered, 500);
        let freed = crate::free_tree(&mut dev, &BlockAccessor::default(), &roots).unwrap();
        assert!(freed >= 5);
    }

    #[test]
    fn invalid_config_rejected_before_io() {
        let mut dev = device();
        let result = BlobWriter::new(&mut dev, BlockAccessor::default(), small_config(0, 3));
        assert!(matches!(result, Err(CowError::InvalidArgument(_))));
    }
}
