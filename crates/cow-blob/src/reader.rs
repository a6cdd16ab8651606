//! Random-access blob reader.

use crate::{BlobHeader, MAX_TREE_DEPTH, read_dir, span};
use cow_block::RawDevice;
use cow_device::ManagedBlockDevice;
use cow_error::{CowError, Result};
use cow_extent::{BlockAccessor, DescriptorType, ExtentDescriptor};
use std::io::{self, SeekFrom};
use tracing::trace;

/// Largest up-front reservation made by [`BlobReader::read_to_vec`].
const MAX_RESERVE: usize = 1 << 20;
const READ_CHUNK: usize = 64 * 1024;

/// Reads a blob back from its header.
///
/// Locating a byte offset walks one root-to-leaf path, choosing children by
/// their recorded spans. The most recent DIR node per depth and the most
/// recent leaf are kept, so sequential reads touch each node once.
pub struct BlobReader<'d, D: RawDevice> {
    device: &'d ManagedBlockDevice<D>,
    accessor: BlockAccessor,
    header: BlobHeader,
    position: u64,
    /// Blob offset of the cached leaf and its payload.
    leaf: Option<(u64, Vec<u8>)>,
    dir_cache: Vec<Option<(ExtentDescriptor, Vec<ExtentDescriptor>)>>,
}

impl<'d, D: RawDevice> BlobReader<'d, D> {
    pub fn new(device: &'d ManagedBlockDevice<D>, header: BlobHeader) -> Result<Self> {
        let first_block = header.extents.first().map_or(0, |e| e.block_index[0]);
        if header.extents.len() > 1
            && header.extents.iter().any(|e| e.kind != DescriptorType::Data)
        {
            return Err(CowError::integrity(
                first_block,
                "multi-extent blob header holds a non-DATA descriptor",
            ));
        }
        let covered: u64 = header.extents.iter().map(span).sum();
        if covered != header.total_len {
            return Err(CowError::integrity(
                first_block,
                format!(
                    "blob header declares {} bytes, extents cover {covered}",
                    header.total_len
                ),
            ));
        }
        Ok(Self {
            device,
            accessor: BlockAccessor::default(),
            header,
            position: 0,
            leaf: None,
            dir_cache: Vec::new(),
        })
    }

    /// Decode `bytes` as a header and open a reader on it.
    pub fn from_header_bytes(device: &'d ManagedBlockDevice<D>, bytes: &[u8]) -> Result<Self> {
        Self::new(device, BlobHeader::decode(bytes)?)
    }

    #[must_use]
    pub fn header(&self) -> &BlobHeader {
        &self.header
    }

    /// Total blob length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.header.total_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.total_len == 0
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor. Positions past the end read as end of blob.
    pub fn seek_to(&mut self, offset: u64) {
        self.position = offset;
    }

    /// Read from the cursor into `buf`, stopping at a leaf boundary.
    ///
    /// Returns 0 at end of blob.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.position;
        if buf.is_empty() || pos >= self.header.total_len {
            return Ok(0);
        }
        let cached = matches!(
            &self.leaf,
            Some((start, bytes)) if pos >= *start && pos - start < bytes.len() as u64
        );
        if !cached {
            let (start, leaf) = self.locate(pos)?;
            let bytes = self.accessor.read(self.device, &leaf)?;
            if bytes.len() as u64 != span(&leaf) {
                return Err(CowError::integrity(
                    leaf.block_index[0],
                    format!("leaf returned {} bytes, descriptor records {}", bytes.len(), span(&leaf)),
                ));
            }
            self.leaf = Some((start, bytes));
        }
        let Some((start, bytes)) = &self.leaf else {
            return Ok(0);
        };
        let within = (pos - start) as usize;
        let n = buf.len().min(bytes.len() - within);
        buf[..n].copy_from_slice(&bytes[within..within + n]);
        self.position += n as u64;
        Ok(n)
    }

    /// Fill `buf` from `offset` without moving the cursor.
    ///
    /// Returns the bytes read; fewer than `buf.len()` only at end of blob.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let saved = self.position;
        self.position = offset;
        let mut filled = 0;
        let result = loop {
            if filled == buf.len() {
                break Ok(filled);
            }
            match self.read_bytes(&mut buf[filled..]) {
                Ok(0) => break Ok(filled),
                Ok(n) => filled += n,
                Err(err) => break Err(err),
            }
        };
        self.position = saved;
        result
    }

    /// Everything from the cursor to the end of the blob.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        // The header length is unverified until the tree is walked, so the
        // output grows with the leaves actually read.
        let remaining = self.header.total_len.saturating_sub(self.position);
        let reserve = usize::try_from(remaining).map_or(MAX_RESERVE, |r| r.min(MAX_RESERVE));
        let mut out = Vec::with_capacity(reserve);
        let mut chunk = vec![0_u8; READ_CHUNK];
        loop {
            let n = self.read_bytes(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Find the leaf holding `offset` and its starting blob offset.
    fn locate(&mut self, offset: u64) -> Result<(u64, ExtentDescriptor)> {
        let mut base = 0_u64;
        let mut nodes = self.header.extents.clone();
        let mut depth = 0;
        loop {
            let mut found = None;
            for child in &nodes {
                let s = span(child);
                if offset < base + s {
                    found = Some(*child);
                    break;
                }
                base += s;
            }
            let Some(child) = found else {
                return Err(CowError::integrity(
                    nodes.first().map_or(0, |n| n.block_index[0]),
                    format!("offset {offset} not covered by extent tree"),
                ));
            };
            match child.kind {
                DescriptorType::Data => {
                    trace!(
                        target: "cow::blob",
                        event = "leaf_locate",
                        offset,
                        leaf_start = base,
                        depth
                    );
                    return Ok((base, child));
                }
                DescriptorType::Dir if depth < MAX_TREE_DEPTH => {
                    nodes = self.dir_children(depth, &child)?;
                    depth += 1;
                }
                DescriptorType::Dir | DescriptorType::Hole => {
                    return Err(CowError::integrity(
                        child.block_index[0],
                        format!("unexpected {:?} at depth {depth}", child.kind),
                    ));
                }
            }
        }
    }

    fn dir_children(
        &mut self,
        depth: usize,
        dir: &ExtentDescriptor,
    ) -> Result<Vec<ExtentDescriptor>> {
        if let Some(Some((cached, children))) = self.dir_cache.get(depth) {
            if cached == dir {
                return Ok(children.clone());
            }
        }
        let children = read_dir(self.device, &self.accessor, dir)?;
        if self.dir_cache.len() <= depth {
            self.dir_cache.resize(depth + 1, None);
        }
        self.dir_cache[depth] = Some((*dir, children.clone()));
        Ok(children)
    }
}

impl<D: RawDevice> io::Read for BlobReader<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(io::Error::other)
    }
}

impl<D: RawDevice> io::Seek for BlobReader<'_, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.header.total_len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of blob")
        })?;
        self.position = target;
        Ok(target)
    }
}
