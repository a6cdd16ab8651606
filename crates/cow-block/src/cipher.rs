//! Encryption collaborator seam.
//!
//! The engine never chooses a cipher. It forwards a [`BlockIv`] with every
//! physical read and write; an [`EncryptingDevice`] beneath the cache turns
//! that IV and the absolute block number into whatever tweak its
//! [`BlockCipher`] needs.

use crate::{RawDevice, blocks_in_buffer};
use cow_error::Result;
use cow_types::{BlockIv, BlockNumber, BlockSize};

/// Length-preserving, block-sized transform.
pub trait BlockCipher: Send + Sync {
    /// Encrypt one block in place.
    fn encrypt_block(&self, block: BlockNumber, iv: BlockIv, data: &mut [u8]);

    /// Decrypt one block in place.
    fn decrypt_block(&self, block: BlockNumber, iv: BlockIv, data: &mut [u8]);
}

/// Raw device wrapper that enciphers every block on its way down and
/// deciphers it on its way up.
#[derive(Debug)]
pub struct EncryptingDevice<D: RawDevice, C: BlockCipher> {
    inner: D,
    cipher: C,
}

impl<D: RawDevice, C: BlockCipher> EncryptingDevice<D, C> {
    pub fn new(inner: D, cipher: C) -> Self {
        Self { inner, cipher }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: RawDevice, C: BlockCipher> RawDevice for EncryptingDevice<D, C> {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn len_blocks(&self) -> u64 {
        self.inner.len_blocks()
    }

    fn read_blocks(&self, block: BlockNumber, buf: &mut [u8], iv: BlockIv) -> Result<()> {
        blocks_in_buffer(self.block_size(), buf.len())?;
        self.inner.read_blocks(block, buf, iv)?;
        let size = self.block_size().as_usize();
        for (i, chunk) in buf.chunks_exact_mut(size).enumerate() {
            self.cipher
                .decrypt_block(BlockNumber(block.0 + i as u64), iv, chunk);
        }
        Ok(())
    }

    fn write_blocks(&self, block: BlockNumber, data: &[u8], iv: BlockIv) -> Result<()> {
        blocks_in_buffer(self.block_size(), data.len())?;
        let size = self.block_size().as_usize();
        let mut sealed = data.to_vec();
        for (i, chunk) in sealed.chunks_exact_mut(size).enumerate() {
            self.cipher
                .encrypt_block(BlockNumber(block.0 + i as u64), iv, chunk);
        }
        self.inner.write_blocks(block, &sealed, iv)
    }

    fn set_len_blocks(&self, blocks: u64) -> Result<()> {
        self.inner.set_len_blocks(blocks)
    }

    fn sync(&self, force_metadata: bool) -> Result<()> {
        self.inner.sync(force_metadata)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
