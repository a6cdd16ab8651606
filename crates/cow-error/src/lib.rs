#![forbid(unsafe_code)]
//! Error types for the cowstore block engine.
//!
//! # Error Taxonomy
//!
//! | Variant | Raised by | Effect on the device |
//! |---------|-----------|----------------------|
//! | `OutOfSpace` | allocation after growth was refused | fatal to the operation only |
//! | `StorageIo` | raw device read/write/sync/resize | device refuses further writes |
//! | `Integrity` | checksum mismatch, undecodable on-disk record | fatal to the operation, never masked |
//! | `UnsupportedFormat` | superblock label/version/block size mismatch at open | open fails |
//! | `InvalidArgument` | oversized chunk, bad configuration | rejected before any I/O |
//! | `Closed` | any call after `close()` / `force_close()` | terminal |
//! | `DeviceFailed` | any mutating call after a `StorageIo` failure | terminal until reopen |
//!
//! ## Mapping Policy: ParseError → CowError
//!
//! `cow-error` does not depend on `cow-types`. Crates that parse on-disk
//! bytes convert `ParseError` at their own boundary: while opening a device
//! a parse failure is `UnsupportedFormat`; while reading live data it is
//! `Integrity` with the block number attached for triage.
//!
//! Nothing in the engine retries. Errors propagate to the caller, which
//! decides whether to abort the transaction.

use thiserror::Error;

/// Unified error type for all block engine operations.
#[derive(Debug, Error)]
pub enum CowError {
    /// Allocation could not be satisfied even after the device was asked to grow.
    #[error("out of space: cannot allocate {requested} contiguous blocks")]
    OutOfSpace { requested: u64 },

    /// The raw device failed a read, write, resize or sync.
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// Persisted bytes failed verification.
    ///
    /// Signals corruption or a wrong encryption key. The `block` field is the
    /// first block of the affected extent.
    #[error("integrity error at block {block}: {detail}")]
    Integrity { block: u64, detail: String },

    /// Superblock label, format version or geometry does not match.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Caller supplied an argument outside a hard format limit.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device has been closed.
    #[error("device is closed")]
    Closed,

    /// A previous fatal error invalidated the device for writes.
    #[error("device failed: {0}")]
    DeviceFailed(String),
}

impl CowError {
    /// Whether this error must invalidate the managed device for further writes.
    ///
    /// The match is exhaustive so that a new variant must be classified.
    #[must_use]
    pub fn poisons_device(&self) -> bool {
        match self {
            Self::StorageIo(_) => true,
            Self::OutOfSpace { .. }
            | Self::Integrity { .. }
            | Self::UnsupportedFormat(_)
            | Self::InvalidArgument(_)
            | Self::Closed
            | Self::DeviceFailed(_) => false,
        }
    }

    /// Shorthand for an integrity failure at `block`.
    #[must_use]
    pub fn integrity(block: u64, detail: impl Into<String>) -> Self {
        Self::Integrity {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `CowError`.
pub type Result<T> = std::result::Result<T, CowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_io_poisons() {
        let cases: Vec<(CowError, bool)> = vec![
            (CowError::StorageIo(std::io::Error::other("disk")), true),
            (CowError::OutOfSpace { requested: 4 }, false),
            (CowError::integrity(7, "bad checksum"), false),
            (CowError::UnsupportedFormat("label".into()), false),
            (CowError::InvalidArgument("too big".into()), false),
            (CowError::Closed, false),
            (CowError::DeviceFailed("earlier write failed".into()), false),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.poisons_device(), *expected, "wrong class for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let err = CowError::integrity(42, "checksum mismatch");
        assert_eq!(err.to_string(), "integrity error at block 42: checksum mismatch");

        let space = CowError::OutOfSpace { requested: 3 };
        assert_eq!(
            space.to_string(),
            "out of space: cannot allocate 3 contiguous blocks"
        );

        let fmt = CowError::UnsupportedFormat("label mismatch".into());
        assert_eq!(fmt.to_string(), "unsupported format: label mismatch");

        assert_eq!(CowError::Closed.to_string(), "device is closed");
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("short write"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(CowError::StorageIo(_))));
    }
}
