//! Store-level configuration.

use cow_blob::BlobConfig;
use cow_device::DeviceOptions;
use cow_error::{CowError, Result};
use cow_extent::{AccessorOptions, BlockAccessor};
use cow_types::BlockSize;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Every tunable of a store, loadable from JSON.
///
/// Missing fields take their defaults, so `{}` is a valid configuration:
///
/// ```
/// let config = cow::StoreConfig::from_json_str(r#"{"block_size": 8192}"#).unwrap();
/// assert_eq!(config.block_size, 8192);
/// assert_eq!(config.blob.direct_pointers, 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Bytes per block; a power of two in 512..=65536.
    pub block_size: u32,
    pub device: DeviceOptions,
    pub accessor: AccessorOptions,
    pub blob: BlobConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            device: DeviceOptions::default(),
            accessor: AccessorOptions::default(),
            blob: BlobConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| CowError::InvalidArgument(format!("store config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| CowError::InvalidArgument(format!("store config: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.block_size()?;
        self.device.validate()?;
        self.accessor.validate()?;
        self.blob.validate()
    }

    pub fn block_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.block_size)
            .map_err(|err| CowError::InvalidArgument(format!("{err}: got {}", self.block_size)))
    }

    /// Accessor for writing new extents under this configuration.
    pub fn accessor(&self) -> Result<BlockAccessor> {
        BlockAccessor::new(self.accessor)
    }
}
