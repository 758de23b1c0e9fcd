//! Allocator configuration
//!
//! Configuration can be built in code or loaded from TOML:
//!
//! ```toml
//! block_size = 8192
//! slice_size = 1048576
//! grow_slices = 1
//! find_chunk_bits = 8192
//! ```

use crate::error::{AllocError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default data block size in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Default volume slice size in bytes (1 MiB)
pub const DEFAULT_SLICE_SIZE: u64 = 1024 * 1024;

/// Smallest block size accepted
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Tunables for a [`BlockAllocator`](crate::BlockAllocator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Size of one data block in bytes (power of two)
    pub block_size: u32,

    /// Size of one extensible volume slice in bytes
    ///
    /// Must be a whole multiple of `block_size`. Ignored for volumes that
    /// cannot grow.
    pub slice_size: u64,

    /// Slices requested from the volume per extension
    pub grow_slices: u64,

    /// Width of the swap-in lookahead window used while searching for a
    /// free block, in bits (multiple of 64)
    pub find_chunk_bits: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            slice_size: DEFAULT_SLICE_SIZE,
            grow_slices: 1,
            find_chunk_bits: 8192,
        }
    }
}

impl AllocatorConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: AllocatorConfig =
            toml::from_str(source).map_err(|e| AllocError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| AllocError::Config(e.to_string()))
    }

    /// Bits described by one block of the block map
    pub fn bits_per_block(&self) -> u64 {
        self.block_size as u64 * 8
    }

    /// Data blocks per volume slice
    pub fn blocks_per_slice(&self) -> u64 {
        self.slice_size / self.block_size as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(AllocError::InvalidBlockSize(self.block_size));
        }

        if self.slice_size == 0 || self.slice_size % self.block_size as u64 != 0 {
            return Err(AllocError::Config(format!(
                "slice size {} is not a multiple of block size {}",
                self.slice_size, self.block_size
            )));
        }

        if self.grow_slices == 0 {
            return Err(AllocError::Config("grow_slices must be at least 1".into()));
        }

        if self.find_chunk_bits == 0 || self.find_chunk_bits % 64 != 0 {
            return Err(AllocError::Config(format!(
                "find_chunk_bits {} must be a non-zero multiple of 64",
                self.find_chunk_bits
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AllocatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bits_per_block(), 65536);
        assert_eq!(config.blocks_per_slice(), 128);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AllocatorConfig::from_toml_str("block_size = 4096\ngrow_slices = 4\n").unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.grow_slices, 4);
        assert_eq!(config.slice_size, DEFAULT_SLICE_SIZE);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AllocatorConfig {
            block_size: 1024,
            slice_size: 64 * 1024,
            grow_slices: 2,
            find_chunk_bits: 128,
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(AllocatorConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let result = AllocatorConfig::from_toml_str("block_size = 3000");
        assert!(matches!(result, Err(AllocError::InvalidBlockSize(3000))));
    }

    #[test]
    fn test_rejects_unaligned_slice() {
        let result = AllocatorConfig::from_toml_str("block_size = 4096\nslice_size = 10000");
        assert!(matches!(result, Err(AllocError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let result = AllocatorConfig::from_toml_str("bogus = 1");
        assert!(matches!(result, Err(AllocError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc.toml");
        std::fs::write(&path, "find_chunk_bits = 256\n").unwrap();

        let config = AllocatorConfig::load(&path).unwrap();
        assert_eq!(config.find_chunk_bits, 256);
    }
}
