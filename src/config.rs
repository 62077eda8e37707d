//! Allocator configuration
//!
//! Geometry (block size, unit size, directory capacities) is fixed when a data
//! file is created and persisted in the header. Tuning values (free-range list
//! capacity, record cache size) may change between opens.

use crate::error::{Result, SpaceError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Largest number of allocation units one file block may hold.
///
/// Directory entries keep free counts in 16 bits.
pub const MAX_UNITS_PER_BLOCK: u32 = 32 * 1024;

/// Configuration for a [`DataSpaceManager`](crate::DataSpaceManager)
///
/// # Examples
///
/// ```
/// use blockspace::SpaceConfig;
///
/// let config = SpaceConfig::default()
///     .with_file_block_size(64 * 1024)
///     .with_unit_size(64);
/// config.validate_geometry().unwrap();
/// assert_eq!(config.units_per_block(), 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SpaceConfig {
    /// Size of one file block in bytes
    #[validate(range(min = 4096, max = 1073741824))]
    pub file_block_size: u32,

    /// Size of one allocation unit in bytes (the data file scale)
    #[validate(range(min = 1, max = 4096))]
    pub unit_size: u32,

    /// Number of file blocks described by one directory block
    #[validate(range(min = 2, max = 65536))]
    pub directory_capacity: u32,

    /// Number of directory blocks the root directory can address
    #[validate(range(min = 2, max = 65536))]
    pub root_capacity: u32,

    /// Capacity of each table space's free-range list (0 disables reuse)
    #[validate(range(max = 65536))]
    pub max_free_ranges: usize,

    /// Unpinned records kept per record store
    #[validate(range(min = 1))]
    pub cache_capacity: usize,

    /// Open without rebuilding in-memory state and reject mutation
    pub read_only: bool,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            file_block_size: 1024 * 1024,
            unit_size: 32,
            directory_capacity: 2048,
            root_capacity: 2048,
            max_free_ranges: 512,
            cache_capacity: 256,
            read_only: false,
        }
    }
}

impl SpaceConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SpaceConfig = toml::from_str(text)?;
        config.validate_geometry()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_file_block_size(mut self, bytes: u32) -> Self {
        self.file_block_size = bytes;
        self
    }

    pub fn with_unit_size(mut self, bytes: u32) -> Self {
        self.unit_size = bytes;
        self
    }

    pub fn with_directory_capacity(mut self, entries: u32) -> Self {
        self.directory_capacity = entries;
        self
    }

    pub fn with_root_capacity(mut self, entries: u32) -> Self {
        self.root_capacity = entries;
        self
    }

    pub fn with_max_free_ranges(mut self, ranges: usize) -> Self {
        self.max_free_ranges = ranges;
        self
    }

    pub fn with_cache_capacity(mut self, records: usize) -> Self {
        self.cache_capacity = records;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Allocation units per file block
    pub fn units_per_block(&self) -> u32 {
        self.file_block_size / self.unit_size.max(1)
    }

    /// Validate field ranges and the derived block geometry
    pub fn validate_geometry(&self) -> Result<()> {
        self.validate()
            .map_err(|e| SpaceError::InvalidConfig(e.to_string()))?;

        if !self.file_block_size.is_power_of_two() {
            return Err(SpaceError::InvalidConfig(format!(
                "file_block_size {} is not a power of two",
                self.file_block_size
            )));
        }

        if !self.unit_size.is_power_of_two() {
            return Err(SpaceError::InvalidConfig(format!(
                "unit_size {} is not a power of two",
                self.unit_size
            )));
        }

        let units = self.units_per_block();
        if units % 32 != 0 || units > MAX_UNITS_PER_BLOCK {
            return Err(SpaceError::InvalidConfig(format!(
                "file block holds {} units (must be a multiple of 32, at most {})",
                units, MAX_UNITS_PER_BLOCK
            )));
        }

        Ok(())
    }
}
