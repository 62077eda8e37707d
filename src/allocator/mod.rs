//! Block and unit allocation primitives
//!
//! - [`bitmap`]: per-block allocation-unit bitmap
//! - [`directory`]: directory blocks and the root directory
//! - [`extent`]: coalescing free-range list used by table spaces
//! - [`free_blocks`]: set of globally empty file blocks
//! - [`table_space`]: per-space sub-block allocator
//! - [`accessor`]: cursor over the directory that keeps counters in sync

pub mod accessor;
pub mod bitmap;
pub mod directory;
pub mod extent;
pub mod free_blocks;
pub mod table_space;

use crate::config::SpaceConfig;
use crate::error::{Result, SpaceError};

/// Owner marker of a block quarantined after a detected inconsistency
pub const SPACE_ID_SET_ASIDE: i32 = -1;

/// Owner marker of a fully free, unclaimed block
pub const SPACE_ID_EMPTY: i32 = 0;

/// Space holding the allocator's own records (root, directories, bitmaps)
pub const SPACE_ID_DIRECTORY: i32 = 1;

/// Fallback space for objects without a dedicated space
pub const SPACE_ID_DEFAULT: i32 = 2;

/// First id handed out by the space id counter
pub const SPACE_ID_FIRST: i32 = 4;

/// Free-range list capacity of the directory space
pub const DIRECTORY_FREE_RANGES: usize = 16;

/// True for ids that may own blocks and request space
pub fn is_space_id(id: i32) -> bool {
    id >= SPACE_ID_DIRECTORY
}

/// Smallest even id strictly above `id`
pub fn next_space_id_above(id: i32) -> i32 {
    (id + 2) & !1
}

/// Fixed geometry of a data file, with the derived record sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub file_block_size: u64,
    pub unit_size: u64,
    pub units_per_block: u32,
    pub directory_capacity: u32,
    pub root_capacity: u32,
}

impl BlockGeometry {
    pub fn from_config(config: &SpaceConfig) -> Self {
        BlockGeometry {
            file_block_size: config.file_block_size as u64,
            unit_size: config.unit_size as u64,
            units_per_block: config.units_per_block(),
            directory_capacity: config.directory_capacity,
            root_capacity: config.root_capacity,
        }
    }

    /// Most file blocks that can be addressed
    ///
    /// Limited by the root directory and by the 32-bit scaled addresses
    /// stored in root and directory records.
    pub fn max_blocks(&self) -> u64 {
        let by_directory = self.directory_capacity as u64 * self.root_capacity as u64;
        let by_address = ((u32::MAX as u64 + 1) * self.unit_size) / self.file_block_size;
        by_directory.min(by_address)
    }

    /// Byte position of the start of a block
    pub fn block_position(&self, index: u32) -> u64 {
        index as u64 * self.file_block_size
    }

    /// Block containing a byte position
    pub fn block_index(&self, position: u64) -> u32 {
        (position / self.file_block_size) as u32
    }

    /// Unit offset of a byte position inside its block
    pub fn unit_in_block(&self, position: u64) -> u32 {
        ((position % self.file_block_size) / self.unit_size) as u32
    }

    /// Whole units covering `bytes` (at least one)
    pub fn units_for(&self, bytes: u64) -> u64 {
        ((bytes + self.unit_size - 1) / self.unit_size).max(1)
    }

    /// Whole blocks covering `bytes`
    pub fn blocks_for(&self, bytes: u64) -> u32 {
        ((bytes + self.file_block_size - 1) / self.file_block_size) as u32
    }

    /// Round a record size up to the unit scale
    pub fn aligned(&self, bytes: usize) -> u64 {
        let bytes = bytes as u64;
        (bytes + self.unit_size - 1) / self.unit_size * self.unit_size
    }

    /// Stored (scaled) form of a byte position
    pub fn scaled(&self, position: u64) -> Result<u32> {
        u32::try_from(position / self.unit_size)
            .map_err(|_| SpaceError::AddressOutOfRange(position))
    }

    /// Byte position of a stored (scaled) address
    pub fn unscaled(&self, address: u32) -> u64 {
        address as u64 * self.unit_size
    }

    pub fn root_record_size(&self) -> usize {
        self.root_capacity as usize * 4
    }

    pub fn directory_record_size(&self) -> usize {
        self.directory_capacity as usize * directory::ENTRY_BYTES
    }

    pub fn bitmap_record_size(&self) -> usize {
        bitmap::BitMap::storage_size(self.units_per_block)
    }

    /// Directory blocks needed to describe `block_count` file blocks
    pub fn directories_for(&self, block_count: u64) -> u64 {
        (block_count + self.directory_capacity as u64 - 1) / self.directory_capacity as u64
    }

    /// Bytes of directory space needed to register blocks
    /// `first..first + count`: one bitmap each, plus any new directory blocks
    pub fn record_bytes_for(&self, first: u32, count: u32) -> u64 {
        let before = self.directories_for(first as u64);
        let after = self.directories_for(first as u64 + count as u64);

        count as u64 * self.aligned(self.bitmap_record_size())
            + (after - before) * self.aligned(self.directory_record_size())
    }

    /// Directory-space blocks needed when a new file starts with
    /// `data_blocks` blocks of data
    ///
    /// The directory blocks describe themselves, so the count is iterated
    /// until it covers its own records.
    pub fn initial_directory_blocks(&self, data_blocks: u32) -> u32 {
        let root = self.aligned(self.root_record_size());
        let mut directory_blocks = 1;

        loop {
            let bytes = root + self.record_bytes_for(0, data_blocks + directory_blocks);
            let needed = self.blocks_for(bytes).max(1);
            if needed <= directory_blocks {
                return directory_blocks;
            }
            directory_blocks = needed;
        }
    }
}
