//! Directory blocks and the root directory
//!
//! A directory block describes `capacity` consecutive file blocks as four
//! parallel arrays: owner space id, free units, trailing free units and the
//! scaled position of the block's bitmap. The root directory maps a directory
//! index to the scaled position of that directory block.
//!
//! Both are persisted big-endian as flat arrays in the order above.

use crate::error::{Result, SpaceError};
use crate::store::Record;

/// Bytes per directory slot across the four arrays
pub const ENTRY_BYTES: usize = 4 + 2 + 2 + 4;

/// Per-block metadata for one range of file blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryBlock {
    space_ids: Vec<i32>,
    free_units: Vec<u16>,
    trailing_free_units: Vec<u16>,
    bitmap_addresses: Vec<u32>,
}

impl DirectoryBlock {
    /// Create a directory block with every slot unprovisioned
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity as usize;
        DirectoryBlock {
            space_ids: vec![0; capacity],
            free_units: vec![0; capacity],
            trailing_free_units: vec![0; capacity],
            bitmap_addresses: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.space_ids.len()
    }

    pub fn space_id(&self, slot: usize) -> i32 {
        self.space_ids[slot]
    }

    pub fn set_space_id(&mut self, slot: usize, id: i32) {
        self.space_ids[slot] = id;
    }

    pub fn free_units(&self, slot: usize) -> u32 {
        self.free_units[slot] as u32
    }

    pub fn set_free_units(&mut self, slot: usize, units: u32) {
        self.free_units[slot] = units as u16;
    }

    pub fn trailing_free_units(&self, slot: usize) -> u32 {
        self.trailing_free_units[slot] as u32
    }

    pub fn set_trailing_free_units(&mut self, slot: usize, units: u32) {
        self.trailing_free_units[slot] = units as u16;
    }

    /// Scaled bitmap position (0 = block not provisioned)
    pub fn bitmap_address(&self, slot: usize) -> u32 {
        self.bitmap_addresses[slot]
    }

    pub fn set_bitmap_address(&mut self, slot: usize, address: u32) {
        self.bitmap_addresses[slot] = address;
    }

    pub fn is_provisioned(&self, slot: usize) -> bool {
        self.bitmap_addresses[slot] != 0
    }
}

impl Record for DirectoryBlock {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.capacity() * ENTRY_BYTES);

        for id in &self.space_ids {
            bytes.extend_from_slice(&id.to_be_bytes());
        }
        for units in &self.free_units {
            bytes.extend_from_slice(&units.to_be_bytes());
        }
        for units in &self.trailing_free_units {
            bytes.extend_from_slice(&units.to_be_bytes());
        }
        for address in &self.bitmap_addresses {
            bytes.extend_from_slice(&address.to_be_bytes());
        }

        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % ENTRY_BYTES != 0 {
            return Err(SpaceError::InvalidRecordSize {
                expected: (bytes.len() / ENTRY_BYTES + 1) * ENTRY_BYTES,
                actual: bytes.len(),
            });
        }

        let capacity = bytes.len() / ENTRY_BYTES;
        let (ids, rest) = bytes.split_at(capacity * 4);
        let (free, rest) = rest.split_at(capacity * 2);
        let (trailing, addresses) = rest.split_at(capacity * 2);

        Ok(DirectoryBlock {
            space_ids: ids
                .chunks_exact(4)
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            free_units: free
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
            trailing_free_units: trailing
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
            bitmap_addresses: addresses
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        })
    }
}

/// Top-level index of directory block positions
///
/// Grows by appending; a slot below the high-water mark is never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDirectory {
    positions: Vec<u32>,
}

impl RootDirectory {
    pub fn new(capacity: u32) -> Self {
        RootDirectory {
            positions: vec![0; capacity as usize],
        }
    }

    pub fn capacity(&self) -> usize {
        self.positions.len()
    }

    /// Scaled position of a directory block (0 = not allocated)
    pub fn position_of(&self, directory_index: usize) -> u32 {
        self.positions.get(directory_index).copied().unwrap_or(0)
    }

    pub fn set_position_of(&mut self, directory_index: usize, address: u32) {
        self.positions[directory_index] = address;
    }

    /// Highest directory index with an allocated block
    pub fn highest_non_empty_index(&self) -> Option<usize> {
        self.positions.iter().rposition(|&p| p != 0)
    }
}

impl Record for RootDirectory {
    fn encode(&self) -> Vec<u8> {
        self.positions.iter().flat_map(|p| p.to_be_bytes()).collect()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(SpaceError::InvalidRecordSize {
                expected: (bytes.len() / 4 + 1) * 4,
                actual: bytes.len(),
            });
        }

        Ok(RootDirectory {
            positions: bytes
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        })
    }
}
