//! Consistency checks, repair and statistics

use super::SpaceState;
use crate::allocator::{SPACE_ID_DIRECTORY, SPACE_ID_EMPTY, SPACE_ID_SET_ASIDE};
use crate::error::Result;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A block whose bitmap is stored outside the directory space, or at the
/// same place as another block's bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceMismatch {
    pub block_index: u32,
    pub space_id: i32,
}

/// A block whose directory counters disagree with its bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitmapMismatch {
    pub block_index: u32,
    pub space_id: i32,
    pub recorded_free: u32,
    pub recorded_trailing: u32,
    pub live_free: u32,
    pub live_trailing: u32,
}

/// Directory entry of one provisioned block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    pub index: u32,
    pub space_id: i32,
    pub free_units: u32,
    pub trailing_free_units: u32,
    pub bitmap_position: u64,
}

/// Summary of a data file's directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceStats {
    pub file_block_size: u64,
    pub unit_size: u64,
    pub units_per_block: u32,
    pub file_size: u64,
    pub provisioned_blocks: u32,
    pub empty_blocks: u32,
    pub set_aside_blocks: u32,
    pub directory_blocks: u32,
    /// Blocks owned by each table space (the default space included)
    pub blocks_per_space: BTreeMap<i32, u32>,
    pub lost_bytes: u64,
    /// Released bytes still waiting in free-range lists
    pub pending_free_bytes: u64,
    pub registered_spaces: usize,
}

impl SpaceStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl SpaceState {
    /// Every provisioned block's entry, in index order
    fn block_entries(&mut self) -> Result<Vec<BlockEntry>> {
        let mut entries = Vec::new();
        let mut accessor = self.accessor(false);

        while accessor.next_block()? {
            let (Some(index), Some(bitmap_position)) =
                (accessor.current_block(), accessor.bitmap_position())
            else {
                continue;
            };
            let (free_units, trailing_free_units) = accessor.recorded_counts()?;
            entries.push(BlockEntry {
                index,
                space_id: accessor.space_id()?,
                free_units,
                trailing_free_units,
                bitmap_position,
            });
        }

        Ok(entries)
    }

    pub(super) fn block_entry_locked(&mut self, index: u32) -> Result<Option<BlockEntry>> {
        let mut accessor = self.accessor(false);
        if !accessor.move_to_block(index)? {
            return Ok(None);
        }

        let (free_units, trailing_free_units) = accessor.recorded_counts()?;
        Ok(Some(BlockEntry {
            index,
            space_id: accessor.space_id()?,
            free_units,
            trailing_free_units,
            bitmap_position: accessor.bitmap_position().unwrap_or(0),
        }))
    }

    pub(super) fn check_directory_spaces_locked(&mut self) -> Result<Vec<SpaceMismatch>> {
        let geometry = self.geometry;
        let entries = self.block_entries()?;

        let owners: AHashMap<u32, i32> = entries.iter().map(|e| (e.index, e.space_id)).collect();
        let mut holders: AHashMap<u64, u32> = AHashMap::new();
        let mut mismatches = Vec::new();

        for entry in &entries {
            let holder = geometry.block_index(entry.bitmap_position);
            let misplaced = owners.get(&holder) != Some(&SPACE_ID_DIRECTORY);
            let shared = holders.contains_key(&entry.bitmap_position);
            holders.entry(entry.bitmap_position).or_insert(entry.index);

            if misplaced || shared {
                warn!(
                    "Block {} of space {}: bitmap at {} is {}",
                    entry.index,
                    entry.space_id,
                    entry.bitmap_position,
                    if shared { "shared" } else { "outside the directory space" }
                );
                mismatches.push(SpaceMismatch {
                    block_index: entry.index,
                    space_id: entry.space_id,
                });
            }
        }

        Ok(mismatches)
    }

    pub(super) fn check_directory_bitmaps_locked(&mut self) -> Result<Vec<BitmapMismatch>> {
        let mut mismatches = Vec::new();
        let mut accessor = self.accessor(false);

        while accessor.next_block()? {
            let Some(index) = accessor.current_block() else {
                continue;
            };
            let (recorded_free, recorded_trailing) = accessor.recorded_counts()?;
            let (live_free, live_trailing) = accessor.live_counts()?;

            if (recorded_free, recorded_trailing) != (live_free, live_trailing) {
                mismatches.push(BitmapMismatch {
                    block_index: index,
                    space_id: accessor.space_id()?,
                    recorded_free,
                    recorded_trailing,
                    live_free,
                    live_trailing,
                });
            }
        }

        Ok(mismatches)
    }

    /// Rewrite counters that disagree with their bitmap
    pub(super) fn repair_directory_bitmaps_locked(&mut self) -> Result<usize> {
        let mut repaired = 0;
        {
            // Leaving each block writes its recomputed counters back
            let mut accessor = self.accessor(true);
            while accessor.next_block()? {
                if accessor.recorded_counts()? != accessor.live_counts()? {
                    repaired += 1;
                }
            }
        }

        if repaired > 0 {
            self.flush_locked()?;
            info!("Repaired counters of {} block(s)", repaired);
        }
        Ok(repaired)
    }

    /// Free bytes recorded across every provisioned block
    pub(super) fn lost_blocks_size_locked(&mut self) -> Result<u64> {
        let unit_size = self.geometry.unit_size;
        let lost = self
            .block_entries()?
            .iter()
            .map(|entry| entry.free_units as u64 * unit_size)
            .sum();
        Ok(lost)
    }

    pub(super) fn stats_locked(&mut self) -> Result<SpaceStats> {
        let geometry = self.geometry;
        let entries = self.block_entries()?;

        let mut stats = SpaceStats {
            file_block_size: geometry.file_block_size,
            unit_size: geometry.unit_size,
            units_per_block: geometry.units_per_block,
            file_size: self.cache.file.file_free_pos(),
            provisioned_blocks: entries.len() as u32,
            empty_blocks: 0,
            set_aside_blocks: 0,
            directory_blocks: 0,
            blocks_per_space: BTreeMap::new(),
            lost_bytes: self.lost_blocks_size_locked()?,
            pending_free_bytes: self
                .spaces
                .values()
                .map(|m| m.free_list().total_units() * geometry.unit_size)
                .sum(),
            registered_spaces: self.spaces.len(),
        };

        for entry in &entries {
            match entry.space_id {
                SPACE_ID_EMPTY => stats.empty_blocks += 1,
                SPACE_ID_SET_ASIDE => stats.set_aside_blocks += 1,
                SPACE_ID_DIRECTORY => stats.directory_blocks += 1,
                id => *stats.blocks_per_space.entry(id).or_insert(0) += 1,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SPACE_ID_DEFAULT;
    use crate::allocator::directory::DirectoryBlock;
    use crate::config::SpaceConfig;
    use crate::DataSpaceManager;
    use tempfile::TempDir;

    const BLOCK: u64 = 64 * 1024;

    fn create(dir: &TempDir) -> DataSpaceManager {
        let config = SpaceConfig::default()
            .with_file_block_size(BLOCK as u32)
            .with_unit_size(64);
        DataSpaceManager::create(dir.path().join("data.bsp"), &config).unwrap()
    }

    /// Edit the directory entry of `index` in place
    fn edit_entry(spaces: &DataSpaceManager, index: u32, edit: impl FnOnce(&mut DirectoryBlock, usize)) {
        let mut guard = spaces.state.lock();
        let state = &mut *guard;
        let geometry = state.geometry;
        let directory_index = (index / geometry.directory_capacity) as usize;
        let address = state.root().unwrap().position_of(directory_index);

        let cache = &mut state.cache;
        let dir = cache
            .directories
            .get_mut(&mut cache.file, geometry.unscaled(address))
            .unwrap();
        edit(dir, (index % geometry.directory_capacity) as usize);
    }

    #[test]
    fn test_fresh_file_is_consistent() {
        let dir = TempDir::new().unwrap();
        let spaces = create(&dir);
        let table = spaces.get_new_table_space_id();
        spaces.get_file_position(table, 640).unwrap();

        assert!(spaces.check_directory_spaces().unwrap().is_empty());
        assert!(spaces.check_directory_bitmaps().unwrap().is_empty());
        assert_eq!(spaces.repair_directory_bitmaps().unwrap(), 0);
    }

    #[test]
    fn test_counter_mismatch_is_reported_and_repaired() {
        let dir = TempDir::new().unwrap();
        let spaces = create(&dir);
        let table = spaces.get_new_table_space_id();
        let index = (spaces.get_file_position(table, 640).unwrap() / BLOCK) as u32;

        edit_entry(&spaces, index, |dir, slot| dir.set_free_units(slot, 5));

        let mismatches = spaces.check_directory_bitmaps().unwrap();
        assert_eq!(
            mismatches,
            vec![BitmapMismatch {
                block_index: index,
                space_id: table,
                recorded_free: 5,
                recorded_trailing: 1014,
                live_free: 1014,
                live_trailing: 1014,
            }]
        );

        assert_eq!(spaces.repair_directory_bitmaps().unwrap(), 1);
        assert!(spaces.check_directory_bitmaps().unwrap().is_empty());
    }

    #[test]
    fn test_shared_bitmap_is_reported() {
        let dir = TempDir::new().unwrap();
        let spaces = create(&dir);
        let table = spaces.get_new_table_space_id();
        let index = (spaces.get_file_position(table, 640).unwrap() / BLOCK) as u32;

        let mut default_address = 0;
        edit_entry(&spaces, 0, |dir, slot| default_address = dir.bitmap_address(slot));
        edit_entry(&spaces, index, |dir, slot| dir.set_bitmap_address(slot, default_address));

        assert_eq!(
            spaces.check_directory_spaces().unwrap(),
            vec![SpaceMismatch {
                block_index: index,
                space_id: table,
            }]
        );
    }

    #[test]
    fn test_misplaced_bitmap_is_reported() {
        let dir = TempDir::new().unwrap();
        let spaces = create(&dir);
        let table = spaces.get_new_table_space_id();
        let index = (spaces.get_file_position(table, 640).unwrap() / BLOCK) as u32;

        // Point the bitmap into the data area of the block itself
        let address = (index as u64 * BLOCK / 64) as u32;
        edit_entry(&spaces, index, |dir, slot| dir.set_bitmap_address(slot, address));

        let mismatches = spaces.check_directory_spaces().unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].block_index, index);
    }

    #[test]
    fn test_lost_size_and_stats() {
        let dir = TempDir::new().unwrap();
        let spaces = create(&dir);
        let table = spaces.get_new_table_space_id();
        let position = spaces.get_file_position(table, 640).unwrap();
        spaces.release(table, position, 64).unwrap();

        // Default block, directory space tail and the table's block
        let directory_free = spaces.block_entry(1).unwrap().unwrap().free_units as u64;
        assert!(directory_free > 0);
        assert_eq!(
            spaces.get_lost_blocks_size().unwrap(),
            (960 + directory_free + 1014) * 64
        );

        let stats = spaces.stats().unwrap();
        assert_eq!(stats.provisioned_blocks, 3);
        assert_eq!(stats.directory_blocks, 1);
        assert_eq!(stats.empty_blocks, 0);
        assert_eq!(stats.blocks_per_space.get(&SPACE_ID_DEFAULT), Some(&1));
        assert_eq!(stats.blocks_per_space.get(&table), Some(&1));
        assert_eq!(stats.pending_free_bytes, 64);
        assert_eq!(stats.file_size, 3 * BLOCK);

        let json = stats.to_json().unwrap();
        assert!(json.contains("\"provisioned_blocks\": 3"));
    }
}
