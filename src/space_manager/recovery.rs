//! Reopening a data file and rebuilding in-memory state

use super::SpaceState;
use crate::allocator::{
    next_space_id_above, BlockGeometry, SPACE_ID_DEFAULT, SPACE_ID_EMPTY, SPACE_ID_SET_ASIDE,
};
use crate::config::SpaceConfig;
use crate::error::{Result, SpaceError};
use crate::io::DataFile;
use crate::store::BlockCache;
use std::path::Path;
use tracing::{debug, error, info, warn};

fn unreadable(error: SpaceError) -> SpaceError {
    match error {
        SpaceError::UnreadableDirectory(_) => error,
        other => SpaceError::UnreadableDirectory(other.to_string()),
    }
}

impl SpaceState {
    /// Open a data file and load its root directory
    ///
    /// Geometry always comes from the header; a config that disagrees only
    /// contributes its tuning values.
    pub(super) fn open(path: &Path, config: &SpaceConfig) -> Result<Self> {
        let mut file = DataFile::open(path, config.read_only)?;
        let header = file.read_header()?;

        let stored = header.geometry();
        if stored.file_block_size != config.file_block_size
            || stored.unit_size != config.unit_size
            || stored.directory_capacity != config.directory_capacity
            || stored.root_capacity != config.root_capacity
        {
            warn!(
                "Configured geometry differs from the data file; using {} byte blocks of {} byte units",
                stored.file_block_size, stored.unit_size
            );
        }

        if header.space_manager_position == 0 {
            return Err(SpaceError::UnreadableDirectory(
                "header has no root directory".into(),
            ));
        }

        let geometry = BlockGeometry::from_config(&stored);
        let mut cache = BlockCache::new(file, &geometry, config.cache_capacity);
        let root_position = header.root_position();
        {
            let cache = &mut cache;
            cache
                .roots
                .fetch(&mut cache.file, root_position, true)
                .map_err(unreadable)?;
        }

        let mut state = SpaceState::new(cache, header, config);
        state.block_index_limit = state.find_block_index_limit()?;
        state.register_reserved_spaces();

        debug!(
            "Loaded root directory at {} ({} block(s))",
            root_position, state.block_index_limit
        );
        Ok(state)
    }

    /// One past the last provisioned block of the highest directory block
    fn find_block_index_limit(&mut self) -> Result<u32> {
        let capacity = self.geometry.directory_capacity;
        let Some(directory_index) = self.root()?.highest_non_empty_index() else {
            return Ok(0);
        };

        let position = self
            .geometry
            .unscaled(self.root()?.position_of(directory_index));
        let cache = &mut self.cache;
        let directory = cache
            .directories
            .get(&mut cache.file, position)
            .map_err(unreadable)?;

        let base = directory_index as u32 * capacity;
        let last = (0..directory.capacity())
            .rev()
            .find(|&slot| directory.is_provisioned(slot));

        Ok(match last {
            Some(slot) => base + slot as u32 + 1,
            None => base,
        })
    }

    /// Rebuild the empty-block set and resume every registered space
    ///
    /// Returns the highest owner id found, or `None` when opened read-only.
    pub(super) fn initialise_spaces_locked(&mut self) -> Result<Option<i32>> {
        if self.block_index_limit == 0 {
            return Err(SpaceError::UnreadableDirectory(
                "directory describes no blocks".into(),
            ));
        }
        if self.read_only {
            return Ok(None);
        }

        let max_id = self.initialise_space_list()?;
        self.unowned_from = Some(next_space_id_above(max_id));

        let mut ids: Vec<i32> = self.spaces.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.resume_space(id)?;
        }

        Ok(Some(max_id))
    }

    /// Scan the directory, collecting empty blocks
    ///
    /// An empty block whose counters or bitmap are not fully free is set
    /// aside and never reused. Counter mismatches on owned blocks are
    /// corrected as the scan leaves each block.
    fn initialise_space_list(&mut self) -> Result<i32> {
        let units = self.geometry.units_per_block;
        let full = (units, units);
        let mut empty = Vec::new();
        let mut set_aside = 0;
        let mut max_id = SPACE_ID_DEFAULT;

        self.free_blocks.clear();
        {
            let mut accessor = self.accessor(true);
            while accessor.next_block()? {
                let Some(index) = accessor.current_block() else {
                    continue;
                };
                let owner = accessor.space_id()?;
                let recorded = accessor.recorded_counts()?;
                let live = accessor.live_counts()?;

                if owner == SPACE_ID_EMPTY {
                    if recorded == full && live == full {
                        empty.push(index);
                    } else {
                        error!(
                            "Empty block {} is not free (recorded {:?}, bitmap {:?}); setting it aside",
                            index, recorded, live
                        );
                        accessor.set_table(SPACE_ID_SET_ASIDE)?;
                        set_aside += 1;
                    }
                    continue;
                }

                max_id = max_id.max(owner);
                if recorded != live {
                    error!(
                        "Block {} of space {}: recorded counters {:?} differ from bitmap {:?}",
                        index, owner, recorded, live
                    );
                }
            }
        }

        for &index in &empty {
            self.free_blocks.insert(index);
        }

        info!(
            "Space directory scanned: {} block(s), {} empty, {} set aside",
            self.block_index_limit,
            empty.len(),
            set_aside
        );
        Ok(max_id)
    }

    /// Point an idle space's cursor at the free tail of one of its blocks
    ///
    /// The block the space last used is preferred; otherwise the block with
    /// the longest free tail (the later block on a tie).
    pub(super) fn resume_space(&mut self, space_id: i32) -> Result<()> {
        let geometry = self.geometry;
        let manager = self.manager(space_id)?;
        if !manager.cursor().is_empty() {
            return Ok(());
        }
        let last = manager.file_block_index();

        let mut candidate: Option<(u32, u32)> = None;
        {
            let mut accessor = self.accessor(false);

            if let Some(index) = last {
                if accessor.move_to_block(index)? && accessor.space_id()? == space_id {
                    let (_, trailing) = accessor.recorded_counts()?;
                    if trailing > 0 {
                        candidate = Some((index, trailing));
                    }
                }
            }

            if candidate.is_none() {
                while accessor.next_block_for_table(space_id)? {
                    let (_, trailing) = accessor.recorded_counts()?;
                    let better = candidate.map_or(true, |(_, best)| trailing >= best);
                    if trailing > 0 && better {
                        if let Some(index) = accessor.current_block() {
                            candidate = Some((index, trailing));
                        }
                    }
                }
            }
        }

        if let Some((index, trailing)) = candidate {
            let trailing = trailing.min(geometry.units_per_block);
            let end = geometry.block_position(index + 1);
            let start = end - trailing as u64 * geometry.unit_size;
            self.manager_mut(space_id)?
                .initialise_file_block(None, start, end);
            debug!(
                "Space {} resumed in block {} at {} ({} units free)",
                space_id, index, start, trailing
            );
        }
        Ok(())
    }

    /// Flush every space's pending ranges and drop all cursors
    pub(super) fn reset_locked(&mut self) -> Result<()> {
        let mut ids: Vec<i32> = self.spaces.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            self.flush_table_space_locked(id, true)?;
            self.manager_mut(id)?.reset();
        }

        debug!("All table space cursors detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::allocator::{SPACE_ID_DEFAULT, SPACE_ID_DIRECTORY, SPACE_ID_EMPTY, SPACE_ID_SET_ASIDE};
    use crate::config::SpaceConfig;
    use crate::error::SpaceError;
    use crate::DataSpaceManager;
    use tempfile::TempDir;

    const BLOCK: u64 = 64 * 1024;

    fn config() -> SpaceConfig {
        SpaceConfig::default()
            .with_file_block_size(BLOCK as u32)
            .with_unit_size(64)
    }

    #[test]
    fn test_reopen_resumes_cursors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bsp");

        let table;
        let position;
        {
            let spaces = DataSpaceManager::create(&path, &config()).unwrap();
            table = spaces.get_new_table_space_id();
            position = spaces.get_file_position(table, 640).unwrap();
            spaces.close().unwrap();
        }

        let spaces = DataSpaceManager::open(&path, &config()).unwrap();
        assert_eq!(spaces.block_index_limit(), 3);
        assert!(spaces.free_block_indices().is_empty());

        let default = spaces.table_space(SPACE_ID_DEFAULT).unwrap();
        assert_eq!(default.cursor, 4096..BLOCK);

        let resumed = spaces.get_table_space(table).unwrap();
        assert_eq!(resumed.cursor, position + 640..position - position % BLOCK + BLOCK);
        assert_eq!(spaces.get_file_position(table, 64).unwrap(), position + 640);

        // Ids keep increasing past the highest owner
        assert_eq!(spaces.get_new_table_space_id(), table + 2);
    }

    #[test]
    fn test_ids_above_highest_owner_skip_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bsp");
        {
            let spaces = DataSpaceManager::create(&path, &config()).unwrap();
            assert_eq!(spaces.state.lock().unowned_from, Some(4));
            spaces.get_file_position(7, 640).unwrap();
            spaces.close().unwrap();
        }

        let spaces = DataSpaceManager::open(&path, &config()).unwrap();
        assert_eq!(spaces.state.lock().unowned_from, Some(8));

        // Below the floor the directory is searched; at or above it the
        // space starts without a block
        assert!(!spaces.get_table_space(7).unwrap().cursor.is_empty());
        let fresh = spaces.get_new_table_space_id();
        assert_eq!(fresh, 8);
        let snapshot = spaces.get_table_space(fresh).unwrap();
        assert!(snapshot.cursor.is_empty());
        assert_eq!(snapshot.file_block_index, None);
    }

    #[test]
    fn test_directory_cursor_resumes_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bsp");
        DataSpaceManager::create(&path, &config())
            .unwrap()
            .close()
            .unwrap();

        let spaces = DataSpaceManager::open(&path, &config()).unwrap();
        let directory = spaces.table_space(SPACE_ID_DIRECTORY).unwrap();
        assert!(!directory.cursor.is_empty());
        assert_eq!(directory.cursor.end, 2 * BLOCK);

        let table = spaces.get_new_table_space_id();
        spaces.get_file_blocks(table, 1).unwrap();
        assert_eq!(spaces.stats().unwrap().directory_blocks, 1);
    }

    #[test]
    fn test_unreadable_header_anchor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bsp");
        {
            let spaces = DataSpaceManager::create(&path, &config()).unwrap();
            let mut state = spaces.state.lock();
            state.header.space_manager_position = 0;
            state.flush_locked().unwrap();
        }

        assert!(matches!(
            DataSpaceManager::open(&path, &config()),
            Err(SpaceError::UnreadableDirectory(_))
        ));
    }

    #[test]
    fn test_dirty_empty_block_is_set_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bsp");
        let index;
        {
            let spaces = DataSpaceManager::create(&path, &config()).unwrap();
            let table = spaces.get_new_table_space_id();
            index = (spaces.get_file_position(table, 640).unwrap() / BLOCK) as u32;

            // Relabel the block empty while its units are still in use
            let mut state = spaces.state.lock();
            {
                let mut accessor = state.accessor(true);
                assert!(accessor.move_to_block(index).unwrap());
                accessor.set_table(SPACE_ID_EMPTY).unwrap();
                accessor.set_range(0, 10).unwrap();
            }
            state.flush_locked().unwrap();
        }

        let spaces = DataSpaceManager::open(&path, &config()).unwrap();
        assert!(spaces.free_block_indices().is_empty());
        let entry = spaces.block_entry(index).unwrap().unwrap();
        assert_eq!(entry.space_id, SPACE_ID_SET_ASIDE);
        assert_eq!(entry.free_units, 1024);

        let directory_free = spaces.block_entry(1).unwrap().unwrap().free_units as u64;
        assert_eq!(
            spaces.get_lost_blocks_size().unwrap(),
            (960 + directory_free) * 64 + BLOCK
        );
    }

    #[test]
    fn test_read_only_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bsp");
        {
            let spaces = DataSpaceManager::create(&path, &config()).unwrap();
            let table = spaces.get_new_table_space_id();
            spaces.get_file_position(table, 640).unwrap();
            spaces.close().unwrap();
        }

        let spaces = DataSpaceManager::open(&path, &config().with_read_only(true)).unwrap();
        assert!(spaces.is_read_only());
        assert!(matches!(
            spaces.get_file_position(4, 64),
            Err(SpaceError::ReadOnly)
        ));
        assert!(matches!(spaces.reset(), Err(SpaceError::ReadOnly)));
        assert!(spaces.table_space(SPACE_ID_DEFAULT).unwrap().cursor.is_empty());
        assert_eq!(spaces.block_entry(2).unwrap().unwrap().free_units, 1014);
        assert!(spaces.check_directory_bitmaps().unwrap().is_empty());
        spaces.close().unwrap();
    }

    #[test]
    fn test_reset_and_initialise_spaces() {
        let dir = TempDir::new().unwrap();
        let spaces = DataSpaceManager::create(dir.path().join("data.bsp"), &config()).unwrap();
        let table = spaces.get_new_table_space_id();
        let position = spaces.get_file_position(table, 640).unwrap();
        spaces.release(table, position, 64).unwrap();

        spaces.reset().unwrap();
        let snapshot = spaces.table_space(table).unwrap();
        assert!(snapshot.cursor.is_empty());
        assert_eq!(snapshot.pending_ranges, 0);
        assert_eq!(snapshot.file_block_index, Some(2));
        assert_eq!(spaces.block_entry(2).unwrap().unwrap().free_units, 1015);

        spaces.initialise_spaces().unwrap();
        let snapshot = spaces.table_space(table).unwrap();
        assert_eq!(snapshot.cursor, position + 640..3 * BLOCK);
    }
}
