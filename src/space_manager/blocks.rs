//! File bootstrap, directory growth and block assignment

use super::SpaceState;
use crate::allocator::bitmap::BitMap;
use crate::allocator::directory::{DirectoryBlock, RootDirectory};
use crate::allocator::{SPACE_ID_DEFAULT, SPACE_ID_DIRECTORY, SPACE_ID_FIRST};
use crate::config::SpaceConfig;
use crate::error::{Result, SpaceError};
use crate::header::Header;
use crate::io::DataFile;
use crate::store::BlockCache;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, error, info};

impl SpaceState {
    /// Create a data file and lay out its first blocks
    pub(super) fn create(path: &Path, config: &SpaceConfig) -> Result<Self> {
        config.validate_geometry()?;

        let header = Header::new(config);
        let file = DataFile::create(path, &header)?;
        let geometry = crate::allocator::BlockGeometry::from_config(config);
        let cache = BlockCache::new(file, &geometry, config.cache_capacity);

        let mut state = SpaceState::new(cache, header, &config.clone().with_read_only(false));
        state.register_reserved_spaces();
        state.bootstrap()?;
        state.unowned_from = Some(SPACE_ID_FIRST);

        Ok(state)
    }

    /// Lay out a fresh file
    ///
    /// The bytes already written (the header) become the used prefix of the
    /// default space's first block. The directory space follows, sized to
    /// hold the root, one bitmap per block and the directory blocks for every
    /// block created here, itself included.
    fn bootstrap(&mut self) -> Result<()> {
        let geometry = self.geometry;
        let used = self.cache.file.file_free_pos();

        let data_blocks = geometry.blocks_for(used).max(1);
        let directory_blocks = geometry.initial_directory_blocks(data_blocks);
        let total = data_blocks + directory_blocks;
        self.check_block_capacity(total as u64)?;
        self.extend_file_to(total)?;

        let directory_start = geometry.block_position(data_blocks);
        self.manager_mut(SPACE_ID_DIRECTORY)?
            .initialise_file_block(None, directory_start, geometry.block_position(total));

        let root_position = self.take_directory_space(geometry.aligned(geometry.root_record_size()))?;
        self.cache
            .roots
            .add(root_position, RootDirectory::new(geometry.root_capacity), true);
        self.root_position = root_position;

        self.register_blocks(0, data_blocks, SPACE_ID_DEFAULT)?;
        self.register_blocks(data_blocks, directory_blocks, SPACE_ID_DIRECTORY)?;

        let records_end = self.manager(SPACE_ID_DIRECTORY)?.cursor().start;
        self.mark_range_used(0, used)?;
        self.mark_range_used(directory_start, records_end)?;

        self.manager_mut(SPACE_ID_DEFAULT)?
            .initialise_file_block(None, used, directory_start);

        self.header.space_manager_position = geometry.scaled(root_position)?;
        self.flush_locked()?;

        info!(
            "Created space directory: {} data block(s), {} directory block(s), root at {}",
            data_blocks, directory_blocks, root_position
        );
        Ok(())
    }

    pub(super) fn check_block_capacity(&self, block_count: u64) -> Result<()> {
        let limit = self.geometry.max_blocks();
        if block_count > limit {
            error!("Space directory cannot address {} blocks", block_count);
            return Err(SpaceError::DirectoryFull { limit });
        }
        Ok(())
    }

    /// Grow the file so that blocks `0..block_count` exist
    fn extend_file_to(&mut self, block_count: u32) -> Result<()> {
        let target = self.geometry.block_position(block_count);
        let current = self.cache.file.file_free_pos();
        if target > current {
            self.cache.file.enlarge_file_space(target - current)?;
            debug!("Data file extended to {} bytes", target);
        }
        Ok(())
    }

    /// Carve a record out of the directory space cursor
    ///
    /// The range is not marked used here; callers mark the whole run of
    /// records once the blocks holding them are registered.
    fn take_directory_space(&mut self, bytes: u64) -> Result<u64> {
        self.manager_mut(SPACE_ID_DIRECTORY)?
            .take_from_cursor(bytes)
            .ok_or(SpaceError::DirectorySpaceExhausted { needed: bytes })
    }

    pub(super) fn root(&self) -> Result<&RootDirectory> {
        self.cache
            .roots
            .record(self.root_position)
            .ok_or_else(|| SpaceError::UnreadableDirectory("root directory is not loaded".into()))
    }

    /// Create directory entries (and directory blocks as needed) for blocks
    /// `first..first + count`, owned by `owner`
    fn register_blocks(&mut self, first: u32, count: u32, owner: i32) -> Result<()> {
        let geometry = self.geometry;
        let capacity = geometry.directory_capacity;

        for index in first..first + count {
            let directory_index = (index / capacity) as usize;
            let slot = (index % capacity) as usize;

            if directory_index >= self.root()?.capacity() {
                return Err(SpaceError::DirectoryFull {
                    limit: geometry.max_blocks(),
                });
            }

            let mut address = self.root()?.position_of(directory_index);
            if address == 0 {
                let position =
                    self.take_directory_space(geometry.aligned(geometry.directory_record_size()))?;
                self.cache
                    .directories
                    .add(position, DirectoryBlock::new(capacity), false);

                address = geometry.scaled(position)?;
                if let Some(root) = self.cache.roots.record_mut(self.root_position) {
                    root.set_position_of(directory_index, address);
                }
                debug!("Directory block {} created at {}", directory_index, position);
            }

            let bitmap_position =
                self.take_directory_space(geometry.aligned(geometry.bitmap_record_size()))?;
            self.cache
                .bitmaps
                .add(bitmap_position, BitMap::new(geometry.units_per_block), false);

            let cache = &mut self.cache;
            let dir = cache
                .directories
                .get_mut(&mut cache.file, geometry.unscaled(address))?;
            dir.set_space_id(slot, owner);
            dir.set_free_units(slot, geometry.units_per_block);
            dir.set_trailing_free_units(slot, geometry.units_per_block);
            dir.set_bitmap_address(slot, geometry.scaled(bitmap_position)?);

            self.block_index_limit = self.block_index_limit.max(index + 1);
        }

        Ok(())
    }

    /// Make sure the directory space can record `count` more blocks
    ///
    /// When it cannot, new directory-space blocks are appended and registered
    /// first, so blocks are never created before there is room to describe
    /// them.
    pub(super) fn ensure_directory_space(&mut self, count: u32) -> Result<()> {
        let geometry = self.geometry;
        let limit = self.block_index_limit;
        self.check_block_capacity(limit as u64 + count as u64)?;

        let (room, cursor_end) = {
            let directory = self.manager(SPACE_ID_DIRECTORY)?;
            (directory.cursor_room(), directory.cursor().end)
        };
        if room >= geometry.record_bytes_for(limit, count) {
            return Ok(());
        }

        // Room left in the current directory block only helps if the new
        // blocks continue it
        let carried = if cursor_end == geometry.block_position(limit) {
            room
        } else {
            0
        };

        let mut extra = 1;
        while extra as u64 * geometry.file_block_size + carried
            < geometry.record_bytes_for(limit, extra + count)
        {
            extra += 1;
        }
        self.check_block_capacity(limit as u64 + extra as u64 + count as u64)?;

        self.extend_file_to(limit + extra)?;
        let records = self.register_new_blocks(limit, extra, SPACE_ID_DIRECTORY)?;
        self.mark_range_used(records.start, records.end)?;

        info!(
            "Directory space grown by {} block(s) at block {}",
            extra, limit
        );
        Ok(())
    }

    /// Attach blocks `first..first + count` to the directory cursor when they
    /// belong to the directory space, then register them
    ///
    /// Returns the directory-space byte range used for their records.
    fn register_new_blocks(&mut self, first: u32, count: u32, owner: i32) -> Result<Range<u64>> {
        let geometry = self.geometry;

        if owner == SPACE_ID_DIRECTORY {
            let directory = self.manager_mut(SPACE_ID_DIRECTORY)?;
            // An abandoned directory tail stays reserved for the directory
            directory.add_file_block(
                geometry.block_position(first),
                geometry.block_position(first + count),
            );
        }

        let before = self.manager(SPACE_ID_DIRECTORY)?.cursor().start;
        self.register_blocks(first, count, owner)?;
        let after = self.manager(SPACE_ID_DIRECTORY)?.cursor().start;

        Ok(before..after)
    }

    /// Mark a byte range used in the bitmaps, block by block
    ///
    /// Units that were already in use are logged as a consistency fault.
    pub(super) fn mark_range_used(&mut self, start: u64, end: u64) -> Result<()> {
        let geometry = self.geometry;
        let mut accessor = self.accessor(true);
        let mut position = start;

        while position < end {
            let index = geometry.block_index(position);
            let block_end = geometry.block_position(index + 1).min(end);
            let offset = geometry.unit_in_block(position);
            let count = ((block_end - position + geometry.unit_size - 1) / geometry.unit_size) as u32;

            if !accessor.move_to_block(index)? {
                error!("Cannot mark units used in unprovisioned block {}", index);
                return Err(SpaceError::InvalidBlockIndex(index));
            }

            let changed = accessor.set_range(offset, count)?;
            if changed != count {
                error!(
                    "Block {}: {} of {} units at offset {} were already in use",
                    index,
                    count - changed,
                    count,
                    offset
                );
            }

            position = block_end;
        }

        Ok(())
    }

    /// Claim `count` consecutive blocks for `space_id`
    ///
    /// With `mark_used` the blocks are handed out fully used; otherwise their
    /// bitmaps start fully free for a cursor to consume.
    pub(super) fn get_file_blocks_locked(
        &mut self,
        space_id: i32,
        count: u32,
        mark_used: bool,
    ) -> Result<u64> {
        if count == 0 {
            return Err(SpaceError::InvalidConfig("block count must be positive".into()));
        }
        if space_id == SPACE_ID_DIRECTORY {
            return Err(SpaceError::InvalidSpaceId(space_id));
        }

        let geometry = self.geometry;

        if let Some(start) = self.free_blocks.remove_first_consecutive(count) {
            let mut accessor = self.accessor(true);
            for index in start..start + count {
                if !accessor.move_to_block(index)? {
                    return Err(SpaceError::InvalidBlockIndex(index));
                }
                accessor.set_table(space_id)?;
                if mark_used {
                    accessor.set_range(0, geometry.units_per_block)?;
                }
            }
            drop(accessor);

            info!(
                "Reusing empty block(s) {}..{} for space {}",
                start,
                start + count,
                space_id
            );
            return Ok(geometry.block_position(start));
        }

        self.ensure_directory_space(count)?;

        let start = self.block_index_limit;
        self.extend_file_to(start + count)?;
        let records = self.register_new_blocks(start, count, space_id)?;
        self.mark_range_used(records.start, records.end)?;

        if mark_used {
            self.mark_range_used(
                geometry.block_position(start),
                geometry.block_position(start + count),
            )?;
        }

        info!(
            "Created block(s) {}..{} for space {}",
            start,
            start + count,
            space_id
        );
        Ok(geometry.block_position(start))
    }

    /// Allocate `size` bytes for a registered space
    pub(super) fn get_file_position_locked(&mut self, space_id: i32, size: u64) -> Result<u64> {
        let geometry = self.geometry;
        let units = geometry.units_for(size);
        let bytes = units * geometry.unit_size;

        if let Some(position) = self.manager_mut(space_id)?.take_free_range(units) {
            return Ok(position);
        }

        if self.manager(space_id)?.cursor_room() < bytes {
            let blocks = geometry.blocks_for(bytes);
            let start = self.get_file_blocks_locked(space_id, blocks, false)?;
            let end = start + blocks as u64 * geometry.file_block_size;

            if let Some(tail) = self.manager_mut(space_id)?.add_file_block(start, end) {
                let emptied = self.release_free_blocks_in(space_id, tail)?;
                if !emptied.is_empty() {
                    debug!("Space {} abandoned empty block(s) {:?}", space_id, emptied);
                }
            }
        }

        let position = self
            .manager_mut(space_id)?
            .take_from_cursor(bytes)
            .ok_or(SpaceError::CursorExhausted { space_id, bytes })?;
        self.mark_range_used(position, position + bytes)?;

        Ok(position)
    }
}
