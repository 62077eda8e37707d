//! Cursor over the space directory
//!
//! A [`BlockAccessor`] pins one directory block and, in update mode, the
//! bitmap of the current file block. Every mutation of bitmaps and directory
//! entries goes through it. When the accessor moves away from a block (or is
//! dropped) the block's free and trailing-free counters are recomputed from
//! the live bitmap and written into the directory entry, so the cached
//! counters are always in sync once the accessor has detached.
//!
//! A block whose units were released during the pin and which ends up fully
//! free is relabelled empty and added to the [`FreeBlockSet`].

use crate::allocator::directory::DirectoryBlock;
use crate::allocator::free_blocks::FreeBlockSet;
use crate::allocator::{BlockGeometry, SPACE_ID_DIRECTORY, SPACE_ID_EMPTY, SPACE_ID_SET_ASIDE};
use crate::error::{Result, SpaceError};
use crate::store::BlockCache;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct PinnedBlock {
    index: u32,
    slot: usize,
    bitmap_position: u64,
    bitmap_pinned: bool,
}

/// Directory cursor; see the module documentation
pub struct BlockAccessor<'a> {
    cache: &'a mut BlockCache,
    free_blocks: &'a mut FreeBlockSet,
    geometry: BlockGeometry,
    root_position: u64,
    block_limit: u32,
    for_update: bool,

    /// Pinned directory block: (directory index, byte position)
    directory: Option<(u32, u64)>,
    block: Option<PinnedBlock>,
    scan_next: u32,

    /// Units were released into the current block
    released: bool,
    released_blocks: Vec<u32>,
}

impl<'a> BlockAccessor<'a> {
    /// Create a detached accessor over blocks `0..block_limit`
    ///
    /// `for_update` arms mutation for the whole traversal.
    pub fn new(
        cache: &'a mut BlockCache,
        free_blocks: &'a mut FreeBlockSet,
        geometry: BlockGeometry,
        root_position: u64,
        block_limit: u32,
        for_update: bool,
    ) -> Self {
        BlockAccessor {
            cache,
            free_blocks,
            geometry,
            root_position,
            block_limit,
            for_update,
            directory: None,
            block: None,
            scan_next: 0,
            released: false,
            released_blocks: Vec::new(),
        }
    }

    /// Index of the pinned block
    pub fn current_block(&self) -> Option<u32> {
        self.block.map(|b| b.index)
    }

    /// Byte position of the pinned block's bitmap
    pub fn bitmap_position(&self) -> Option<u64> {
        self.block.map(|b| b.bitmap_position)
    }

    fn directory_block(&self) -> Result<(&DirectoryBlock, usize)> {
        let block = self.block.ok_or(SpaceError::AccessorNotPinned("directory read"))?;
        let (_, position) = self
            .directory
            .ok_or(SpaceError::AccessorNotPinned("directory read"))?;

        let dir = self.cache.directories.record(position).ok_or_else(|| {
            SpaceError::UnreadableDirectory(format!("directory at {} is not pinned", position))
        })?;

        Ok((dir, block.slot))
    }

    fn pinned_for_update(&self, operation: &'static str) -> Result<PinnedBlock> {
        match self.block {
            Some(block) if block.bitmap_pinned => Ok(block),
            _ => Err(SpaceError::AccessorNotPinned(operation)),
        }
    }

    /// Pin the block at `index`
    ///
    /// Returns false when the block is not provisioned (no directory block or
    /// no bitmap recorded for it). Directory blocks are never created here.
    pub fn move_to_block(&mut self, index: u32) -> Result<bool> {
        if self.current_block() == Some(index) {
            return Ok(true);
        }

        self.end_block_update();

        if index as u64 >= self.geometry.max_blocks() {
            return Ok(false);
        }

        let directory_index = index / self.geometry.directory_capacity;
        let directory_position = match self.directory {
            Some((pinned, position)) if pinned == directory_index => position,
            _ => {
                self.release_directory();

                let root = self.cache.roots.record(self.root_position).ok_or_else(|| {
                    SpaceError::UnreadableDirectory("root directory is not loaded".into())
                })?;
                let address = root.position_of(directory_index as usize);
                if address == 0 {
                    return Ok(false);
                }

                let position = self.geometry.unscaled(address);
                let cache = &mut *self.cache;
                cache.directories.fetch(&mut cache.file, position, true)?;
                self.directory = Some((directory_index, position));
                position
            }
        };

        let slot = (index % self.geometry.directory_capacity) as usize;
        let address = match self.cache.directories.record(directory_position) {
            Some(dir) => dir.bitmap_address(slot),
            None => 0,
        };
        if address == 0 {
            return Ok(false);
        }

        let bitmap_position = self.geometry.unscaled(address);
        if self.for_update {
            let cache = &mut *self.cache;
            cache.bitmaps.fetch(&mut cache.file, bitmap_position, true)?;
        }

        self.block = Some(PinnedBlock {
            index,
            slot,
            bitmap_position,
            bitmap_pinned: self.for_update,
        });
        self.released = false;

        Ok(true)
    }

    /// Advance to the next provisioned block
    pub fn next_block(&mut self) -> Result<bool> {
        while self.scan_next < self.block_limit {
            let index = self.scan_next;
            self.scan_next += 1;

            if self.move_to_block(index)? {
                return Ok(true);
            }
        }

        self.end_block_update();
        Ok(false)
    }

    /// Advance to the next provisioned block owned by `space_id`
    pub fn next_block_for_table(&mut self, space_id: i32) -> Result<bool> {
        while self.next_block()? {
            if self.space_id()? == space_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Owner of the pinned block
    pub fn space_id(&self) -> Result<i32> {
        let (dir, slot) = self.directory_block()?;
        Ok(dir.space_id(slot))
    }

    /// Free and trailing-free counters recorded in the directory
    pub fn recorded_counts(&self) -> Result<(u32, u32)> {
        let (dir, slot) = self.directory_block()?;
        Ok((dir.free_units(slot), dir.trailing_free_units(slot)))
    }

    /// Free and trailing-free counts of the live bitmap
    pub fn live_counts(&mut self) -> Result<(u32, u32)> {
        let block = self.block.ok_or(SpaceError::AccessorNotPinned("live_counts"))?;
        let cache = &mut *self.cache;
        let bitmap = cache.bitmaps.get(&mut cache.file, block.bitmap_position)?;
        Ok((bitmap.count_free(), bitmap.count_trailing_free()))
    }

    /// Check if a unit of the pinned block is in use
    pub fn is_unit_used(&mut self, unit: u32) -> Result<bool> {
        let block = self.block.ok_or(SpaceError::AccessorNotPinned("is_unit_used"))?;
        let cache = &mut *self.cache;
        let bitmap = cache.bitmaps.get(&mut cache.file, block.bitmap_position)?;
        Ok(bitmap.is_set(unit))
    }

    /// Mark units of the pinned block used, returning how many changed
    pub fn set_range(&mut self, offset: u32, count: u32) -> Result<u32> {
        let block = self.pinned_for_update("set_range")?;
        let bitmap = self
            .cache
            .bitmaps
            .record_mut(block.bitmap_position)
            .ok_or(SpaceError::AccessorNotPinned("set_range"))?;

        Ok(bitmap.set_range(offset, count))
    }

    /// Mark units of the pinned block free, returning how many changed
    pub fn unset_range(&mut self, offset: u32, count: u32) -> Result<u32> {
        let block = self.pinned_for_update("unset_range")?;
        let bitmap = self
            .cache
            .bitmaps
            .record_mut(block.bitmap_position)
            .ok_or(SpaceError::AccessorNotPinned("unset_range"))?;

        let changed = bitmap.unset_range(offset, count);
        if changed > 0 {
            self.released = true;
        }
        Ok(changed)
    }

    /// Hand the pinned block to `space_id`, starting from a fully free bitmap
    pub fn set_table(&mut self, space_id: i32) -> Result<()> {
        let block = self.pinned_for_update("set_table")?;
        let (_, directory_position) = self
            .directory
            .ok_or(SpaceError::AccessorNotPinned("set_table"))?;
        let units = self.geometry.units_per_block;

        if let Some(bitmap) = self.cache.bitmaps.record_mut(block.bitmap_position) {
            bitmap.reset();
        }

        let dir = self
            .cache
            .directories
            .record_mut(directory_position)
            .ok_or(SpaceError::AccessorNotPinned("set_table"))?;
        dir.set_space_id(block.slot, space_id);
        dir.set_free_units(block.slot, units);
        dir.set_trailing_free_units(block.slot, units);

        self.released = false;
        Ok(())
    }

    /// Treat the pinned block as released into, so it is relabelled empty on
    /// detach if it is fully free
    pub fn mark_released(&mut self) -> Result<()> {
        self.pinned_for_update("mark_released")?;
        self.released = true;
        Ok(())
    }

    /// Blocks relabelled empty so far
    pub fn take_released_blocks(&mut self) -> Vec<u32> {
        self.end_block_update();
        std::mem::take(&mut self.released_blocks)
    }

    /// Write the pinned block's counters back and unpin its bitmap
    fn end_block_update(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };
        let released = std::mem::take(&mut self.released);

        if !block.bitmap_pinned {
            return;
        }

        let counts = self
            .cache
            .bitmaps
            .record(block.bitmap_position)
            .map(|b| (b.count_free(), b.count_trailing_free()));

        if let (Some((free, trailing)), Some((_, directory_position))) = (counts, self.directory) {
            let units = self.geometry.units_per_block;
            let current = self
                .cache
                .directories
                .record(directory_position)
                .map(|d| {
                    (
                        d.space_id(block.slot),
                        d.free_units(block.slot),
                        d.trailing_free_units(block.slot),
                    )
                });

            if let Some((owner, recorded_free, recorded_trailing)) = current {
                let relabel = released
                    && free == units
                    && owner != SPACE_ID_EMPTY
                    && owner != SPACE_ID_SET_ASIDE
                    && owner != SPACE_ID_DIRECTORY;

                if relabel || recorded_free != free || recorded_trailing != trailing {
                    if let Some(dir) = self.cache.directories.record_mut(directory_position) {
                        dir.set_free_units(block.slot, free);
                        dir.set_trailing_free_units(block.slot, trailing);
                        if relabel {
                            dir.set_space_id(block.slot, SPACE_ID_EMPTY);
                        }
                    }
                }

                if relabel {
                    debug!("Block {} of space {} is empty", block.index, owner);
                    self.free_blocks.insert(block.index);
                    self.released_blocks.push(block.index);
                }
            }
        }

        self.cache.bitmaps.keep_in_memory(block.bitmap_position, false);
    }

    fn release_directory(&mut self) {
        if let Some((_, position)) = self.directory.take() {
            self.cache.directories.keep_in_memory(position, false);
        }
    }

    /// Detach and rewind to the first block
    pub fn reset(&mut self) {
        self.end_block_update();
        self.release_directory();
        self.scan_next = 0;
    }
}

impl Drop for BlockAccessor<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}
