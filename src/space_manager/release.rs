//! Releasing ranges and dropping spaces

use super::SpaceState;
use crate::allocator::extent::{Extent, FreeSpaceList};
use crate::allocator::SPACE_ID_EMPTY;
use crate::error::Result;
use std::ops::Range;
use tracing::{debug, error, info};

impl SpaceState {
    /// Queue a released range on the space's free-range list
    ///
    /// A full list is written to the bitmaps first. Spaces without a list
    /// write every release through immediately.
    pub(super) fn release_locked(&mut self, space_id: i32, position: u64, size: u64) -> Result<()> {
        let geometry = self.geometry;
        let bytes = geometry.units_for(size) * geometry.unit_size;

        if !self.owns_range(space_id, position, bytes)? {
            return Ok(());
        }

        if self.manager(space_id)?.free_list().capacity() == 0 {
            let mut ranges = FreeSpaceList::new(1);
            ranges.insert(Extent::new(position / geometry.unit_size, bytes / geometry.unit_size));
            self.free_table_space_ranges_locked(space_id, &mut ranges, 0..0, true)?;
            return Ok(());
        }

        if self.manager(space_id)?.free_list_full() {
            self.flush_table_space_locked(space_id, true)?;
        }

        let repeated = self.manager_mut(space_id)?.release(position, bytes);
        if repeated > 0 {
            error!(
                "Space {}: {} units at {} were released twice",
                space_id, repeated, position
            );
        }
        Ok(())
    }

    /// True when every block under `position..position + bytes` is
    /// provisioned and owned by the space; anything else is logged
    fn owns_range(&mut self, space_id: i32, position: u64, bytes: u64) -> Result<bool> {
        let geometry = self.geometry;
        let limit = self.block_index_limit as u64;
        let first = position / geometry.file_block_size;
        let last = position.saturating_add(bytes - 1) / geometry.file_block_size;

        if last >= limit {
            error!(
                "Space {}: released range at {} lies beyond block {}",
                space_id, position, limit
            );
            return Ok(false);
        }

        let mut accessor = self.accessor(false);
        for index in first as u32..=last as u32 {
            if !accessor.move_to_block(index)? {
                error!(
                    "Space {}: released range at {} is in unprovisioned block {}",
                    space_id, position, index
                );
                return Ok(false);
            }

            let owner = accessor.space_id()?;
            if owner != space_id {
                error!(
                    "Space {}: released range at {} is in block {} owned by space {}",
                    space_id, position, index, owner
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write the space's own free-range list to the bitmaps
    pub(super) fn flush_table_space_locked(&mut self, space_id: i32, full: bool) -> Result<bool> {
        let mut ranges = self.manager_mut(space_id)?.take_free_list();
        let result = self.free_table_space_ranges_locked(space_id, &mut ranges, 0..0, full);
        self.manager_mut(space_id)?.restore_free_list(ranges);
        result
    }

    /// Clear the bitmap units of a batch of released ranges
    ///
    /// Ranges in blocks that are not provisioned or not owned by the space
    /// are logged and skipped. Blocks left fully free become empty; when one
    /// of them is under the space's cursor the cursor is retired.
    pub(super) fn free_table_space_ranges_locked(
        &mut self,
        space_id: i32,
        ranges: &mut FreeSpaceList,
        tail: Range<u64>,
        full: bool,
    ) -> Result<bool> {
        if ranges.is_empty() && tail.is_empty() {
            return Ok(false);
        }
        if !full && tail.is_empty() && ranges.should_defer() {
            return Ok(false);
        }

        let geometry = self.geometry;
        let unit_size = geometry.unit_size;
        let units_per_block = geometry.units_per_block as u64;
        let limit = self.block_index_limit as u64;

        let mut emptied = {
            let mut accessor = self.accessor(true);

            for extent in ranges.drain() {
                let mut unit = extent.start;
                let end = extent.end();

                while unit < end {
                    let block = unit / units_per_block;
                    if block >= limit {
                        error!(
                            "Space {}: released range at {} lies beyond block {}",
                            space_id,
                            unit * unit_size,
                            limit
                        );
                        break;
                    }

                    let index = block as u32;
                    let stop = ((block + 1) * units_per_block).min(end);
                    let offset = (unit % units_per_block) as u32;
                    let count = (stop - unit) as u32;
                    let position = unit * unit_size;
                    unit = stop;

                    if !accessor.move_to_block(index)? {
                        error!(
                            "Space {}: released range at {} is in unprovisioned block {}",
                            space_id, position, index
                        );
                        continue;
                    }

                    let owner = accessor.space_id()?;
                    if owner != space_id {
                        error!(
                            "Space {}: released range at {} is in block {} owned by space {}",
                            space_id, position, index, owner
                        );
                        continue;
                    }

                    let changed = accessor.unset_range(offset, count)?;
                    if changed != count {
                        error!(
                            "Space {}: {} of {} released units at {} were already free; keeping the range used",
                            space_id,
                            count - changed,
                            count,
                            position
                        );
                        accessor.set_range(offset, count)?;
                    }
                }
            }

            accessor.take_released_blocks()
        };

        if !tail.is_empty() {
            emptied.extend(self.release_free_blocks_in(space_id, tail)?);
        }

        if !emptied.is_empty() {
            debug!("Space {} emptied block(s) {:?}", space_id, emptied);

            let cursor = self.manager(space_id)?.cursor();
            let under_cursor = !cursor.is_empty()
                && emptied.iter().any(|&index| {
                    geometry.block_position(index) < cursor.end
                        && geometry.block_position(index + 1) > cursor.start
                });
            if under_cursor {
                self.retire_cursor(space_id)?;
            }
        }

        Ok(true)
    }

    /// Relabel empty every block in `range` that the space owns and that is
    /// fully free, returning their indices
    pub(super) fn release_free_blocks_in(&mut self, space_id: i32, range: Range<u64>) -> Result<Vec<u32>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let geometry = self.geometry;
        let limit = self.block_index_limit as u64;
        let first = range.start / geometry.file_block_size;
        let last = ((range.end - 1) / geometry.file_block_size).min(limit.saturating_sub(1));
        if first > last {
            return Ok(Vec::new());
        }

        let mut accessor = self.accessor(true);
        for index in first as u32..=last as u32 {
            if !accessor.move_to_block(index)? || accessor.space_id()? != space_id {
                continue;
            }

            let (free, _) = accessor.live_counts()?;
            if free == geometry.units_per_block {
                accessor.mark_released()?;
            }
        }

        Ok(accessor.take_released_blocks())
    }

    /// Detach the space's cursor, emptying any fully free block it covered
    fn retire_cursor(&mut self, space_id: i32) -> Result<()> {
        let manager = self.manager_mut(space_id)?;
        let cursor = manager.cursor();
        manager.clear_cursor();

        let emptied = self.release_free_blocks_in(space_id, cursor)?;
        debug!(
            "Space {} cursor retired ({} more block(s) emptied)",
            space_id,
            emptied.len()
        );
        Ok(())
    }

    /// Relabel every block of a space empty and forget its allocation state
    pub(super) fn free_table_space_locked(&mut self, space_id: i32) -> Result<usize> {
        if let Some(manager) = self.spaces.get_mut(&space_id) {
            manager.reset();
            manager.clear_file_block_index();
        }

        let mut emptied = Vec::new();
        {
            let mut accessor = self.accessor(true);
            while accessor.next_block_for_table(space_id)? {
                accessor.set_table(SPACE_ID_EMPTY)?;
                if let Some(index) = accessor.current_block() {
                    emptied.push(index);
                }
            }
        }

        let geometry = self.geometry;
        for &index in &emptied {
            self.free_blocks.insert(index);
            self.cache.release_range(
                geometry.block_position(index),
                geometry.block_position(index + 1),
            );
        }

        if emptied.is_empty() {
            debug!("Space {} owns no blocks", space_id);
        } else {
            info!("Freed space {}: {} block(s) emptied", space_id, emptied.len());
        }
        Ok(emptied.len())
    }
}
