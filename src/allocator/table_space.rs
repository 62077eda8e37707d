//! Per-space sub-block allocator
//!
//! A [`TableSpaceManager`] hands out byte positions inside the blocks owned
//! by one space. It keeps a cursor over the unconsumed tail of its current
//! block(s) and a bounded list of ranges released by the space. It never
//! touches the directory itself: new blocks are obtained through
//! [`DataSpaceManager`](crate::DataSpaceManager), and released ranges are
//! written back by the facade when the list is flushed.

use crate::allocator::extent::{Extent, FreeSpaceList};
use crate::allocator::BlockGeometry;
use std::ops::Range;

/// In-memory allocation state of one space
#[derive(Debug, Clone)]
pub struct TableSpaceManager {
    space_id: i32,
    file_block_size: u64,
    unit_size: u64,
    free_list: FreeSpaceList,

    /// Next free byte of the cursor
    fresh_free_pos: u64,

    /// End of the cursor (exclusive)
    fresh_limit: u64,

    /// Last block attached to the cursor
    file_block_index: Option<u32>,
}

impl TableSpaceManager {
    pub fn new(space_id: i32, geometry: &BlockGeometry, free_ranges: usize) -> Self {
        TableSpaceManager {
            space_id,
            file_block_size: geometry.file_block_size,
            unit_size: geometry.unit_size,
            free_list: FreeSpaceList::new(free_ranges),
            fresh_free_pos: 0,
            fresh_limit: 0,
            file_block_index: None,
        }
    }

    pub fn space_id(&self) -> i32 {
        self.space_id
    }

    /// Last block the cursor was attached to
    pub fn file_block_index(&self) -> Option<u32> {
        self.file_block_index
    }

    pub fn clear_file_block_index(&mut self) {
        self.file_block_index = None;
    }

    /// Seed the cursor with `start..end` of a block this space already owns,
    /// taking over any ranges from `free_list`
    pub fn initialise_file_block(&mut self, free_list: Option<&FreeSpaceList>, start: u64, end: u64) {
        self.fresh_free_pos = start;
        self.fresh_limit = end;
        if end > start {
            self.file_block_index = Some(((end - 1) / self.file_block_size) as u32);
        }

        if let Some(list) = free_list {
            for extent in list.iter() {
                self.free_list.insert(*extent);
            }
        }
    }

    /// Check if `bytes` can be served without new blocks
    pub fn has_file_room(&self, bytes: u64) -> bool {
        let units = self.units(bytes);
        self.cursor_room() >= bytes || self.free_list.iter().any(|e| e.length >= units)
    }

    /// Bytes left in the cursor
    pub fn cursor_room(&self) -> u64 {
        self.fresh_limit - self.fresh_free_pos
    }

    /// Attach newly obtained blocks `start..end` to the cursor
    ///
    /// Blocks that continue the cursor extend it. Otherwise the cursor moves
    /// to the new blocks and the old unconsumed tail is returned.
    pub fn add_file_block(&mut self, start: u64, end: u64) -> Option<Range<u64>> {
        let abandoned = if start == self.fresh_limit {
            self.fresh_limit = end;
            None
        } else {
            let tail = self.fresh_free_pos..self.fresh_limit;
            self.fresh_free_pos = start;
            self.fresh_limit = end;
            Some(tail).filter(|t| !t.is_empty())
        };

        self.file_block_index = Some(((end - 1) / self.file_block_size) as u32);
        abandoned
    }

    /// Take a released range of `units`, returning its byte position
    pub fn take_free_range(&mut self, units: u64) -> Option<u64> {
        self.free_list
            .take_best_fit(units)
            .map(|unit| unit * self.unit_size)
    }

    /// Take `bytes` from the cursor, returning the byte position
    pub fn take_from_cursor(&mut self, bytes: u64) -> Option<u64> {
        if self.cursor_room() < bytes {
            return None;
        }

        let position = self.fresh_free_pos;
        self.fresh_free_pos += bytes;
        Some(position)
    }

    /// Return a range to the free list
    ///
    /// Returns the number of units that were already in the list.
    pub fn release(&mut self, position: u64, bytes: u64) -> u64 {
        let extent = Extent::new(position / self.unit_size, self.units(bytes));
        self.free_list.insert(extent)
    }

    pub fn free_list_full(&self) -> bool {
        self.free_list.is_full()
    }

    pub fn free_list(&self) -> &FreeSpaceList {
        &self.free_list
    }

    /// Swap out the free list, leaving an empty one of the same capacity
    pub fn take_free_list(&mut self) -> FreeSpaceList {
        let capacity = self.free_list.capacity();
        std::mem::replace(&mut self.free_list, FreeSpaceList::new(capacity))
    }

    /// Put back a list taken with [`take_free_list`](Self::take_free_list)
    ///
    /// Ranges released in the meantime are merged into it.
    pub fn restore_free_list(&mut self, mut list: FreeSpaceList) {
        for extent in self.free_list.drain() {
            list.insert(extent);
        }
        self.free_list = list;
    }

    /// Unconsumed cursor range
    pub fn cursor(&self) -> Range<u64> {
        self.fresh_free_pos..self.fresh_limit
    }

    pub fn clear_cursor(&mut self) {
        self.fresh_free_pos = 0;
        self.fresh_limit = 0;
    }

    /// Drop the cursor and the free list
    ///
    /// The directory is not touched; the last block index is kept so the
    /// space can be resumed.
    pub fn reset(&mut self) {
        self.free_list.clear();
        self.clear_cursor();
    }

    fn units(&self, bytes: u64) -> u64 {
        ((bytes + self.unit_size - 1) / self.unit_size).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceConfig;

    const BLOCK: u64 = 64 * 1024;

    fn manager(free_ranges: usize) -> TableSpaceManager {
        let geometry = BlockGeometry::from_config(
            &SpaceConfig::default()
                .with_file_block_size(BLOCK as u32)
                .with_unit_size(64),
        );
        TableSpaceManager::new(4, &geometry, free_ranges)
    }

    #[test]
    fn test_cursor_allocation() {
        let mut mgr = manager(8);
        assert!(!mgr.has_file_room(64));
        assert_eq!(mgr.file_block_index(), None);

        assert_eq!(mgr.add_file_block(2 * BLOCK, 3 * BLOCK), None);
        assert_eq!(mgr.file_block_index(), Some(2));
        assert!(mgr.has_file_room(BLOCK));
        assert!(!mgr.has_file_room(BLOCK + 1));

        assert_eq!(mgr.take_from_cursor(640), Some(2 * BLOCK));
        assert_eq!(mgr.take_from_cursor(64), Some(2 * BLOCK + 640));
        assert_eq!(mgr.cursor(), 2 * BLOCK + 704..3 * BLOCK);
        assert_eq!(mgr.take_from_cursor(BLOCK), None);
    }

    #[test]
    fn test_contiguous_block_extends_cursor() {
        let mut mgr = manager(8);
        mgr.add_file_block(2 * BLOCK, 3 * BLOCK);
        mgr.take_from_cursor(BLOCK - 64);

        assert_eq!(mgr.add_file_block(3 * BLOCK, 4 * BLOCK), None);
        assert_eq!(mgr.cursor(), 3 * BLOCK - 64..4 * BLOCK);
        assert_eq!(mgr.file_block_index(), Some(3));
    }

    #[test]
    fn test_non_contiguous_block_abandons_tail() {
        let mut mgr = manager(8);
        mgr.add_file_block(2 * BLOCK, 3 * BLOCK);
        mgr.take_from_cursor(1024);

        let abandoned = mgr.add_file_block(7 * BLOCK, 8 * BLOCK);
        assert_eq!(abandoned, Some(2 * BLOCK + 1024..3 * BLOCK));
        assert_eq!(mgr.cursor(), 7 * BLOCK..8 * BLOCK);
    }

    #[test]
    fn test_released_ranges_are_reused_first() {
        let mut mgr = manager(8);
        mgr.add_file_block(2 * BLOCK, 3 * BLOCK);
        let a = mgr.take_from_cursor(640).unwrap();
        let _b = mgr.take_from_cursor(640).unwrap();

        assert_eq!(mgr.release(a, 640), 0);
        assert_eq!(mgr.free_list().total_units(), 10);
        assert!(mgr.has_file_room(640));

        assert_eq!(mgr.take_free_range(10), Some(a));
        assert!(mgr.free_list().is_empty());
    }

    #[test]
    fn test_repeated_release_is_reported() {
        let mut mgr = manager(8);
        assert_eq!(mgr.release(2 * BLOCK, 640), 0);
        assert_eq!(mgr.release(2 * BLOCK, 640), 10);
    }

    #[test]
    fn test_initialise_file_block_merges_list() {
        let mut mgr = manager(8);
        let mut list = FreeSpaceList::new(8);
        list.insert(Extent::new(3 * BLOCK / 64, 4));

        mgr.initialise_file_block(Some(&list), 3 * BLOCK + 4096, 4 * BLOCK);
        assert_eq!(mgr.file_block_index(), Some(3));
        assert_eq!(mgr.cursor_room(), BLOCK - 4096);
        assert_eq!(mgr.free_list().total_units(), 4);
    }

    #[test]
    fn test_take_and_restore_free_list() {
        let mut mgr = manager(8);
        mgr.release(2 * BLOCK, 64);

        let taken = mgr.take_free_list();
        assert_eq!(taken.total_units(), 1);
        assert!(mgr.free_list().is_empty());

        mgr.release(2 * BLOCK + 640, 64);
        mgr.restore_free_list(taken);
        assert_eq!(mgr.free_list().total_units(), 2);
        assert_eq!(mgr.free_list().capacity(), 8);
    }

    #[test]
    fn test_reset_keeps_block_index() {
        let mut mgr = manager(8);
        mgr.add_file_block(5 * BLOCK, 6 * BLOCK);
        mgr.release(5 * BLOCK, 64);

        mgr.reset();
        assert!(mgr.cursor().is_empty());
        assert!(mgr.free_list().is_empty());
        assert_eq!(mgr.file_block_index(), Some(5));
    }
}
