//! Set of globally empty file blocks
//!
//! Rebuilt from the directory on open and kept in sync as blocks are
//! relabelled empty or handed to a space.

use std::collections::BTreeSet;

/// Sorted index of file blocks owned by the empty marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeBlockSet {
    blocks: BTreeSet<u32>,
}

impl FreeBlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the block was already present
    pub fn insert(&mut self, index: u32) -> bool {
        self.blocks.insert(index)
    }

    pub fn remove(&mut self, index: u32) -> bool {
        self.blocks.remove(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.blocks.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().copied()
    }

    /// Remove the lowest run of `count` consecutive blocks
    ///
    /// Returns the first index of the run, or `None` when no run is long
    /// enough (the set is left untouched).
    pub fn remove_first_consecutive(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }

        let mut run_start = None;
        let mut run_len = 0;
        let mut previous = None;

        for &index in &self.blocks {
            if previous.map_or(false, |p: u32| p + 1 == index) {
                run_len += 1;
            } else {
                run_start = Some(index);
                run_len = 1;
            }
            previous = Some(index);

            if run_len == count {
                break;
            }
        }

        if run_len < count {
            return None;
        }

        let start = run_start?;
        for index in start..start + count {
            self.blocks.remove(&index);
        }

        Some(start)
    }
}
