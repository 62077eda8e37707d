//! Free-range list for released sub-block space
//!
//! Released ranges are held in a B-tree keyed by start unit, coalescing
//! neighbours on insert, and handed back out best-fit. The list is bounded:
//! once it reaches capacity the owner flushes it into the block bitmaps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous range of allocation units, in file-wide unit numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Starting unit (byte position / unit size)
    pub start: u64,
    /// Number of contiguous units
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains a unit
    pub fn contains(&self, unit: u64) -> bool {
        unit >= self.start && unit < self.end()
    }

    /// Check if this extent overlaps or touches another
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.start <= other.end() && other.start <= self.end()
    }

    /// Merge two touching or overlapping extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Some(Extent::new(start, end - start))
    }
}

/// Bounded, coalescing list of free unit ranges
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreeSpaceList {
    /// Free extents indexed by start unit
    ranges: BTreeMap<u64, Extent>,

    /// Maximum number of distinct ranges held before a flush
    capacity: usize,

    /// Sum of all range lengths
    total_units: u64,
}

impl FreeSpaceList {
    pub fn new(capacity: usize) -> Self {
        FreeSpaceList {
            ranges: BTreeMap::new(),
            capacity,
            total_units: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ranges.len() >= self.capacity
    }

    /// Ranges that can still be added before the list is full
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.ranges.len())
    }

    /// True when an unforced flush should be postponed
    ///
    /// A flush goes ahead once at most a quarter of the capacity remains.
    pub fn should_defer(&self) -> bool {
        self.available() > self.capacity / 4
    }

    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.ranges.values()
    }

    /// Check if a unit lies in a free range
    pub fn contains(&self, unit: u64) -> bool {
        self.ranges
            .range(..=unit)
            .next_back()
            .map_or(false, |(_, e)| e.contains(unit))
    }

    /// Insert a range, merging it with every range it touches
    ///
    /// Returns the number of units that were already present, which is
    /// non-zero only for a repeated release.
    pub fn insert(&mut self, extent: Extent) -> u64 {
        if extent.length == 0 {
            return 0;
        }

        let mut merged = extent;
        let mut absorbed = 0;
        let mut overlap = 0;

        let touching: Vec<u64> = self
            .ranges
            .range(..=extent.end())
            .rev()
            .take_while(|(_, e)| e.end() >= extent.start)
            .map(|(&start, _)| start)
            .collect();

        for start in touching {
            if let Some(existing) = self.ranges.remove(&start) {
                let lo = existing.start.max(extent.start);
                let hi = existing.end().min(extent.end());
                overlap += hi.saturating_sub(lo);
                absorbed += existing.length;

                if let Some(m) = merged.coalesce(&existing) {
                    merged = m;
                }
            }
        }

        self.total_units = self.total_units - absorbed + merged.length;
        self.ranges.insert(merged.start, merged);

        overlap
    }

    /// Remove and return the start of a `units`-long range
    ///
    /// Uses best fit: the smallest range that can hold the request, with the
    /// remainder put back.
    pub fn take_best_fit(&mut self, units: u64) -> Option<u64> {
        let (&key, &extent) = self
            .ranges
            .iter()
            .filter(|(_, e)| e.length >= units)
            .min_by_key(|(_, e)| e.length)?;

        self.ranges.remove(&key);
        if extent.length > units {
            let rest = Extent::new(extent.start + units, extent.length - units);
            self.ranges.insert(rest.start, rest);
        }
        self.total_units -= units;

        Some(extent.start)
    }

    /// Remove every range, in ascending order
    pub fn drain(&mut self) -> Vec<Extent> {
        self.total_units = 0;
        std::mem::take(&mut self.ranges).into_values().collect()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.total_units = 0;
    }
}
