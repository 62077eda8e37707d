//! Allocation-unit bitmap for one file block
//!
//! Each bit represents one allocation unit of the block:
//! - 0 = free unit
//! - 1 = unit in use
//!
//! Bits are stored in 32-bit words, most significant bit first, and persisted
//! big-endian so the on-disk array is a flat bit string in unit order.

use crate::error::{Result, SpaceError};
use crate::store::Record;

/// Free/used state of the allocation units inside one file block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMap {
    /// Bitmap words (each word = 32 units)
    words: Vec<u32>,

    /// Number of units tracked
    units: u32,
}

/// Mask covering bits `from..to` of a word, counted from the most significant bit
fn word_mask(from: u32, to: u32) -> u32 {
    let head = u32::MAX >> from;
    let tail = if to >= 32 { 0 } else { u32::MAX >> to };
    head & !tail
}

impl BitMap {
    /// Create a bitmap with every unit free
    pub fn new(units: u32) -> Self {
        BitMap {
            words: vec![0u32; ((units + 31) / 32) as usize],
            units,
        }
    }

    /// Number of units tracked
    pub fn units(&self) -> u32 {
        self.units
    }

    /// Size of the persisted bit array in bytes
    pub fn storage_size(units: u32) -> usize {
        ((units + 31) / 32 * 4) as usize
    }

    /// Apply `op` to each word slice covering `offset..offset + count`
    ///
    /// Returns the sum of the per-word results. The range is clamped to the
    /// bitmap.
    fn apply_range(&mut self, offset: u32, count: u32, mut op: impl FnMut(&mut u32, u32) -> u32) -> u32 {
        let end = offset.saturating_add(count).min(self.units);
        let mut unit = offset;
        let mut changed = 0;

        while unit < end {
            let word_idx = (unit / 32) as usize;
            let from = unit % 32;
            let to = (end - (unit - from)).min(32);

            changed += op(&mut self.words[word_idx], word_mask(from, to));
            unit += to - from;
        }

        changed
    }

    /// Mark units as used
    ///
    /// Returns the number of units that actually changed state. A result
    /// smaller than `count` means part of the range was already in use.
    pub fn set_range(&mut self, offset: u32, count: u32) -> u32 {
        self.apply_range(offset, count, |word, mask| {
            let changed = (mask & !*word).count_ones();
            *word |= mask;
            changed
        })
    }

    /// Mark units as free
    ///
    /// Returns the number of units that actually changed state. A result
    /// smaller than `count` means part of the range was already free.
    pub fn unset_range(&mut self, offset: u32, count: u32) -> u32 {
        self.apply_range(offset, count, |word, mask| {
            let changed = (mask & *word).count_ones();
            *word &= !mask;
            changed
        })
    }

    /// Check if a specific unit is in use
    pub fn is_set(&self, unit: u32) -> bool {
        if unit >= self.units {
            return false;
        }

        let word = self.words[(unit / 32) as usize];
        word & (0x8000_0000u32 >> (unit % 32)) != 0
    }

    /// Number of units in use
    pub fn count_used(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Number of free units
    pub fn count_free(&self) -> u32 {
        self.units - self.count_used()
    }

    /// Number of contiguous free units at the end of the block
    pub fn count_trailing_free(&self) -> u32 {
        let mut free = 0;

        for &word in self.words.iter().rev() {
            if word == 0 {
                free += 32;
                continue;
            }
            free += word.trailing_zeros();
            break;
        }

        free.min(self.units)
    }

    /// Mark the whole block free
    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

impl Record for BitMap {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for word in &self.words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(SpaceError::InvalidRecordSize {
                expected: (bytes.len() + 3) / 4 * 4,
                actual: bytes.len(),
            });
        }

        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect::<Vec<_>>();
        let units = (words.len() * 32) as u32;

        Ok(BitMap { words, units })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_creation() {
        let bitmap = BitMap::new(1024);
        assert_eq!(bitmap.units(), 1024);
        assert_eq!(bitmap.count_free(), 1024);
        assert_eq!(bitmap.count_trailing_free(), 1024);
    }

    #[test]
    fn test_set_range_reports_changed_units() {
        let mut bitmap = BitMap::new(1024);

        assert_eq!(bitmap.set_range(0, 10), 10);
        assert_eq!(bitmap.count_free(), 1014);
        assert_eq!(bitmap.count_trailing_free(), 1014);

        // Overlapping request only changes the new units
        assert_eq!(bitmap.set_range(5, 10), 5);
        assert_eq!(bitmap.count_free(), 1009);
    }

    #[test]
    fn test_unset_range_reports_changed_units() {
        let mut bitmap = BitMap::new(1024);
        bitmap.set_range(0, 100);

        assert_eq!(bitmap.unset_range(90, 20), 10);
        assert_eq!(bitmap.count_free(), 934);
        assert_eq!(bitmap.unset_range(90, 20), 0);
    }

    #[test]
    fn test_range_crossing_words() {
        let mut bitmap = BitMap::new(128);

        assert_eq!(bitmap.set_range(30, 40), 40);
        for unit in 0..128 {
            assert_eq!(bitmap.is_set(unit), (30..70).contains(&unit), "unit {}", unit);
        }
        assert_eq!(bitmap.count_trailing_free(), 58);
    }

    #[test]
    fn test_trailing_free_with_hole() {
        let mut bitmap = BitMap::new(96);
        bitmap.set_range(0, 96);
        bitmap.unset_range(10, 20);
        assert_eq!(bitmap.count_trailing_free(), 0);

        bitmap.unset_range(80, 16);
        assert_eq!(bitmap.count_trailing_free(), 16);
        assert_eq!(bitmap.count_free(), 36);
    }

    #[test]
    fn test_range_is_clamped() {
        let mut bitmap = BitMap::new(64);
        assert_eq!(bitmap.set_range(60, 10), 4);
        assert_eq!(bitmap.count_free(), 60);
        assert_eq!(bitmap.set_range(100, 10), 0);
    }

    #[test]
    fn test_reset() {
        let mut bitmap = BitMap::new(256);
        bitmap.set_range(0, 256);
        assert_eq!(bitmap.count_free(), 0);
        assert_eq!(bitmap.count_trailing_free(), 0);

        bitmap.reset();
        assert_eq!(bitmap.count_free(), 256);
    }

    #[test]
    fn test_unit_order_on_disk() {
        let mut bitmap = BitMap::new(64);
        bitmap.set_range(0, 1);
        bitmap.set_range(63, 1);

        let bytes = bitmap.encode();
        assert_eq!(bytes.len(), BitMap::storage_size(64));
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[7], 0x01);

        let decoded = BitMap::decode(&bytes).unwrap();
        assert_eq!(decoded, bitmap);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(matches!(
            BitMap::decode(&[0u8; 7]),
            Err(SpaceError::InvalidRecordSize { .. })
        ));
    }
}
