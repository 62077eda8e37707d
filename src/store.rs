//! Cached keyed record store
//!
//! Directory metadata (root directory, directory blocks, bitmaps) lives in
//! fixed-format records addressed by their byte position in the data file.
//! A [`RecordStore`] keeps decoded records in memory: pinned records are never
//! evicted, unpinned ones sit in an LRU and are written back when evicted
//! dirty. Unpinning never performs I/O, so it is safe from `Drop`.

use crate::allocator::bitmap::BitMap;
use crate::allocator::directory::{DirectoryBlock, RootDirectory};
use crate::allocator::BlockGeometry;
use crate::error::{Result, SpaceError};
use crate::io::DataFile;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// A fixed-format binary record stored at a file position
pub trait Record: Sized {
    /// Serialize to the on-disk representation
    fn encode(&self) -> Vec<u8>;

    /// Deserialize from the on-disk representation
    fn decode(bytes: &[u8]) -> Result<Self>;
}

#[derive(Debug)]
struct Entry<T> {
    record: T,
    pins: u32,
    changed: bool,
}

/// Cache of one record type
pub struct RecordStore<T: Record> {
    /// Encoded size of every record in this store
    record_size: usize,
    pinned: HashMap<u64, Entry<T>>,
    unpinned: LruCache<u64, Entry<T>>,
    /// Dirty records evicted from the LRU, written on the next flush or miss
    write_back: Vec<(u64, Vec<u8>)>,
}

impl<T: Record> RecordStore<T> {
    pub fn new(record_size: usize, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        RecordStore {
            record_size,
            pinned: HashMap::new(),
            unpinned: LruCache::new(capacity),
            write_back: Vec::new(),
        }
    }

    /// Encoded record size in bytes
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn contains(&self, pos: u64) -> bool {
        self.pinned.contains_key(&pos) || self.unpinned.contains(&pos)
    }

    pub fn is_pinned(&self, pos: u64) -> bool {
        self.pinned.contains_key(&pos)
    }

    /// Number of cached records (pinned and unpinned)
    pub fn len(&self) -> usize {
        self.pinned.len() + self.unpinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of evicted records waiting to be written
    pub fn pending_writes(&self) -> usize {
        self.write_back.len()
    }

    fn park(&mut self, pos: u64, entry: Entry<T>) {
        if let Some((evicted_pos, evicted)) = self.unpinned.push(pos, entry) {
            if evicted_pos != pos && evicted.changed {
                self.write_back.push((evicted_pos, evicted.record.encode()));
            }
        }
    }

    fn insert(&mut self, pos: u64, entry: Entry<T>) {
        if entry.pins > 0 {
            self.pinned.insert(pos, entry);
        } else {
            self.park(pos, entry);
        }
    }

    fn drain_write_back(&mut self, file: &mut DataFile) -> Result<()> {
        for (pos, bytes) in self.write_back.drain(..) {
            file.write_at(pos, &bytes)?;
        }
        Ok(())
    }

    /// Load the record at `pos` into the cache, pinning it when `pin` is set
    pub fn fetch(&mut self, file: &mut DataFile, pos: u64, pin: bool) -> Result<()> {
        if let Some(entry) = self.pinned.get_mut(&pos) {
            if pin {
                entry.pins += 1;
            }
            return Ok(());
        }

        if pin {
            if let Some(mut entry) = self.unpinned.pop(&pos) {
                entry.pins = 1;
                self.pinned.insert(pos, entry);
                return Ok(());
            }
        } else if self.unpinned.get(&pos).is_some() {
            return Ok(());
        }

        // Miss: an evicted dirty copy may still be queued for this position
        self.drain_write_back(file)?;

        let bytes = file.read_at(pos, self.record_size)?;
        let record = T::decode(&bytes)?;

        self.insert(
            pos,
            Entry {
                record,
                pins: pin as u32,
                changed: false,
            },
        );

        Ok(())
    }

    /// Add a new record at `pos`; it is written on the next flush
    pub fn add(&mut self, pos: u64, record: T, pin: bool) {
        self.pinned.remove(&pos);
        self.unpinned.pop(&pos);
        self.write_back.retain(|(p, _)| *p != pos);

        self.insert(
            pos,
            Entry {
                record,
                pins: pin as u32,
                changed: true,
            },
        );
    }

    /// Pin or unpin a cached record
    ///
    /// Returns false when the record is not cached.
    pub fn keep_in_memory(&mut self, pos: u64, keep: bool) -> bool {
        if keep {
            if let Some(entry) = self.pinned.get_mut(&pos) {
                entry.pins += 1;
                return true;
            }
            return match self.unpinned.pop(&pos) {
                Some(mut entry) => {
                    entry.pins = 1;
                    self.pinned.insert(pos, entry);
                    true
                }
                None => false,
            };
        }

        let Some(entry) = self.pinned.get_mut(&pos) else {
            return self.unpinned.contains(&pos);
        };

        entry.pins = entry.pins.saturating_sub(1);
        if entry.pins == 0 {
            if let Some(entry) = self.pinned.remove(&pos) {
                self.park(pos, entry);
            }
        }

        true
    }

    /// Set or clear the dirty flag of a cached record
    pub fn set_changed(&mut self, pos: u64, changed: bool) {
        if let Some(entry) = self.pinned.get_mut(&pos) {
            entry.changed = changed;
        } else if let Some(entry) = self.unpinned.peek_mut(&pos) {
            entry.changed = changed;
        }
    }

    pub fn is_changed(&self, pos: u64) -> bool {
        self.pinned
            .get(&pos)
            .or_else(|| self.unpinned.peek(&pos))
            .map_or(false, |e| e.changed)
    }

    /// Cached record, without loading
    pub fn record(&self, pos: u64) -> Option<&T> {
        self.pinned
            .get(&pos)
            .or_else(|| self.unpinned.peek(&pos))
            .map(|e| &e.record)
    }

    /// Cached record for mutation, marking it changed
    pub fn record_mut(&mut self, pos: u64) -> Option<&mut T> {
        if let Some(entry) = self.pinned.get_mut(&pos) {
            entry.changed = true;
            return Some(&mut entry.record);
        }

        let entry = self.unpinned.peek_mut(&pos)?;
        entry.changed = true;
        Some(&mut entry.record)
    }

    /// Record at `pos`, loading it if needed
    pub fn get(&mut self, file: &mut DataFile, pos: u64) -> Result<&T> {
        self.fetch(file, pos, false)?;
        self.record(pos)
            .ok_or_else(|| SpaceError::UnreadableDirectory(format!("record at {} not cached", pos)))
    }

    /// Record at `pos` for mutation, loading it if needed
    pub fn get_mut(&mut self, file: &mut DataFile, pos: u64) -> Result<&mut T> {
        self.fetch(file, pos, false)?;
        self.record_mut(pos)
            .ok_or_else(|| SpaceError::UnreadableDirectory(format!("record at {} not cached", pos)))
    }

    /// Write every dirty record to the file
    pub fn flush(&mut self, file: &mut DataFile) -> Result<()> {
        self.drain_write_back(file)?;

        for (pos, entry) in self.pinned.iter_mut() {
            if entry.changed {
                file.write_at(*pos, &entry.record.encode())?;
                entry.changed = false;
            }
        }

        for (pos, entry) in self.unpinned.iter_mut() {
            if entry.changed {
                file.write_at(*pos, &entry.record.encode())?;
                entry.changed = false;
            }
        }

        Ok(())
    }

    /// Drop unpinned records and queued writes inside `start..end`
    ///
    /// Returns the number of records discarded.
    pub fn release_range(&mut self, start: u64, end: u64) -> usize {
        let doomed: Vec<u64> = self
            .unpinned
            .iter()
            .map(|(pos, _)| *pos)
            .filter(|pos| (start..end).contains(pos))
            .collect();

        for pos in &doomed {
            self.unpinned.pop(pos);
        }

        let queued = self.write_back.len();
        self.write_back.retain(|(pos, _)| !(start..end).contains(pos));

        doomed.len() + (queued - self.write_back.len())
    }
}

/// The data file together with the three directory record stores
pub struct BlockCache {
    pub(crate) file: DataFile,
    pub(crate) roots: RecordStore<RootDirectory>,
    pub(crate) directories: RecordStore<DirectoryBlock>,
    pub(crate) bitmaps: RecordStore<BitMap>,
}

impl BlockCache {
    pub fn new(file: DataFile, geometry: &BlockGeometry, capacity: usize) -> Self {
        BlockCache {
            file,
            // Only one root exists; it stays pinned for the life of the cache
            roots: RecordStore::new(geometry.root_record_size(), 1),
            directories: RecordStore::new(geometry.directory_record_size(), capacity),
            bitmaps: RecordStore::new(geometry.bitmap_record_size(), capacity),
        }
    }

    /// Write all dirty records
    pub fn flush(&mut self) -> Result<()> {
        self.roots.flush(&mut self.file)?;
        self.directories.flush(&mut self.file)?;
        self.bitmaps.flush(&mut self.file)?;
        Ok(())
    }

    /// Drop cached records inside a released byte range
    pub fn release_range(&mut self, start: u64, end: u64) -> usize {
        self.roots.release_range(start, end)
            + self.directories.release_range(start, end)
            + self.bitmaps.release_range(start, end)
    }
}
