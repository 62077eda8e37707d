//! Data space manager
//!
//! [`DataSpaceManager`] owns the root directory, the table space managers,
//! the set of empty blocks and the data file. Every operation that touches the
//! directory runs under one lock for its whole body; nested work (directory
//! growth while creating blocks) is done by `SpaceState` methods that take
//! the already-locked state, so the lock is never re-acquired.
//!
//! The implementation is split by concern:
//! - [`blocks`]: file bootstrap, directory growth, block creation and reuse
//! - [`release`]: range release, free-range flushing, dropping a space
//! - [`recovery`]: reopening, rebuilding in-memory state, resuming cursors
//! - [`check`]: consistency checkers, repair and statistics

mod blocks;
mod check;
mod recovery;
mod release;

pub use check::{BitmapMismatch, BlockEntry, SpaceMismatch, SpaceStats};

use crate::allocator::extent::FreeSpaceList;
use crate::allocator::free_blocks::FreeBlockSet;
use crate::allocator::table_space::TableSpaceManager;
use crate::allocator::accessor::BlockAccessor;
use crate::allocator::{
    is_space_id, next_space_id_above, BlockGeometry, DIRECTORY_FREE_RANGES, SPACE_ID_DEFAULT,
    SPACE_ID_DIRECTORY, SPACE_ID_EMPTY, SPACE_ID_FIRST,
};
use crate::config::SpaceConfig;
use crate::error::{Result, SpaceError};
use crate::header::Header;
use crate::store::BlockCache;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, info};

/// Point-in-time view of one table space manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpaceSnapshot {
    pub space_id: i32,
    /// Unconsumed cursor byte range (empty when no block is attached)
    pub cursor: Range<u64>,
    /// Last block attached to the cursor
    pub file_block_index: Option<u32>,
    /// Released ranges waiting to be written to the bitmaps
    pub pending_ranges: usize,
    pub pending_units: u64,
}

impl TableSpaceSnapshot {
    fn of(manager: &TableSpaceManager) -> Self {
        TableSpaceSnapshot {
            space_id: manager.space_id(),
            cursor: manager.cursor(),
            file_block_index: manager.file_block_index(),
            pending_ranges: manager.free_list().len(),
            pending_units: manager.free_list().total_units(),
        }
    }
}

/// Everything guarded by the manager lock
pub(crate) struct SpaceState {
    cache: BlockCache,
    header: Header,
    geometry: BlockGeometry,
    max_free_ranges: usize,
    read_only: bool,
    free_blocks: FreeBlockSet,
    spaces: AHashMap<i32, TableSpaceManager>,
    /// One past the highest provisioned block index
    block_index_limit: u32,
    root_position: u64,
    /// Ids at or above this own no blocks on disk; `None` until a scan or
    /// bootstrap has established it
    unowned_from: Option<i32>,
}

impl SpaceState {
    fn new(cache: BlockCache, header: Header, config: &SpaceConfig) -> Self {
        let geometry = BlockGeometry::from_config(&header.geometry());

        SpaceState {
            cache,
            root_position: header.root_position(),
            header,
            geometry,
            max_free_ranges: config.max_free_ranges,
            read_only: config.read_only,
            free_blocks: FreeBlockSet::new(),
            spaces: AHashMap::new(),
            block_index_limit: 0,
            unowned_from: None,
        }
    }

    fn accessor(&mut self, for_update: bool) -> BlockAccessor<'_> {
        BlockAccessor::new(
            &mut self.cache,
            &mut self.free_blocks,
            self.geometry,
            self.root_position,
            self.block_index_limit,
            for_update,
        )
    }

    fn register_reserved_spaces(&mut self) {
        let geometry = self.geometry;
        for id in [SPACE_ID_DIRECTORY, SPACE_ID_DEFAULT] {
            let capacity = if id == SPACE_ID_DIRECTORY {
                DIRECTORY_FREE_RANGES
            } else {
                self.max_free_ranges
            };
            self.spaces
                .entry(id)
                .or_insert_with(|| TableSpaceManager::new(id, &geometry, capacity));
        }
    }

    fn manager(&self, space_id: i32) -> Result<&TableSpaceManager> {
        self.spaces
            .get(&space_id)
            .ok_or(SpaceError::InvalidSpaceId(space_id))
    }

    fn manager_mut(&mut self, space_id: i32) -> Result<&mut TableSpaceManager> {
        self.spaces
            .get_mut(&space_id)
            .ok_or(SpaceError::InvalidSpaceId(space_id))
    }

    /// Register a manager for `space_id` if none exists yet, resuming it on
    /// the block it last used
    fn ensure_manager(&mut self, space_id: i32) -> Result<()> {
        if self.spaces.contains_key(&space_id) {
            return Ok(());
        }

        let capacity = if space_id == SPACE_ID_DIRECTORY {
            DIRECTORY_FREE_RANGES
        } else {
            self.max_free_ranges
        };
        self.spaces.insert(
            space_id,
            TableSpaceManager::new(space_id, &self.geometry, capacity),
        );
        debug!("Registered table space {}", space_id);

        let unowned = self.unowned_from.map_or(false, |floor| space_id >= floor);
        if !self.read_only && self.block_index_limit > 0 && !unowned {
            self.resume_space(space_id)?;
        }
        Ok(())
    }

    fn flush_locked(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        self.cache.flush()?;
        self.header.file_free_pos = self.cache.file.file_free_pos();
        self.cache.file.write_header(&self.header)?;
        self.cache.file.sync()
    }
}

/// Block space allocator over one data file
///
/// Partitions the file into fixed-size blocks, assigns blocks to spaces and
/// hands out unit-aligned byte ranges inside them. All directory state is
/// persisted in the file and rebuilt on [`open`](Self::open).
///
/// # Examples
///
/// ```rust,no_run
/// use blockspace::{DataSpaceManager, SpaceConfig};
///
/// # fn main() -> blockspace::Result<()> {
/// let config = SpaceConfig::default()
///     .with_file_block_size(64 * 1024)
///     .with_unit_size(64);
/// let spaces = DataSpaceManager::create("data.bsp", &config)?;
///
/// let table = spaces.get_new_table_space_id();
/// let position = spaces.get_file_position(table, 640)?;
/// spaces.release(table, position, 640)?;
///
/// spaces.close()?;
/// # Ok(())
/// # }
/// ```
pub struct DataSpaceManager {
    state: Mutex<SpaceState>,
    sequence: AtomicI32,
    geometry: BlockGeometry,
    read_only: bool,
}

impl DataSpaceManager {
    fn from_state(state: SpaceState, next_id: i32) -> Self {
        DataSpaceManager {
            geometry: state.geometry,
            read_only: state.read_only,
            state: Mutex::new(state),
            sequence: AtomicI32::new(next_id.max(SPACE_ID_FIRST)),
        }
    }

    /// Create a new data file and its space directory
    ///
    /// The file is laid out with one default-space block (holding the file
    /// header) followed by the directory space.
    pub fn create<P: AsRef<Path>>(path: P, config: &SpaceConfig) -> Result<Self> {
        info!("Creating block space file at {:?}", path.as_ref());
        let state = SpaceState::create(path.as_ref(), config)?;
        Ok(Self::from_state(state, SPACE_ID_FIRST))
    }

    /// Open an existing data file
    ///
    /// Fails with [`SpaceError::UnreadableDirectory`] when the root
    /// directory cannot be used. Unless opened read-only, the empty-block set
    /// and the space id counter are rebuilt from the directory.
    pub fn open<P: AsRef<Path>>(path: P, config: &SpaceConfig) -> Result<Self> {
        info!("Opening block space file at {:?}", path.as_ref());
        let mut state = SpaceState::open(path.as_ref(), config)?;
        let max_id = state.initialise_spaces_locked()?;

        let next_id = max_id.map_or(SPACE_ID_FIRST, next_space_id_above);
        Ok(Self::from_state(state, next_id))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(SpaceError::ReadOnly);
        }
        Ok(())
    }

    /// Validate an id used to request or release space
    fn check_space_id(&self, space_id: i32) -> Result<()> {
        if space_id < SPACE_ID_DEFAULT {
            return Err(SpaceError::InvalidSpaceId(space_id));
        }
        self.sequence
            .fetch_max(next_space_id_above(space_id), Ordering::SeqCst);
        Ok(())
    }

    /// Allocate `size` bytes (rounded up to whole units) for a space
    ///
    /// Released ranges of the space are reused first, then its current
    /// block; new blocks are obtained only when both are exhausted.
    pub fn get_file_position(&self, space_id: i32, size: u64) -> Result<u64> {
        self.check_writable()?;
        self.check_space_id(space_id)?;

        let mut state = self.state.lock();
        state.ensure_manager(space_id)?;
        state.get_file_position_locked(space_id, size)
    }

    /// Return a range previously obtained from
    /// [`get_file_position`](Self::get_file_position)
    ///
    /// The range is kept in the space's free-range list and written to the
    /// bitmaps when the list fills up.
    pub fn release(&self, space_id: i32, position: u64, size: u64) -> Result<()> {
        self.check_writable()?;
        self.check_space_id(space_id)?;

        let mut state = self.state.lock();
        state.ensure_manager(space_id)?;
        state.release_locked(space_id, position, size)
    }

    /// Claim `block_count` consecutive whole blocks for a space
    ///
    /// Empty blocks are reused when a long enough run exists; otherwise the
    /// file is extended. The blocks are marked fully used.
    pub fn get_file_blocks(&self, space_id: i32, block_count: u32) -> Result<u64> {
        self.check_writable()?;
        self.check_space_id(space_id)?;

        let mut state = self.state.lock();
        state.ensure_manager(space_id)?;
        state.get_file_blocks_locked(space_id, block_count, true)
    }

    /// Drop a space: every block it owns becomes empty
    ///
    /// A no-op for the reserved spaces and for spaces without blocks.
    pub fn free_table_space(&self, space_id: i32) -> Result<()> {
        if space_id <= SPACE_ID_EMPTY {
            return Err(SpaceError::InvalidSpaceId(space_id));
        }
        if space_id == SPACE_ID_DIRECTORY || space_id == SPACE_ID_DEFAULT {
            return Ok(());
        }
        self.check_writable()?;

        let mut state = self.state.lock();
        state.free_table_space_locked(space_id)?;
        Ok(())
    }

    /// Write a batch of released ranges of a space to the bitmaps
    ///
    /// `tail` is an abandoned cursor range whose fully free blocks are
    /// relabelled empty. Unless `full` is set, the batch is left in `ranges`
    /// while more than a quarter of its capacity is still available. Returns
    /// true when the batch was applied.
    pub fn free_table_space_ranges(
        &self,
        space_id: i32,
        ranges: &mut FreeSpaceList,
        tail: Range<u64>,
        full: bool,
    ) -> Result<bool> {
        self.check_writable()?;
        self.check_space_id(space_id)?;

        let mut state = self.state.lock();
        state.ensure_manager(space_id)?;
        state.free_table_space_ranges_locked(space_id, ranges, tail, full)
    }

    /// Write the space's own pending released ranges to the bitmaps
    pub fn flush_table_space(&self, space_id: i32) -> Result<bool> {
        self.check_writable()?;
        self.check_space_id(space_id)?;

        let mut state = self.state.lock();
        state.ensure_manager(space_id)?;
        state.flush_table_space_locked(space_id, true)
    }

    /// Issue a new space id
    pub fn get_new_table_space_id(&self) -> i32 {
        self.sequence.fetch_add(2, Ordering::SeqCst)
    }

    /// Snapshot of a space's manager, registering it if needed
    pub fn get_table_space(&self, space_id: i32) -> Result<TableSpaceSnapshot> {
        if !is_space_id(space_id) {
            return Err(SpaceError::InvalidSpaceId(space_id));
        }
        self.sequence
            .fetch_max(next_space_id_above(space_id), Ordering::SeqCst);

        let mut state = self.state.lock();
        state.ensure_manager(space_id)?;
        Ok(TableSpaceSnapshot::of(state.manager(space_id)?))
    }

    /// Snapshot of an already registered space
    pub fn table_space(&self, space_id: i32) -> Option<TableSpaceSnapshot> {
        let state = self.state.lock();
        state.spaces.get(&space_id).map(TableSpaceSnapshot::of)
    }

    /// Rebuild the empty-block set and the id counter from the directory and
    /// resume every registered space on its last block
    pub fn initialise_spaces(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(max_id) = state.initialise_spaces_locked()? {
            self.sequence
                .fetch_max(next_space_id_above(max_id), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Write every space's pending ranges to the bitmaps and detach all
    /// cursors
    ///
    /// Call [`initialise_spaces`](Self::initialise_spaces) to resume.
    pub fn reset(&self) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.reset_locked()
    }

    /// Blocks whose bitmap is misplaced or shared with another block
    pub fn check_directory_spaces(&self) -> Result<Vec<SpaceMismatch>> {
        self.state.lock().check_directory_spaces_locked()
    }

    /// Blocks whose directory counters disagree with their bitmap
    pub fn check_directory_bitmaps(&self) -> Result<Vec<BitmapMismatch>> {
        self.state.lock().check_directory_bitmaps_locked()
    }

    /// Recompute mismatched directory counters, returning how many were fixed
    pub fn repair_directory_bitmaps(&self) -> Result<usize> {
        self.check_writable()?;
        self.state.lock().repair_directory_bitmaps_locked()
    }

    /// Bytes free inside blocks owned by spaces, plus set-aside blocks
    pub fn get_lost_blocks_size(&self) -> Result<u64> {
        self.state.lock().lost_blocks_size_locked()
    }

    pub fn stats(&self) -> Result<SpaceStats> {
        self.state.lock().stats_locked()
    }

    /// Directory entry of one block (`None` if not provisioned)
    pub fn block_entry(&self, index: u32) -> Result<Option<BlockEntry>> {
        self.state.lock().block_entry_locked(index)
    }

    /// Indices of all empty blocks, ascending
    pub fn free_block_indices(&self) -> Vec<u32> {
        self.state.lock().free_blocks.iter().collect()
    }

    /// One past the highest provisioned block index
    pub fn block_index_limit(&self) -> u32 {
        self.state.lock().block_index_limit
    }

    /// Logical end of the data file
    pub fn file_free_pos(&self) -> u64 {
        self.state.lock().cache.file.file_free_pos()
    }

    pub fn file_block_size(&self) -> u64 {
        self.geometry.file_block_size
    }

    pub fn unit_size(&self) -> u64 {
        self.geometry.unit_size
    }

    pub fn units_per_block(&self) -> u32 {
        self.geometry.units_per_block
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Write dirty directory records and the header, then sync
    pub fn flush(&self) -> Result<()> {
        debug!("Flushing space directory");
        self.state.lock().flush_locked()
    }

    /// Flush pending releases and all directory state, then close the file
    pub fn close(self) -> Result<()> {
        let mut state = self.state.into_inner();
        if !state.read_only {
            state.reset_locked()?;
            state.flush_locked()?;
        }
        info!("Closed block space file at {:?}", state.cache.file.path());
        Ok(())
    }
}
