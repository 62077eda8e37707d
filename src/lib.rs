//! # Blockspace - Block Space Allocation for Single-File Databases
//!
//! `blockspace` manages the free space of one data file. The file is divided
//! into fixed-size **file blocks**; every block is owned by one **space** (a
//! table, an index, the directory itself) and is described by a per-block
//! bitmap of fixed-size **allocation units**. Features:
//!
//! - **Sub-block allocation** from a per-space cursor and free-range list
//! - **Block reuse**: blocks emptied by releases or dropped spaces are handed
//!   to other spaces before the file grows
//! - **Self-describing directory**: the directory lives in blocks it
//!   describes and grows on demand
//! - **Recovery**: in-memory state is rebuilt from the directory on open,
//!   with consistency checks and counter repair
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockspace::{DataSpaceManager, Result, SpaceConfig};
//!
//! # fn main() -> Result<()> {
//! let config = SpaceConfig::default();
//! let spaces = DataSpaceManager::create("tables.bsp", &config)?;
//!
//! // Each table gets its own space id
//! let orders = spaces.get_new_table_space_id();
//! let row = spaces.get_file_position(orders, 200)?;
//!
//! // Released ranges are reused by the same space first
//! spaces.release(orders, row, 200)?;
//!
//! // Dropping a table hands all of its blocks back
//! spaces.free_table_space(orders)?;
//! spaces.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reopening
//!
//! ```rust,no_run
//! use blockspace::{DataSpaceManager, Result, SpaceConfig};
//!
//! # fn main() -> Result<()> {
//! let spaces = DataSpaceManager::open("tables.bsp", &SpaceConfig::default())?;
//!
//! for mismatch in spaces.check_directory_bitmaps()? {
//!     eprintln!("block {} has stale counters", mismatch.block_index);
//! }
//! println!("{}", spaces.stats()?.to_json()?);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod space_manager;
pub mod store;

pub use allocator::accessor::BlockAccessor;
pub use allocator::bitmap::BitMap;
pub use allocator::directory::{DirectoryBlock, RootDirectory};
pub use allocator::extent::{Extent, FreeSpaceList};
pub use allocator::free_blocks::FreeBlockSet;
pub use allocator::table_space::TableSpaceManager;
pub use allocator::{
    BlockGeometry, SPACE_ID_DEFAULT, SPACE_ID_DIRECTORY, SPACE_ID_EMPTY, SPACE_ID_FIRST,
    SPACE_ID_SET_ASIDE,
};
pub use config::SpaceConfig;
pub use error::{Result, SpaceError};
pub use header::Header;
pub use space_manager::{
    BitmapMismatch, BlockEntry, DataSpaceManager, SpaceMismatch, SpaceStats, TableSpaceSnapshot,
};
