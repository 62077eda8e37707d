//! Disk I/O for block space data files

use crate::error::{Result, SpaceError};
use crate::header::{Header, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Random-access data file
///
/// Growth is append-only: [`enlarge_file_space`](Self::enlarge_file_space)
/// moves the logical end forward and the file is never shrunk.
pub struct DataFile {
    file: File,
    path: std::path::PathBuf,
    free_pos: u64,
    read_only: bool,
}

impl DataFile {
    /// Create a new data file, writing the header
    pub fn create<P: AsRef<Path>>(path: P, header: &Header) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        file.flush()?;

        Ok(DataFile {
            file,
            path: path.as_ref().to_path_buf(),
            free_pos: HEADER_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing data file
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;

        let free_pos = file.metadata()?.len();

        Ok(DataFile {
            file,
            path: path.as_ref().to_path_buf(),
            free_pos,
            read_only,
        })
    }

    /// Read the header
    pub fn read_header(&mut self) -> Result<Header> {
        let buffer = self.read_at(0, HEADER_SIZE)?;
        Header::from_bytes(&buffer)
    }

    /// Write the header
    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        self.write_at(0, &header.to_bytes())
    }

    /// Read `len` bytes at `position`
    pub fn read_at(&mut self, position: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(position))?;

        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Write `data` at `position`
    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(SpaceError::ReadOnly);
        }

        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)?;

        Ok(())
    }

    /// Logical end of the file
    pub fn file_free_pos(&self) -> u64 {
        self.free_pos
    }

    /// Grow the file by `delta` bytes, returning the previous end
    pub fn enlarge_file_space(&mut self, delta: u64) -> Result<u64> {
        if self.read_only {
            return Err(SpaceError::ReadOnly);
        }

        let previous = self.free_pos;
        self.file.set_len(previous + delta)?;
        self.free_pos = previous + delta;

        Ok(previous)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}
