use crate::config::SpaceConfig;
use crate::error::{Result, SpaceError};

pub const MAGIC: [u8; 8] = *b"BSPC\x00\x01\x00\x00";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Bytes reserved for the header at the start of the data file
pub const HEADER_SIZE: usize = 4096;

/// Number of bytes covered by the header checksum
const CHECKSUMMED_LEN: usize = 44;

/// Data file header (first 4KB of the file)
///
/// Holds the block geometry the directory was built with and the anchor
/// scalar locating the root directory. All other allocator state is reached
/// from the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic number: "BSPC\x00\x01\x00\x00"
    pub magic: [u8; 8],

    /// Format version (major)
    pub version_major: u16,

    /// Format version (minor)
    pub version_minor: u16,

    /// File block size in bytes
    pub file_block_size: u32,

    /// Allocation unit size in bytes; all stored positions are scaled by it
    pub unit_size: u32,

    /// Entries per directory block
    pub directory_capacity: u32,

    /// Entries in the root directory
    pub root_capacity: u32,

    /// Root directory position divided by `unit_size` (0 = not created yet)
    pub space_manager_position: u32,

    /// Reserved, always zero
    pub flags: u32,

    /// Logical end of the data file in bytes
    pub file_free_pos: u64,
}

impl Header {
    /// Create a header for a new data file with the given geometry
    pub fn new(config: &SpaceConfig) -> Self {
        Header {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            file_block_size: config.file_block_size,
            unit_size: config.unit_size,
            directory_capacity: config.directory_capacity,
            root_capacity: config.root_capacity,
            space_manager_position: 0,
            flags: 0,
            file_free_pos: HEADER_SIZE as u64,
        }
    }

    /// Validate the header magic, version and geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(SpaceError::InvalidMagic);
        }

        if self.version_major != VERSION_MAJOR || self.version_minor != VERSION_MINOR {
            return Err(SpaceError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        self.geometry().validate_geometry()
    }

    /// Geometry recorded in this header, as a config with default tuning
    pub fn geometry(&self) -> SpaceConfig {
        SpaceConfig::default()
            .with_file_block_size(self.file_block_size)
            .with_unit_size(self.unit_size)
            .with_directory_capacity(self.directory_capacity)
            .with_root_capacity(self.root_capacity)
    }

    /// Byte position of the root directory (0 when not yet created)
    pub fn root_position(&self) -> u64 {
        self.space_manager_position as u64 * self.unit_size as u64
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.file_block_size.to_le_bytes());
        bytes.extend_from_slice(&self.unit_size.to_le_bytes());
        bytes.extend_from_slice(&self.directory_capacity.to_le_bytes());
        bytes.extend_from_slice(&self.root_capacity.to_le_bytes());
        bytes.extend_from_slice(&self.space_manager_position.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.file_free_pos.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[..CHECKSUMMED_LEN]);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        // Pad to HEADER_SIZE
        bytes.resize(HEADER_SIZE, 0);

        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHECKSUMMED_LEN + 4 {
            return Err(SpaceError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for header",
            )));
        }

        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);

        let mut free_pos = [0u8; 8];
        free_pos.copy_from_slice(&bytes[36..44]);

        let header = Header {
            magic,
            version_major: u16_at(8),
            version_minor: u16_at(10),
            file_block_size: u32_at(12),
            unit_size: u32_at(16),
            directory_capacity: u32_at(20),
            root_capacity: u32_at(24),
            space_manager_position: u32_at(28),
            flags: u32_at(32),
            file_free_pos: u64::from_le_bytes(free_pos),
        };

        // Magic first, so a foreign file reports the right error
        if header.magic != MAGIC {
            return Err(SpaceError::InvalidMagic);
        }

        if crc32fast::hash(&bytes[..CHECKSUMMED_LEN]) != u32_at(CHECKSUMMED_LEN) {
            return Err(SpaceError::HeaderChecksumMismatch);
        }

        header.validate()?;

        Ok(header)
    }
}
