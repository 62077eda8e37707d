use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("Invalid magic number in header")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Header checksum verification failed")]
    HeaderChecksumMismatch,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The root directory cannot be used; the file is not a readable database.
    #[error("Space directory is unreadable: {0}")]
    UnreadableDirectory(String),

    #[error("Invalid space id: {0}")]
    InvalidSpaceId(i32),

    #[error("Invalid file block index: {0}")]
    InvalidBlockIndex(u32),

    #[error("Block accessor has no pinned block for {0}")]
    AccessorNotPinned(&'static str),

    #[error("Space directory is full: at most {limit} file blocks can be addressed")]
    DirectoryFull { limit: u64 },

    #[error("File position {0} cannot be stored as a scaled address")]
    AddressOutOfRange(u64),

    #[error("Directory space has no room for a {needed}-byte record")]
    DirectorySpaceExhausted { needed: u64 },

    #[error("Space {space_id} cannot place {bytes} bytes in its current blocks")]
    CursorExhausted { space_id: i32, bytes: u64 },

    #[error("Data file is opened read-only")]
    ReadOnly,

    #[error("Invalid record size: expected {expected} bytes, got {actual}")]
    InvalidRecordSize { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, SpaceError>;
