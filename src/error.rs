//! Error types and handling for Waymark

/// Result type alias for Waymark operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Comprehensive error types for the Waymark dataset publisher
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Storage configuration failed its validity check
    #[error("Invalid config: {message}")]
    InvalidConfig { message: String },

    /// A required artifact file is absent
    #[error("Could not find required file: {path}")]
    MissingRequired { path: String },

    /// Archive fingerprint mismatch or inconsistent metadata
    #[error("Corrupt archive {path}: {message}")]
    CorruptArchive { path: String, message: String },

    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The shared region register has no free keys left
    #[error("Shared memory key capacity exhausted")]
    KeysExhausted,

    /// Shared memory allocation, attach, or remove failure
    #[error("Shared memory error: {message}")]
    SharedMemory { message: String },

    /// The monitor mutex could not be acquired within the deadline
    #[error("Could not acquire region lock after {seconds} seconds")]
    PublishTimedOut { seconds: i64 },

    /// Connectivity checksums disagree across artifacts
    #[error("Connectivity checksum {actual} in {path} does not equal to checksum {expected} in the turn data")]
    ChecksumMismatch {
        expected: u32,
        actual: u32,
        path: String,
    },

    /// A block name was set twice with strict layout checking enabled
    #[error("Duplicate block: {name}")]
    DuplicateBlock { name: String },

    /// A block name was not found in the layout
    #[error("Block not found: {name}")]
    BlockNotFound { name: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl StoreError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a missing required artifact error
    pub fn missing_required(path: impl Into<String>) -> Self {
        Self::MissingRequired { path: path.into() }
    }

    /// Create a corrupt archive error
    pub fn corrupt_archive(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a shared memory error
    pub fn shared_memory(message: impl Into<String>) -> Self {
        Self::SharedMemory {
            message: message.into(),
        }
    }

    /// Create a duplicate block error
    pub fn duplicate_block(name: impl Into<String>) -> Self {
        Self::DuplicateBlock { name: name.into() }
    }

    /// Create a block not found error
    pub fn block_not_found(name: impl Into<String>) -> Self {
        Self::BlockNotFound { name: name.into() }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

// Convert from common error types
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(format!("Bincode error: {}", err))
    }
}
