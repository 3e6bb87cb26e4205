//! Error types for virtual dataset operations

use thiserror::Error;

/// Main error type for VDS operations
#[derive(Error, Debug)]
pub enum VdsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid source name template: {0}")]
    BadTemplate(String),

    #[error("Invalid selection: {0}")]
    BadSelection(String),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Unable to open file: {0}")]
    OpenFail(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid encoding: {0}")]
    Codec(String),

    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Checksum { expected: u32, computed: u32 },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("File is read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl VdsError {
    /// True for the failures that only mean "this source is not there right
    /// now". Extent resolution and reads recover from these locally.
    pub fn is_source_absent(&self) -> bool {
        matches!(self, VdsError::OpenFail(_) | VdsError::NotFound(_))
    }
}

/// Specialized Result type for VDS operations
pub type Result<T> = std::result::Result<T, VdsError>;

impl From<bincode::Error> for VdsError {
    fn from(err: bincode::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdsError {
    fn from(err: serde_json::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for VdsError {
    fn from(err: std::collections::TryReserveError) -> Self {
        VdsError::OutOfMemory(err.to_string())
    }
}
