//! Container image metadata

use crate::compression::CompressionMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container image format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Identity and history of a saved container file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub version: FormatVersion,

    /// Stable identity of the file across saves
    pub file_id: Uuid,

    /// Name the file was registered under
    pub file_name: String,

    /// Compression of the image body
    pub compression: CompressionMethod,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,
}

impl ImageMetadata {
    pub fn new(file_id: Uuid, file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::default(),
            file_id,
            file_name: file_name.into(),
            compression: CompressionMethod::default(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}
