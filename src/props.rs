//! Property lists for file creation, file access, dataset creation and
//! dataset access.
//!
//! Property lists group related configuration into plain values that are
//! passed by reference when files and datasets are created or opened.

use crate::dataspace::Dataspace;
use crate::error::{Result, VdsError};
use crate::layout::VirtualLayout;
use crate::types::{FillValue, StorageKind, ViewPolicy};
use serde::{Deserialize, Serialize};

/// What closing a file does to objects still open in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseDegree {
    /// Whatever the file was first opened with.
    #[default]
    Default,
    /// The file stays open until its last object closes.
    Weak,
    /// Closing fails while objects are open.
    Semi,
    /// Closing closes every object.
    Strong,
}

impl CloseDegree {
    /// Two opens of the same file must agree on the close degree, unless
    /// either side leaves it at the default.
    pub fn is_compatible(self, other: CloseDegree) -> bool {
        self == other || self == CloseDegree::Default || other == CloseDegree::Default
    }
}

/// Library format versions, used as the lower compatibility bound of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibVersion {
    #[default]
    Earliest,
    V18,
    V110,
    V112,
    V114,
    V200,
}

impl LibVersion {
    pub const LATEST: LibVersion = LibVersion::V200;
}

/// Low-level driver a file is accessed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDriver {
    #[default]
    Default,
    /// Multi-process parallel I/O.
    Mpio,
}

/// File creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreateProps {
    /// Width in bytes of length fields in the file format (2, 4 or 8).
    pub size_of_lengths: u8,
}

impl Default for FileCreateProps {
    fn default() -> Self {
        Self { size_of_lengths: 8 }
    }
}

impl FileCreateProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size_of_lengths(mut self, size: u8) -> Result<Self> {
        if !matches!(size, 2 | 4 | 8) {
            return Err(VdsError::BadValue(format!(
                "size of lengths must be 2, 4 or 8, not {}",
                size
            )));
        }
        self.size_of_lengths = size;
        Ok(self)
    }
}

/// File access properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileAccessProps {
    pub close_degree: CloseDegree,
    /// Oldest library version whose format features may be used.
    pub low_bound: LibVersion,
    pub driver: FileDriver,
}

impl FileAccessProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_close_degree(mut self, degree: CloseDegree) -> Self {
        self.close_degree = degree;
        self
    }

    pub fn with_low_bound(mut self, low: LibVersion) -> Self {
        self.low_bound = low;
        self
    }

    pub fn with_driver(mut self, driver: FileDriver) -> Self {
        self.driver = driver;
        self
    }
}

/// Dataset access properties consulted by virtual datasets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetAccessProps {
    pub view: ViewPolicy,
    /// Consecutive missing printf sources tolerated under
    /// [`ViewPolicy::LastAvailable`].
    pub printf_gap: u64,
    /// Colon-separated directories searched for source files. `${ORIGIN}`
    /// stands for the directory of the file holding the virtual dataset.
    pub vds_prefix: Option<String>,
}

impl DatasetAccessProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(mut self, view: ViewPolicy) -> Self {
        self.view = view;
        self
    }

    pub fn with_printf_gap(mut self, gap: u64) -> Self {
        self.printf_gap = gap;
        self
    }

    pub fn with_vds_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.vds_prefix = Some(prefix.into());
        self
    }

    /// Prefix entries with `${ORIGIN}` expanded to `origin`.
    pub fn prefixes(&self, origin: &str) -> Vec<String> {
        self.vds_prefix
            .as_deref()
            .map(|list| {
                list.split(':')
                    .filter(|p| !p.is_empty())
                    .map(|p| p.replace("${ORIGIN}", origin))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Dataset creation properties.
#[derive(Debug, Clone, Default)]
pub struct DatasetCreateProps {
    pub fill_value: FillValue,
    layout: Option<VirtualLayout>,
}

impl DatasetCreateProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fill_value(mut self, fill: FillValue) -> Self {
        self.fill_value = fill;
        self
    }

    /// Map `vspace`'s selection onto `src_space`'s selection in dataset
    /// `src_dset` of file `src_file`. Either name may contain `%b`.
    pub fn set_virtual(
        &mut self,
        vspace: &Dataspace,
        src_file: &str,
        src_dset: &str,
        src_space: &Dataspace,
    ) -> Result<()> {
        self.layout
            .get_or_insert_with(VirtualLayout::new)
            .add_mapping(vspace, src_file, src_dset, src_space)
    }

    pub fn storage_kind(&self) -> StorageKind {
        if self.layout.is_some() {
            StorageKind::Virtual
        } else {
            StorageKind::Contiguous
        }
    }

    pub fn virtual_layout(&self) -> Option<&VirtualLayout> {
        self.layout.as_ref()
    }
}
