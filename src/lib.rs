//! h5vds - virtual datasets over N-dimensional array storage
//!
//! A virtual dataset presents one logical N-dimensional array whose elements
//! live in regions of other *source* datasets, possibly in other files. The
//! engine keeps an ordered table of mappings from hyperslabs of the virtual
//! index space onto hyperslabs of source datasets, opens sources lazily,
//! resolves unlimited dimensions against the sources that exist, and serves
//! reads and writes by projecting the caller's selection through each
//! mapping.
//!
//! # Features
//!
//! - Regular and irregular hyperslab selections, including unlimited ones
//! - Printf-style source names (`%b`) expanding to one source per block
//! - `FirstMissing` / `LastAvailable` views with a tolerated printf gap
//! - Fill values for unmapped regions on read
//! - A checksummed, versioned mapping table stored in the file's global heap
//! - Container files saved and loaded as compressed images (async I/O)
//!
//! # Example
//!
//! ```rust,ignore
//! use h5vds::{Dataspace, DatasetAccessProps, DatasetCreateProps, DataType, VirtualDataset};
//!
//! let mut vspace = Dataspace::simple(&[20]);
//! vspace.select_slice(&[0..10])?;
//! let mut dcpl = DatasetCreateProps::new();
//! dcpl.set_virtual(&vspace, "a.h5", "/data", &Dataspace::simple(&[10]))?;
//!
//! let mut vds = VirtualDataset::create(
//!     &file, &registry, "/vds", DataType::F32,
//!     &Dataspace::simple(&[20]), &dcpl, &DatasetAccessProps::new(),
//! )?;
//! let values: Vec<f32> = vds.read_vec(&vds.space()?)?;
//! ```

pub mod access;
pub mod checksum;
pub mod codec;
pub mod compression;
pub mod config;
pub mod dataspace;
mod dispatch;
pub mod error;
mod extent;
pub mod heap;
pub mod io;
pub mod layout;
pub mod lifecycle;
pub mod metadata;
pub mod name_template;
mod projection;
pub mod props;
pub mod selection;
pub mod storage;
pub mod types;
pub mod utils;
pub mod validate;

// Re-exports
pub use access::{VirtualDataset, VirtualStats};
pub use compression::{CompressionMethod, Compressor};
pub use config::VdsConfig;
pub use dataspace::{Dataspace, SelectOp};
pub use error::{Result, VdsError};
pub use heap::HeapId;
pub use io::{IOManager, StorageBackend};
pub use layout::{IoRequest, LayoutOps, MappingEntry, VirtualLayout};
pub use lifecycle::HeldFiles;
pub use name_template::NameTemplate;
pub use props::{
    CloseDegree, DatasetAccessProps, DatasetCreateProps, FileAccessProps, FileCreateProps,
    FileDriver, LibVersion,
};
pub use selection::{Selection, UNLIMITED};
pub use storage::{ContainerFile, FileRegistry, MemDataset, StoredDataset};
pub use types::{DataType, Element, FillValue, Intent, StorageKind, ViewPolicy};

/// Version of the h5vds implementation
pub const H5VDS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!H5VDS_VERSION.is_empty());
    }
}
