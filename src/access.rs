//! Virtual dataset access - main API for creating, opening, reading and
//! writing virtual datasets

use crate::codec;
use crate::dataspace::Dataspace;
use crate::error::{Result, VdsError};
use crate::layout::{DatasetContext, IoRequest, LayoutOps, MappingEntry, VirtualLayout};
use crate::props::{DatasetAccessProps, DatasetCreateProps};
use crate::selection::UNLIMITED;
use crate::storage::{ContainerFile, FileRegistry, LayoutMessage, ObjectHandle, VirtualHeader};
use crate::types::{DataType, Element, FillValue, StorageKind, ViewPolicy};
use crate::utils::{bytes_to_typed_data, typed_data_to_bytes};
use ndarray::{ArrayD, IxDyn};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// An open virtual dataset
pub struct VirtualDataset {
    /// Keeps the containing file open
    object: ObjectHandle,

    registry: FileRegistry,
    name: String,
    dtype: DataType,

    /// Current extent, everything selected
    space: Dataspace,

    fill_value: FillValue,
    layout: VirtualLayout,
}

impl VirtualDataset {
    /// Create a virtual dataset from the mappings in `dcpl`
    pub fn create(
        file: &Arc<ContainerFile>,
        registry: &FileRegistry,
        name: &str,
        dtype: DataType,
        space: &Dataspace,
        dcpl: &DatasetCreateProps,
        dapl: &DatasetAccessProps,
    ) -> Result<Self> {
        let mut layout = dcpl
            .virtual_layout()
            .cloned()
            .ok_or_else(|| VdsError::BadValue(format!("{} has no virtual mappings", name)))?;

        for m in layout.mappings() {
            if m.virtual_select().rank() != space.rank() {
                return Err(VdsError::BadValue(format!(
                    "mapping of rank {} in a dataset of rank {}",
                    m.virtual_select().rank(),
                    space.rank()
                )));
            }
            if let Some(u) = m.unlim_dim_virtual() {
                if space.max_dims()[u] != UNLIMITED {
                    return Err(VdsError::BadValue(format!(
                        "unlimited mapping along dimension {}, which has a fixed maximum",
                        u
                    )));
                }
            }
        }
        layout.check_min_dims(space.dims())?;
        dcpl.fill_value.element_bytes(dtype)?;

        let mut space = space.clone();
        space.select_all();
        let heap_id = codec::store(&mut layout, file)?;
        let header = VirtualHeader {
            dtype,
            space: space.clone(),
            fill_value: dcpl.fill_value.clone(),
            layout: LayoutMessage {
                kind: StorageKind::Virtual,
                heap_id,
            },
        };
        if let Err(e) = file.put_virtual_header(name, header) {
            codec::delete(&mut layout, file)?;
            return Err(e);
        }
        debug!(dataset = name, mappings = layout.len(), dims = ?space.dims(), "created virtual dataset");

        Self::attach(file, registry, name, dtype, space, dcpl.fill_value.clone(), dapl, layout)
    }

    /// Open an existing virtual dataset, resolving unlimited extents
    pub fn open(
        file: &Arc<ContainerFile>,
        registry: &FileRegistry,
        name: &str,
        dapl: &DatasetAccessProps,
    ) -> Result<Self> {
        let header = file.virtual_header(name)?;
        if header.layout.kind != StorageKind::Virtual {
            return Err(VdsError::Unsupported(format!(
                "{} is not a virtual dataset",
                name
            )));
        }
        let layout = codec::load(file, header.layout.heap_id, header.space.rank())?;

        let mut dataset = Self::attach(
            file,
            registry,
            name,
            header.dtype,
            header.space,
            header.fill_value,
            dapl,
            layout,
        )?;
        if dataset.layout.has_unlimited() {
            dataset.set_extent_unlim()?;
        }
        Ok(dataset)
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        file: &Arc<ContainerFile>,
        registry: &FileRegistry,
        name: &str,
        dtype: DataType,
        space: Dataspace,
        fill_value: FillValue,
        dapl: &DatasetAccessProps,
        mut layout: VirtualLayout,
    ) -> Result<Self> {
        if !file.is_open() {
            return Err(VdsError::OpenFail(format!("{} is not open", file.name())));
        }
        let ctx = DatasetContext {
            file,
            registry,
            name,
            dtype,
            space: &space,
            dapl,
        };
        layout.init(&ctx)?;

        Ok(Self {
            object: ObjectHandle::new(file.clone()),
            registry: registry.clone(),
            name: name.to_string(),
            dtype,
            space,
            fill_value,
            layout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn file(&self) -> &Arc<ContainerFile> {
        self.object.file()
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn fill_value(&self) -> &FillValue {
        &self.fill_value
    }

    pub fn layout(&self) -> &VirtualLayout {
        &self.layout
    }

    /// Mappings in declaration order
    pub fn mappings(&self) -> &[MappingEntry] {
        self.layout.mappings()
    }

    /// Extent as last resolved, without probing sources
    pub fn extent(&self) -> &[u64] {
        self.space.dims()
    }

    /// Current dataspace, with unlimited dimensions resolved against the
    /// sources first
    pub fn space(&mut self) -> Result<Dataspace> {
        if self.layout.has_unlimited() {
            self.set_extent_unlim()?;
        }
        Ok(self.space.clone())
    }

    /// Recompute unlimited dimensions from the sources under the current
    /// view. Returns whether the extent changed.
    pub fn set_extent_unlim(&mut self) -> Result<bool> {
        self.layout.set_extent_unlim(&mut self.space)
    }

    /// Resize explicitly. The extent can't drop below what the mappings
    /// need.
    pub fn set_extent(&mut self, dims: &[u64]) -> Result<()> {
        if !self.file().intent().is_writable() {
            return Err(VdsError::ReadOnly(self.file().name().to_string()));
        }
        self.layout.check_min_dims(dims)?;
        self.space.set_extent(dims)?;
        self.file().update_virtual_space(&self.name, dims)?;
        self.layout.init_all(dims)?;
        debug!(dataset = %self.name, ?dims, "virtual extent set");
        Ok(())
    }

    /// `file_space` with this dataset's extent; its selection must fit.
    fn bind_file_space(&self, file_space: &Dataspace) -> Result<Dataspace> {
        if file_space.rank() != self.space.rank() {
            return Err(VdsError::BadValue(format!(
                "selection of rank {} for a dataset of rank {}",
                file_space.rank(),
                self.space.rank()
            )));
        }
        let mut bound = file_space.clone();
        bound.copy_extent_from(&self.space);
        if let Some((_, hi)) = bound.bounds() {
            if let Some(d) = (0..hi.len()).find(|&d| hi[d] >= self.space.dims()[d]) {
                return Err(VdsError::BadSelection(format!(
                    "selection reaches {} in dimension {} of extent {}",
                    hi[d],
                    d,
                    self.space.dims()[d]
                )));
            }
        }
        Ok(bound)
    }

    /// Read the elements selected by `file_space` into `buf`, laid out by
    /// `mem_space`
    pub fn read(&mut self, file_space: &Dataspace, mem_space: &Dataspace, buf: &mut [u8]) -> Result<()> {
        let file_space = self.bind_file_space(file_space)?;
        let io = IoRequest {
            file_space: &file_space,
            mem_space,
            fill_value: &self.fill_value,
        };
        self.layout.read(&io, buf)
    }

    /// Write `buf`, laid out by `mem_space`, to the elements selected by
    /// `file_space`. Every element must map to an available source.
    pub fn write(&mut self, file_space: &Dataspace, mem_space: &Dataspace, buf: &[u8]) -> Result<()> {
        if !self.file().intent().is_writable() {
            return Err(VdsError::ReadOnly(self.file().name().to_string()));
        }
        let file_space = self.bind_file_space(file_space)?;
        let io = IoRequest {
            file_space: &file_space,
            mem_space,
            fill_value: &self.fill_value,
        };
        self.layout.write(&io, buf)
    }

    fn check_element<T: Element>(&self) -> Result<()> {
        if T::DATA_TYPE != self.dtype {
            return Err(VdsError::BadValue(format!(
                "dataset {} stores {}, not {}",
                self.name,
                self.dtype,
                T::DATA_TYPE
            )));
        }
        Ok(())
    }

    /// Read a selection into a flat vector, in selection order
    pub fn read_vec<T: Element>(&mut self, file_space: &Dataspace) -> Result<Vec<T>> {
        self.check_element::<T>()?;
        let n = file_space.npoints();
        let mem = Dataspace::simple(&[n]);
        let len = usize::try_from(n)
            .ok()
            .and_then(|n| n.checked_mul(self.dtype.size_in_bytes()))
            .ok_or_else(|| VdsError::OutOfMemory(format!("{} elements", n)))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)?;
        buf.resize(len, 0);
        self.read(file_space, &mem, &mut buf)?;
        bytes_to_typed_data(&buf)
    }

    /// Read a box as an N-dimensional array
    pub fn read_array<T: Element>(&mut self, ranges: &[Range<u64>]) -> Result<ArrayD<T>> {
        let mut file_space = self.space.clone();
        file_space.select_slice(ranges)?;
        let values = self.read_vec::<T>(&file_space)?;
        let shape: Vec<usize> = ranges
            .iter()
            .map(|r| r.end.saturating_sub(r.start) as usize)
            .collect();
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| VdsError::BadValue(format!("array shape: {}", e)))
    }

    /// Write a box from row-major values
    pub fn write_slice<T: Element>(&mut self, ranges: &[Range<u64>], values: &[T]) -> Result<()> {
        self.check_element::<T>()?;
        let mut file_space = self.space.clone();
        file_space.select_slice(ranges)?;
        let mem = Dataspace::simple(&[values.len() as u64]);
        self.write(&file_space, &mem, &typed_data_to_bytes(values))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.layout.flush()
    }

    /// True while some source holds unflushed writes
    pub fn is_data_cached(&self) -> bool {
        self.layout.is_data_cached()
    }

    /// Pick up changes made to the sources since they were opened
    pub fn refresh(&mut self) -> Result<()> {
        self.layout.refresh_sources()?;
        if self.layout.has_unlimited() {
            self.set_extent_unlim()?;
        }
        Ok(())
    }

    /// Copy this dataset's definition into `dst` under `name`. The mapping
    /// table is re-encoded into `dst`'s heap.
    pub fn copy_to(&self, dst: &ContainerFile, name: &str) -> Result<()> {
        let mut copy = VirtualLayout::new();
        copy.heap_id = codec::copy(&self.layout, dst)?;
        let header = VirtualHeader {
            dtype: self.dtype,
            space: self.space.clone(),
            fill_value: self.fill_value.clone(),
            layout: LayoutMessage {
                kind: StorageKind::Virtual,
                heap_id: copy.heap_id,
            },
        };
        if let Err(e) = dst.put_virtual_header(name, header) {
            codec::delete(&mut copy, dst)?;
            return Err(e);
        }
        debug!(from = %self.name, to = name, file = dst.name(), "copied virtual dataset");
        Ok(())
    }

    /// Unlink the dataset and free its mapping table
    pub fn delete(mut self) -> Result<()> {
        let file = self.file().clone();
        file.remove_virtual_header(&self.name)?;
        codec::delete(&mut self.layout, &file)?;
        debug!(dataset = %self.name, "deleted virtual dataset");
        Ok(())
    }

    /// Close every source and the dataset itself
    pub fn close(self) {}

    /// Get statistics about the dataset
    pub fn stats(&self) -> VirtualStats {
        let mappings = self.layout.mappings();
        VirtualStats {
            dims: self.space.dims().to_vec(),
            mappings: mappings.len(),
            printf_mappings: mappings.iter().filter(|m| m.is_printf()).count(),
            open_sources: self.layout.open_source_count(),
            data_type: self.dtype,
            view: self.layout.view(),
        }
    }
}

impl Drop for VirtualDataset {
    fn drop(&mut self) {
        self.layout.dest();
    }
}

/// Dataset statistics
#[derive(Debug, Clone)]
pub struct VirtualStats {
    pub dims: Vec<u64>,
    pub mappings: usize,
    pub printf_mappings: usize,
    pub open_sources: usize,
    pub data_type: DataType,
    pub view: ViewPolicy,
}

impl VirtualStats {
    pub fn total_elements(&self) -> u64 {
        self.dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
    }

    pub fn summary(&self) -> String {
        let bytes = usize::try_from(self.total_elements())
            .unwrap_or(usize::MAX)
            .saturating_mul(self.data_type.size_in_bytes());
        format!(
            "{}D virtual dataset {:?}: {} elements, {} logical, {} mappings ({} printf), {} sources open ({:?}, {:?})",
            self.dims.len(),
            self.dims,
            self.total_elements(),
            crate::utils::format_bytes(bytes),
            self.mappings,
            self.printf_mappings,
            self.open_sources,
            self.data_type,
            self.view,
        )
    }
}
