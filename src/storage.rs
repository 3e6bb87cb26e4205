//! Container files, stored datasets, and the registry that opens files.
//!
//! A [`ContainerFile`] owns ordinary datasets, the headers of virtual
//! datasets, and a global heap. Files live in a [`FileRegistry`], which
//! resolves source file names the way virtual datasets need (prefix list,
//! directory of the virtual file, bare name) and saves or loads compressed
//! container images through an [`IOManager`].
//!
//! Open files are reference counted: a file whose last handle is closed
//! while datasets in it are still open, or while it is held, stays open
//! with a pending close until those go away.

use crate::compression::{get_compressor, CompressionLevel, CompressionMethod};
use crate::dataspace::{zip_runs, Dataspace, Linearizer};
use crate::error::{Result, VdsError};
use crate::heap::{GlobalHeap, HeapId};
use crate::io::IOManager;
use crate::metadata::{FormatVersion, ImageMetadata};
use crate::props::{FileAccessProps, FileCreateProps, FileDriver};
use crate::types::{DataType, Element, FillValue, Intent, StorageKind};
use crate::utils::{bytes_to_typed_data, typed_data_to_bytes};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Magic number at the start of a saved container image
pub const IMAGE_MAGIC: &[u8; 4] = b"VDSC";

/// An ordinary (non-virtual) dataset.
///
/// Element pairing between file and memory selections follows iteration
/// order, so the two selections may have different shapes.
pub trait StoredDataset: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn dtype(&self) -> DataType;

    /// Current extent with everything selected.
    fn space(&self) -> Dataspace;

    fn read(&self, file_space: &Dataspace, mem_space: &Dataspace, buf: &mut [u8]) -> Result<()>;

    fn write(&self, file_space: &Dataspace, mem_space: &Dataspace, buf: &[u8]) -> Result<()>;

    /// Resize within the maximum extent, keeping overlapping elements.
    fn set_extent(&self, dims: &[u64]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Reload cached state from the backing store.
    fn refresh(&self) -> Result<()>;

    /// True while writes are buffered and not yet flushed.
    fn has_cached_data(&self) -> bool;

    fn image(&self) -> DatasetImage;
}

/// Serializable contents of a stored dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetImage {
    pub name: String,
    pub dtype: DataType,
    pub dims: Vec<u64>,
    pub max_dims: Vec<u64>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MemState {
    space: Dataspace,
    data: Vec<u8>,
}

/// Contiguous dataset held in memory, row-major and little-endian.
#[derive(Debug)]
pub struct MemDataset {
    name: String,
    dtype: DataType,
    state: RwLock<MemState>,
    dirty: AtomicBool,
    refreshes: AtomicU64,
}

impl MemDataset {
    /// A zero-filled dataset.
    pub fn new(name: impl Into<String>, dtype: DataType, space: &Dataspace) -> Result<Self> {
        let len = byte_len(space.extent_npoints(), dtype)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, 0);
        let mut space = space.clone();
        space.select_all();
        Ok(Self {
            name: name.into(),
            dtype,
            state: RwLock::new(MemState { space, data }),
            dirty: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
        })
    }

    /// A dataset holding `values` in row-major order.
    pub fn with_values<T: Element>(
        name: impl Into<String>,
        space: &Dataspace,
        values: &[T],
    ) -> Result<Self> {
        if values.len() as u64 != space.extent_npoints() {
            return Err(VdsError::BadValue(format!(
                "{} values for an extent of {} elements",
                values.len(),
                space.extent_npoints()
            )));
        }
        let dataset = Self::new(name, T::DATA_TYPE, space)?;
        dataset.state.write().data = typed_data_to_bytes(values);
        Ok(dataset)
    }

    pub fn from_image(image: DatasetImage) -> Result<Self> {
        let space = Dataspace::with_max(&image.dims, &image.max_dims)?;
        let expected = byte_len(space.extent_npoints(), image.dtype)?;
        if image.data.len() != expected {
            return Err(VdsError::Codec(format!(
                "dataset {} holds {} bytes, extent needs {}",
                image.name,
                image.data.len(),
                expected
            )));
        }
        Ok(Self {
            name: image.name,
            dtype: image.dtype,
            state: RwLock::new(MemState {
                space,
                data: image.data,
            }),
            dirty: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
        })
    }

    /// All elements in row-major order.
    pub fn values<T: Element>(&self) -> Result<Vec<T>> {
        self.check_type(T::DATA_TYPE)?;
        bytes_to_typed_data(&self.state.read().data)
    }

    /// Number of times the dataset was refreshed.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn check_type(&self, dtype: DataType) -> Result<()> {
        if dtype != self.dtype {
            return Err(VdsError::BadValue(format!(
                "dataset {} stores {}, not {}",
                self.name, self.dtype, dtype
            )));
        }
        Ok(())
    }

    /// Pair file and memory runs for a transfer.
    fn plan(
        &self,
        state: &MemState,
        file_space: &Dataspace,
        mem_space: &Dataspace,
        buf_len: usize,
    ) -> Result<(Vec<crate::dataspace::Run>, Vec<crate::dataspace::Run>)> {
        let mut view = state.space.clone();
        view.set_selection(file_space.selection().clone())?;
        let file_runs = view.runs(&Linearizer::exact(&view)?)?;
        let mem_runs = mem_space.runs(&Linearizer::exact(mem_space)?)?;

        let needed = byte_len(mem_space.extent_npoints(), self.dtype)?;
        if buf_len < needed {
            return Err(VdsError::BadValue(format!(
                "buffer of {} bytes for a memory extent of {} bytes",
                buf_len, needed
            )));
        }
        Ok((file_runs, mem_runs))
    }
}

impl StoredDataset for MemDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn space(&self) -> Dataspace {
        self.state.read().space.clone()
    }

    fn read(&self, file_space: &Dataspace, mem_space: &Dataspace, buf: &mut [u8]) -> Result<()> {
        let state = self.state.read();
        let (file_runs, mem_runs) = self.plan(&state, file_space, mem_space, buf.len())?;
        let size = self.dtype.size_in_bytes();
        zip_runs(&file_runs, &mem_runs, |f, m, n| {
            let (f, m, n) = (f as usize * size, m as usize * size, n as usize * size);
            buf[m..m + n].copy_from_slice(&state.data[f..f + n]);
            Ok(())
        })?;
        trace!(dataset = %self.name, elements = file_space.npoints(), "read");
        Ok(())
    }

    fn write(&self, file_space: &Dataspace, mem_space: &Dataspace, buf: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let (file_runs, mem_runs) = self.plan(&state, file_space, mem_space, buf.len())?;
        let size = self.dtype.size_in_bytes();
        let data = &mut state.data;
        zip_runs(&file_runs, &mem_runs, |f, m, n| {
            let (f, m, n) = (f as usize * size, m as usize * size, n as usize * size);
            data[f..f + n].copy_from_slice(&buf[m..m + n]);
            Ok(())
        })?;
        self.dirty.store(true, Ordering::Release);
        trace!(dataset = %self.name, elements = file_space.npoints(), "write");
        Ok(())
    }

    fn set_extent(&self, dims: &[u64]) -> Result<()> {
        let mut state = self.state.write();
        let mut grown = state.space.clone();
        grown.set_extent(dims)?;

        let keep: Vec<std::ops::Range<u64>> = state
            .space
            .dims()
            .iter()
            .zip(dims)
            .map(|(&old, &new)| 0..old.min(new))
            .collect();
        let mut old_view = state.space.clone();
        let mut new_view = grown.clone();
        old_view.select_slice(&keep)?;
        new_view.select_slice(&keep)?;

        let size = self.dtype.size_in_bytes();
        let mut data = Vec::new();
        data.try_reserve_exact(byte_len(grown.extent_npoints(), self.dtype)?)?;
        data.resize(byte_len(grown.extent_npoints(), self.dtype)?, 0);
        if old_view.npoints() > 0 {
            let old_runs = old_view.runs(&Linearizer::exact(&old_view)?)?;
            let new_runs = new_view.runs(&Linearizer::exact(&new_view)?)?;
            let old = &state.data;
            zip_runs(&old_runs, &new_runs, |o, n, len| {
                let (o, n, len) = (o as usize * size, n as usize * size, len as usize * size);
                data[n..n + len].copy_from_slice(&old[o..o + len]);
                Ok(())
            })?;
        }

        debug!(dataset = %self.name, ?dims, "extent changed");
        state.space = grown;
        state.data = data;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn has_cached_data(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn image(&self) -> DatasetImage {
        let state = self.state.read();
        DatasetImage {
            name: self.name.clone(),
            dtype: self.dtype,
            dims: state.space.dims().to_vec(),
            max_dims: state.space.max_dims().to_vec(),
            data: state.data.clone(),
        }
    }
}

fn byte_len(npoints: u64, dtype: DataType) -> Result<usize> {
    usize::try_from(npoints)
        .ok()
        .and_then(|n| n.checked_mul(dtype.size_in_bytes()))
        .ok_or_else(|| VdsError::OutOfMemory(format!("{} elements of {}", npoints, dtype)))
}

/// Optional capabilities of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// The file is driven by multi-process parallel I/O.
    pub mpio: bool,
}

/// The storage part of a dataset header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutMessage {
    pub kind: StorageKind,
    /// Serialized mapping table; `None` when there are no mappings.
    pub heap_id: Option<HeapId>,
}

/// Object header of a virtual dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHeader {
    pub dtype: DataType,
    pub space: Dataspace,
    pub fill_value: FillValue,
    pub layout: LayoutMessage,
}

#[derive(Debug)]
struct FileState {
    intent: Intent,
    access: FileAccessProps,
    nrefs: usize,
    nopen_objs: usize,
    nholds: usize,
    close_pending: bool,
}

/// A container file.
pub struct ContainerFile {
    id: Uuid,
    name: String,
    fcpl: FileCreateProps,
    datasets: RwLock<BTreeMap<String, Arc<dyn StoredDataset>>>,
    virtual_headers: RwLock<BTreeMap<String, VirtualHeader>>,
    heap: RwLock<GlobalHeap>,
    metadata: RwLock<ImageMetadata>,
    state: Mutex<FileState>,
}

impl fmt::Debug for ContainerFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ContainerFile {
    fn new(name: &str, fcpl: FileCreateProps, id: Uuid, heap: Option<GlobalHeap>) -> Self {
        Self {
            id,
            name: name.to_string(),
            fcpl,
            datasets: RwLock::new(BTreeMap::new()),
            virtual_headers: RwLock::new(BTreeMap::new()),
            heap: RwLock::new(heap.unwrap_or_else(|| GlobalHeap::new(id.as_u64_pair().0))),
            metadata: RwLock::new(ImageMetadata::new(id, name)),
            state: Mutex::new(FileState {
                intent: Intent::ReadOnly,
                access: FileAccessProps::default(),
                nrefs: 0,
                nopen_objs: 0,
                nholds: 0,
                close_pending: false,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory part of the file name, empty for a bare name.
    pub fn directory(&self) -> String {
        Path::new(&self.name)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn intent(&self) -> Intent {
        self.state.lock().intent
    }

    pub fn create_props(&self) -> FileCreateProps {
        self.fcpl
    }

    pub fn access_props(&self) -> FileAccessProps {
        self.state.lock().access
    }

    pub fn features(&self) -> FeatureFlags {
        FeatureFlags {
            mpio: self.state.lock().access.driver == FileDriver::Mpio,
        }
    }

    fn require_writable(&self) -> Result<()> {
        if !self.intent().is_writable() {
            return Err(VdsError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    /// Create a zero-filled contiguous dataset.
    pub fn create_dataset(
        &self,
        name: &str,
        dtype: DataType,
        space: &Dataspace,
    ) -> Result<Arc<dyn StoredDataset>> {
        let dataset: Arc<dyn StoredDataset> = Arc::new(MemDataset::new(name, dtype, space)?);
        self.insert_dataset(dataset.clone())?;
        Ok(dataset)
    }

    /// Link an existing dataset object into the file.
    pub fn insert_dataset(&self, dataset: Arc<dyn StoredDataset>) -> Result<()> {
        self.require_writable()?;
        let name = dataset.name().to_string();
        if self.link_exists(&name) {
            return Err(VdsError::AlreadyExists(name));
        }
        self.datasets.write().insert(name, dataset);
        Ok(())
    }

    /// Link `dataset` in place of whatever has its name. Handles opened
    /// earlier keep the old object until refreshed.
    pub fn replace_dataset(&self, dataset: Arc<dyn StoredDataset>) -> Result<()> {
        self.require_writable()?;
        self.datasets
            .write()
            .insert(dataset.name().to_string(), dataset);
        Ok(())
    }

    pub fn unlink_dataset(&self, name: &str) -> Result<()> {
        self.require_writable()?;
        self.datasets
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VdsError::NotFound(name.to_string()))
    }

    /// True if any object is linked under `name`.
    pub fn link_exists(&self, name: &str) -> bool {
        self.datasets.read().contains_key(name) || self.virtual_headers.read().contains_key(name)
    }

    /// The stored dataset linked under `name`, without opening it.
    pub fn dataset(&self, name: &str) -> Option<Arc<dyn StoredDataset>> {
        self.datasets.read().get(name).cloned()
    }

    /// Open a stored dataset. The file stays open while the handle lives.
    pub fn open_dataset(self: &Arc<Self>, name: &str) -> Result<OpenDataset> {
        if !self.is_open() {
            return Err(VdsError::OpenFail(format!("{} is not open", self.name)));
        }
        let dataset = self
            .dataset(name)
            .ok_or_else(|| VdsError::NotFound(format!("{} in {}", name, self.name)))?;
        Ok(OpenDataset {
            object: ObjectHandle::new(self.clone()),
            dataset,
        })
    }

    pub fn heap_insert(&self, blob: &[u8]) -> Result<HeapId> {
        self.require_writable()?;
        self.heap.write().insert(blob)
    }

    pub fn heap_get(&self, id: HeapId) -> Result<Vec<u8>> {
        self.heap.read().get(id).map(<[u8]>::to_vec)
    }

    pub fn heap_remove(&self, id: HeapId) -> Result<()> {
        self.require_writable()?;
        self.heap.write().remove(id)
    }

    /// Number of live heap objects.
    pub fn heap_len(&self) -> usize {
        self.heap.read().len()
    }

    pub fn put_virtual_header(&self, name: &str, header: VirtualHeader) -> Result<()> {
        self.require_writable()?;
        if self.link_exists(name) {
            return Err(VdsError::AlreadyExists(name.to_string()));
        }
        self.virtual_headers.write().insert(name.to_string(), header);
        Ok(())
    }

    pub fn virtual_header(&self, name: &str) -> Result<VirtualHeader> {
        self.virtual_headers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VdsError::NotFound(format!("virtual dataset {} in {}", name, self.name)))
    }

    /// Record a new extent in a virtual dataset's header.
    pub fn update_virtual_space(&self, name: &str, dims: &[u64]) -> Result<()> {
        self.require_writable()?;
        let mut headers = self.virtual_headers.write();
        let header = headers
            .get_mut(name)
            .ok_or_else(|| VdsError::NotFound(format!("virtual dataset {}", name)))?;
        header.space.set_extent(dims)
    }

    pub fn remove_virtual_header(&self, name: &str) -> Result<VirtualHeader> {
        self.require_writable()?;
        self.virtual_headers
            .write()
            .remove(name)
            .ok_or_else(|| VdsError::NotFound(format!("virtual dataset {}", name)))
    }

    /// Open, or pending close while objects keep it alive.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.nrefs > 0 || state.close_pending
    }

    pub fn open_object_count(&self) -> usize {
        self.state.lock().nopen_objs
    }

    /// Keep the file from closing until [`release`](Self::release).
    pub fn hold(&self) {
        self.state.lock().nholds += 1;
    }

    pub fn release(&self) {
        {
            let mut state = self.state.lock();
            state.nholds = state.nholds.saturating_sub(1);
        }
        self.try_close();
    }

    fn object_opened(&self) {
        self.state.lock().nopen_objs += 1;
    }

    fn object_closed(&self) {
        {
            let mut state = self.state.lock();
            state.nopen_objs = state.nopen_objs.saturating_sub(1);
        }
        self.try_close();
    }

    /// Close if no handle, object, or hold keeps the file open. Returns
    /// whether the file is now closed.
    pub fn try_close(&self) -> bool {
        let mut state = self.state.lock();
        if state.nrefs > 0 {
            return false;
        }
        if state.nopen_objs > 0 || state.nholds > 0 {
            state.close_pending = true;
            return false;
        }
        if state.close_pending {
            debug!(file = %self.name, "deferred close completed");
        }
        state.close_pending = false;
        true
    }

    fn attach(&self, intent: Intent, access: FileAccessProps) -> Result<()> {
        let mut state = self.state.lock();
        let open = state.nrefs > 0 || state.close_pending;
        if open {
            if intent.is_writable() && !state.intent.is_writable() {
                return Err(VdsError::OpenFail(format!(
                    "{} is already open read-only",
                    self.name
                )));
            }
            if !state.access.close_degree.is_compatible(access.close_degree) {
                return Err(VdsError::OpenFail(format!(
                    "{}: file close degree doesn't match",
                    self.name
                )));
            }
        } else {
            state.intent = intent;
            state.access = access;
        }
        state.nrefs += 1;
        state.close_pending = false;
        Ok(())
    }

    fn detach(&self) {
        {
            let mut state = self.state.lock();
            state.nrefs = state.nrefs.saturating_sub(1);
        }
        self.try_close();
    }

    fn image(&self, compression: CompressionMethod) -> FileImage {
        let mut metadata = self.metadata.read().clone().with_compression(compression);
        metadata.touch();
        FileImage {
            metadata,
            fcpl: self.fcpl,
            datasets: self.datasets.read().values().map(|d| d.image()).collect(),
            virtual_headers: self.virtual_headers.read().clone(),
            heap: self.heap.read().clone(),
        }
    }

    fn from_image(image: FileImage) -> Result<Self> {
        let file = Self::new(
            &image.metadata.file_name,
            image.fcpl,
            image.metadata.file_id,
            Some(image.heap),
        );
        {
            let mut datasets = file.datasets.write();
            for ds in image.datasets {
                let dataset = MemDataset::from_image(ds)?;
                datasets.insert(dataset.name().to_string(), Arc::new(dataset));
            }
        }
        *file.virtual_headers.write() = image.virtual_headers;
        *file.metadata.write() = image.metadata;
        Ok(file)
    }
}

#[derive(Serialize, Deserialize)]
struct FileImage {
    metadata: ImageMetadata,
    fcpl: FileCreateProps,
    datasets: Vec<DatasetImage>,
    virtual_headers: BTreeMap<String, VirtualHeader>,
    heap: GlobalHeap,
}

/// Keeps one object of a file open; closing happens on drop.
#[derive(Debug)]
pub struct ObjectHandle {
    file: Arc<ContainerFile>,
}

impl ObjectHandle {
    pub fn new(file: Arc<ContainerFile>) -> Self {
        file.object_opened();
        Self { file }
    }

    pub fn file(&self) -> &Arc<ContainerFile> {
        &self.file
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.file.object_closed();
    }
}

/// An opened stored dataset.
#[derive(Debug)]
pub struct OpenDataset {
    object: ObjectHandle,
    dataset: Arc<dyn StoredDataset>,
}

impl OpenDataset {
    pub fn file(&self) -> &Arc<ContainerFile> {
        self.object.file()
    }

    pub fn dataset(&self) -> &Arc<dyn StoredDataset> {
        &self.dataset
    }

    pub fn name(&self) -> &str {
        self.dataset.name()
    }

    pub fn dtype(&self) -> DataType {
        self.dataset.dtype()
    }

    pub fn space(&self) -> Dataspace {
        self.dataset.space()
    }

    pub fn read(&self, file_space: &Dataspace, mem_space: &Dataspace, buf: &mut [u8]) -> Result<()> {
        self.dataset.read(file_space, mem_space, buf)
    }

    pub fn write(&self, file_space: &Dataspace, mem_space: &Dataspace, buf: &[u8]) -> Result<()> {
        self.file().require_writable()?;
        self.dataset.write(file_space, mem_space, buf)
    }

    pub fn flush(&self) -> Result<()> {
        self.dataset.flush()
    }

    /// Re-resolve the dataset by name, refresh it, and bind this handle to
    /// the fresh object.
    pub fn refresh(&mut self) -> Result<()> {
        let name = self.dataset.name().to_string();
        let fresh = self
            .file()
            .dataset(&name)
            .ok_or_else(|| VdsError::NotFound(format!("{} in {}", name, self.file().name())))?;
        fresh.refresh()?;
        self.dataset = fresh;
        Ok(())
    }
}

/// Every known file, open or closed.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: Arc<RwLock<HashMap<String, Arc<ContainerFile>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new file, opened read-write.
    pub fn create_file(
        &self,
        name: &str,
        fcpl: FileCreateProps,
        fapl: FileAccessProps,
    ) -> Result<Arc<ContainerFile>> {
        let mut files = self.files.write();
        if files.contains_key(name) {
            return Err(VdsError::AlreadyExists(name.to_string()));
        }
        let file = Arc::new(ContainerFile::new(name, fcpl, Uuid::new_v4(), None));
        file.attach(Intent::ReadWrite, fapl)?;
        files.insert(name.to_string(), file.clone());
        debug!(file = name, "created file");
        Ok(file)
    }

    pub fn open_file(
        &self,
        name: &str,
        intent: Intent,
        fapl: FileAccessProps,
    ) -> Result<Arc<ContainerFile>> {
        let file = self
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VdsError::OpenFail(format!("unable to open file {}", name)))?;
        file.attach(intent, fapl)?;
        Ok(file)
    }

    /// Release one handle on `file`. The close completes once no dataset
    /// or hold keeps it alive.
    pub fn close_file(&self, file: &ContainerFile) {
        file.detach();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    /// Forget a closed file entirely.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let mut files = self.files.write();
        match files.get(name) {
            None => Err(VdsError::NotFound(name.to_string())),
            Some(file) if file.is_open() => Err(VdsError::Unsupported(format!(
                "cannot delete open file {}",
                name
            ))),
            Some(_) => {
                files.remove(name);
                Ok(())
            }
        }
    }

    /// Open a source file named relative to the virtual dataset's file.
    ///
    /// Candidates are tried in order: an absolute name as given, then the
    /// base name under each prefix, under the directory of `vds_file`, and
    /// bare.
    pub fn prefix_open_file(
        &self,
        name: &str,
        vds_file: &ContainerFile,
        prefixes: &[String],
        intent: Intent,
        fapl: FileAccessProps,
    ) -> Result<Arc<ContainerFile>> {
        let base = if name.starts_with('/') {
            Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string())
        } else {
            name.to_string()
        };

        let mut candidates = Vec::new();
        if name.starts_with('/') {
            candidates.push(name.to_string());
        }
        for prefix in prefixes {
            candidates.push(join_path(prefix, &base));
        }
        let dir = vds_file.directory();
        if !dir.is_empty() {
            candidates.push(join_path(&dir, &base));
        }
        candidates.push(base);
        candidates.dedup();

        for candidate in &candidates {
            if self.contains(candidate) {
                let file = self.open_file(candidate, intent, fapl)?;
                debug!(source = name, resolved = %candidate, "opened source file");
                return Ok(file);
            }
        }
        debug!(source = name, tried = candidates.len(), "source file not found");
        Err(VdsError::OpenFail(format!("unable to open source file {}", name)))
    }

    /// Save a file's image under its own name.
    pub async fn save(
        &self,
        name: &str,
        io: &dyn IOManager,
        compression: CompressionMethod,
    ) -> Result<()> {
        let file = self
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VdsError::NotFound(name.to_string()))?;
        let image = file.image(compression);
        let body = bincode::serialize(&image)?;
        let packed = get_compressor(compression).compress(&body, CompressionLevel::default())?;

        let mut out = Vec::with_capacity(IMAGE_MAGIC.len() + 1 + packed.len());
        out.extend_from_slice(IMAGE_MAGIC);
        out.push(compression as u8);
        out.extend_from_slice(&packed);
        io.write(name, &out).await?;

        *file.metadata.write() = image.metadata;
        debug!(file = name, bytes = out.len(), ?compression, "saved container image");
        Ok(())
    }

    /// Load a saved image and register it, closed. A closed file of the
    /// same name is replaced.
    pub async fn load(&self, name: &str, io: &dyn IOManager) -> Result<Arc<ContainerFile>> {
        let raw = io.read(name).await?;
        if raw.len() < IMAGE_MAGIC.len() + 1 || &raw[..IMAGE_MAGIC.len()] != IMAGE_MAGIC {
            return Err(VdsError::Codec(format!("{} is not a container image", name)));
        }
        let method = CompressionMethod::from_u8(raw[IMAGE_MAGIC.len()])?;
        let body = get_compressor(method).decompress(&raw[IMAGE_MAGIC.len() + 1..])?;
        let image: FileImage = bincode::deserialize(&body)?;
        if !FormatVersion::CURRENT.is_compatible(&image.metadata.version) {
            return Err(VdsError::Codec(format!(
                "{} has image format {}.{}",
                name, image.metadata.version.major, image.metadata.version.minor
            )));
        }
        let file = Arc::new(ContainerFile::from_image(image)?);

        let mut files = self.files.write();
        if files.get(file.name()).is_some_and(|f| f.is_open()) {
            return Err(VdsError::AlreadyExists(format!(
                "{} is open and cannot be replaced",
                file.name()
            )));
        }
        files.insert(file.name().to_string(), file.clone());
        debug!(file = file.name(), "loaded container image");
        Ok(file)
    }
}

fn join_path(dir: &str, name: &str) -> String {
    Path::new(dir).join(name).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIOManager;
    use crate::props::CloseDegree;

    fn registry_with_source() -> (FileRegistry, Arc<ContainerFile>) {
        let registry = FileRegistry::new();
        let file = registry
            .create_file("/data/src.h5", FileCreateProps::new(), FileAccessProps::new())
            .unwrap();
        let values: Vec<i32> = (0..12).collect();
        let ds = MemDataset::with_values("/grid", &Dataspace::simple(&[3, 4]), &values).unwrap();
        file.insert_dataset(Arc::new(ds)).unwrap();
        (registry, file)
    }

    #[test]
    fn test_read_write_selection_pairs() {
        let (_registry, file) = registry_with_source();
        let ds = file.open_dataset("/grid").unwrap();

        let mut file_space = ds.space();
        file_space.select_slice(&[1..3, 1..3]).unwrap();
        let mem = Dataspace::simple(&[4]);
        let mut buf = vec![0u8; 16];
        ds.read(&file_space, &mem, &mut buf).unwrap();
        let got: Vec<i32> = bytes_to_typed_data(&buf).unwrap();
        assert_eq!(got, vec![5, 6, 9, 10]);

        let patch = typed_data_to_bytes(&[-1i32, -2, -3, -4]);
        ds.write(&file_space, &mem, &patch).unwrap();
        assert!(ds.dataset().has_cached_data());
        ds.flush().unwrap();
        assert!(!ds.dataset().has_cached_data());

        let mut all = vec![0u8; 48];
        ds.read(&ds.space(), &Dataspace::simple(&[12]), &mut all).unwrap();
        let got: Vec<i32> = bytes_to_typed_data(&all).unwrap();
        assert_eq!(&got[4..8], &[4, -1, -2, 7]);
    }

    #[test]
    fn test_transfer_checks() {
        let (_registry, file) = registry_with_source();
        let ds = file.open_dataset("/grid").unwrap();
        let mut outside = ds.space();
        outside.select_slice(&[2..4, 0..1]).unwrap();
        let mem = Dataspace::simple(&[2]);
        assert!(ds.read(&outside, &mem, &mut [0u8; 8]).is_err());
        assert!(ds.read(&ds.space(), &Dataspace::simple(&[12]), &mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_set_extent_keeps_elements() {
        let space = Dataspace::with_max(&[2, 2], &[crate::UNLIMITED, 3]).unwrap();
        let ds = MemDataset::with_values("/g", &space, &[1u16, 2, 3, 4]).unwrap();
        ds.set_extent(&[3, 3]).unwrap();
        assert_eq!(ds.values::<u16>().unwrap(), vec![1, 2, 0, 3, 4, 0, 0, 0, 0]);
        ds.set_extent(&[1, 2]).unwrap();
        assert_eq!(ds.values::<u16>().unwrap(), vec![1, 2]);
        assert!(ds.set_extent(&[1, 4]).is_err());
        assert!(ds.values::<f32>().is_err());
    }

    #[test]
    fn test_deferred_close() {
        let (registry, file) = registry_with_source();
        let ds = file.open_dataset("/grid").unwrap();
        registry.close_file(&file);
        assert!(file.is_open());

        file.hold();
        drop(ds);
        assert!(file.is_open());
        file.release();
        assert!(!file.is_open());
        assert!(matches!(file.open_dataset("/grid"), Err(VdsError::OpenFail(_))));
    }

    #[test]
    fn test_open_conflicts() {
        let (registry, file) = registry_with_source();
        registry.close_file(&file);

        let ro = registry
            .open_file("/data/src.h5", Intent::ReadOnly, FileAccessProps::new())
            .unwrap();
        assert!(registry
            .open_file("/data/src.h5", Intent::ReadWrite, FileAccessProps::new())
            .is_err());
        registry.close_file(&ro);

        let weak = FileAccessProps::new().with_close_degree(CloseDegree::Weak);
        let strong = FileAccessProps::new().with_close_degree(CloseDegree::Strong);
        let f = registry.open_file("/data/src.h5", Intent::ReadOnly, weak).unwrap();
        assert!(registry.open_file("/data/src.h5", Intent::ReadOnly, strong).is_err());
        registry.close_file(&f);

        assert!(matches!(
            registry.open_file("/nope.h5", Intent::ReadOnly, weak),
            Err(VdsError::OpenFail(_))
        ));
    }

    #[test]
    fn test_read_only_file_rejects_writes() {
        let (registry, file) = registry_with_source();
        registry.close_file(&file);
        let ro = registry
            .open_file("/data/src.h5", Intent::ReadOnly, FileAccessProps::new())
            .unwrap();
        let ds = ro.open_dataset("/grid").unwrap();
        let buf = vec![0u8; 48];
        assert!(matches!(
            ds.write(&ds.space(), &Dataspace::simple(&[12]), &buf),
            Err(VdsError::ReadOnly(_))
        ));
        assert!(ro.heap_insert(b"x").is_err());
    }

    #[test]
    fn test_prefix_resolution() {
        let registry = FileRegistry::new();
        let vds = registry
            .create_file("/vds/main.h5", FileCreateProps::new(), FileAccessProps::new())
            .unwrap();
        for name in ["/mnt/a.h5", "/vds/b.h5", "c.h5"] {
            registry
                .create_file(name, FileCreateProps::new(), FileAccessProps::new())
                .unwrap();
        }
        let fapl = FileAccessProps::new();
        let prefixes = vec!["/mnt".to_string()];

        let a = registry
            .prefix_open_file("a.h5", &vds, &prefixes, Intent::ReadOnly, fapl)
            .unwrap();
        assert_eq!(a.name(), "/mnt/a.h5");
        let a2 = registry
            .prefix_open_file("/elsewhere/a.h5", &vds, &prefixes, Intent::ReadOnly, fapl)
            .unwrap();
        assert_eq!(a2.name(), "/mnt/a.h5");
        let b = registry
            .prefix_open_file("b.h5", &vds, &[], Intent::ReadOnly, fapl)
            .unwrap();
        assert_eq!(b.name(), "/vds/b.h5");
        let c = registry
            .prefix_open_file("c.h5", &vds, &[], Intent::ReadOnly, fapl)
            .unwrap();
        assert_eq!(c.name(), "c.h5");
        assert!(registry
            .prefix_open_file("d.h5", &vds, &prefixes, Intent::ReadOnly, fapl)
            .is_err());
    }

    #[test]
    fn test_refresh_rebinds() {
        let (_registry, file) = registry_with_source();
        let mut ds = file.open_dataset("/grid").unwrap();
        let bigger = MemDataset::new("/grid", DataType::I32, &Dataspace::simple(&[5, 4])).unwrap();
        file.replace_dataset(Arc::new(bigger)).unwrap();
        assert_eq!(ds.space().dims(), &[3, 4]);
        ds.refresh().unwrap();
        assert_eq!(ds.space().dims(), &[5, 4]);
    }

    #[tokio::test]
    async fn test_image_save_load() {
        let (registry, file) = registry_with_source();
        let id = file.heap_insert(b"blob").unwrap();
        let io = MemoryIOManager::new();
        registry
            .save("/data/src.h5", &io, CompressionMethod::Zstd)
            .await
            .unwrap();
        assert_eq!(&io.read("/data/src.h5").await.unwrap()[..4], IMAGE_MAGIC);

        let other = FileRegistry::new();
        let loaded = other.load("/data/src.h5", &io).await.unwrap();
        assert_eq!(loaded.id(), file.id());
        assert!(!loaded.is_open());
        assert_eq!(loaded.heap_get(id).unwrap(), b"blob");
        let grid = loaded.dataset("/grid").unwrap().image();
        assert_eq!(grid, file.dataset("/grid").unwrap().image());

        assert!(registry.load("/data/src.h5", &io).await.is_err());
        io.write("bad.h5", b"nope").await.unwrap();
        assert!(matches!(other.load("bad.h5", &io).await, Err(VdsError::Codec(_))));
    }
}
