//! The virtual layout: an ordered table of mappings from regions of the
//! virtual index space onto regions of source datasets.
//!
//! Besides the mapping definitions the layout caches everything derived from
//! them: clipped selections for the current extent, parsed source names,
//! and the source datasets opened so far. Sources stay open until the layout
//! is destroyed.

use crate::dataspace::Dataspace;
use crate::error::{Result, VdsError};
use crate::heap::HeapId;
use crate::name_template::NameTemplate;
use crate::props::{CloseDegree, DatasetAccessProps, FileAccessProps};
use crate::storage::{ContainerFile, FileRegistry, OpenDataset};
use crate::types::{DataType, FillValue, Intent, StorageKind, ViewPolicy};
use crate::validate;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Source file name meaning "the file holding the virtual dataset".
pub const SAME_FILE: &str = ".";

/// Whether a stored selection extent matches the dataset it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpaceStatus {
    #[default]
    Invalid,
    Correct,
}

/// What probing a source dataset found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Existence {
    #[default]
    Unknown,
    Found,
    Absent,
}

/// A clipped selection: the unclipped base selection itself, a selection of
/// its own, or not computed yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) enum Clipped {
    #[default]
    Base,
    Own(Dataspace),
    Unset,
}

impl Clipped {
    pub(crate) fn resolve<'a>(&'a self, base: &'a Dataspace) -> Option<&'a Dataspace> {
        match self {
            Clipped::Base => Some(base),
            Clipped::Own(space) => Some(space),
            Clipped::Unset => None,
        }
    }

    pub(crate) fn is_unset(&self) -> bool {
        matches!(self, Clipped::Unset)
    }
}

/// One concrete source: a dataset in a file, possibly opened.
#[derive(Default)]
pub struct SourceDataset {
    pub(crate) file_name: String,
    pub(crate) dset_name: String,
    pub(crate) dset: Option<OpenDataset>,
    pub(crate) exists: Existence,
    /// Block selection of a printf sub-dataset.
    pub(crate) virtual_select: Option<Dataspace>,
    pub(crate) clipped_virtual: Clipped,
    pub(crate) clipped_source: Clipped,
    pub(crate) projected_mem: Option<Dataspace>,
}

impl SourceDataset {
    fn named(file_name: String, dset_name: String) -> Self {
        Self {
            file_name,
            dset_name,
            ..Self::default()
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn dset_name(&self) -> &str {
        &self.dset_name
    }

    pub fn is_open(&self) -> bool {
        self.dset.is_some()
    }

    pub fn existence(&self) -> Existence {
        self.exists
    }

    /// Close the source dataset, keeping what is known about it.
    pub(crate) fn close(&mut self) {
        self.dset = None;
    }
}

// Copies carry the definition only; open handles stay with the original.
impl Clone for SourceDataset {
    fn clone(&self) -> Self {
        Self {
            virtual_select: self.virtual_select.clone(),
            ..Self::named(self.file_name.clone(), self.dset_name.clone())
        }
    }
}

impl fmt::Debug for SourceDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDataset")
            .field("file_name", &self.file_name)
            .field("dset_name", &self.dset_name)
            .field("open", &self.dset.is_some())
            .field("exists", &self.exists)
            .finish()
    }
}

/// The family of sub-datasets behind a printf mapping, indexed by block.
#[derive(Debug, Clone, Default)]
pub(crate) struct PrintfSources {
    pub(crate) sub_dsets: Vec<SourceDataset>,
    /// Blocks known to lie within the resolved extent.
    pub(crate) nused: usize,
    pub(crate) io_start: usize,
    pub(crate) io_end: usize,
}

impl PrintfSources {
    /// Make sure block `j` has a record, growing by doubling from 128.
    pub(crate) fn ensure(&mut self, j: usize) -> Result<()> {
        if j < self.sub_dsets.len() {
            return Ok(());
        }
        if j >= self.sub_dsets.capacity() {
            let target = crate::utils::grow_capacity(j + 1, 128);
            self.sub_dsets
                .try_reserve_exact(target - self.sub_dsets.len())?;
        }
        self.sub_dsets.resize_with(j + 1, SourceDataset::default);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Sources {
    Single(SourceDataset),
    Printf(PrintfSources),
}

/// One virtual-to-source mapping and its derived state.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub(crate) virtual_select: Dataspace,
    pub(crate) source_select: Dataspace,
    pub(crate) source_file: NameTemplate,
    pub(crate) source_dset: NameTemplate,
    pub(crate) unlim_dim_virtual: Option<usize>,
    pub(crate) unlim_dim_source: Option<usize>,
    /// Virtual size the mapping supports given the last source extent seen.
    pub(crate) clip_size_virtual: Option<u64>,
    /// Source size the clipped source selection was cut to.
    pub(crate) clip_size_source: Option<u64>,
    /// Virtual size the clipped selections were last cut to.
    pub(crate) unlim_extent_virtual: Option<u64>,
    /// Source extent along its unlimited dimension when last resolved.
    pub(crate) unlim_extent_source: Option<u64>,
    /// Whether `clip_size_virtual` counts the gap after the last full block.
    pub(crate) clip_incl_trail: bool,
    pub(crate) source_space_status: SpaceStatus,
    pub(crate) virtual_space_status: SpaceStatus,
    pub(crate) clipped_virtual: Clipped,
    pub(crate) clipped_source: Clipped,
    pub(crate) sources: Sources,
}

impl MappingEntry {
    pub(crate) fn new(
        virtual_select: Dataspace,
        source_select: Dataspace,
        source_file: NameTemplate,
        source_dset: NameTemplate,
        source_space_status: SpaceStatus,
    ) -> Self {
        let sources = if source_file.is_printf() || source_dset.is_printf() {
            Sources::Printf(PrintfSources::default())
        } else {
            Sources::Single(SourceDataset::named(
                source_file.build(0).unwrap_or_else(|_| source_file.to_string()),
                source_dset.build(0).unwrap_or_else(|_| source_dset.to_string()),
            ))
        };
        Self {
            unlim_dim_virtual: virtual_select.unlimited_dim(),
            unlim_dim_source: source_select.unlimited_dim(),
            virtual_select,
            source_select,
            source_file,
            source_dset,
            clip_size_virtual: None,
            clip_size_source: None,
            unlim_extent_virtual: None,
            unlim_extent_source: None,
            clip_incl_trail: false,
            source_space_status,
            virtual_space_status: SpaceStatus::Correct,
            clipped_virtual: Clipped::Base,
            clipped_source: Clipped::Base,
            sources,
        }
    }

    pub fn virtual_select(&self) -> &Dataspace {
        &self.virtual_select
    }

    pub fn source_select(&self) -> &Dataspace {
        &self.source_select
    }

    pub fn source_file_name(&self) -> &str {
        self.source_file.as_str()
    }

    pub fn source_dset_name(&self) -> &str {
        self.source_dset.as_str()
    }

    pub fn source_file_template(&self) -> &NameTemplate {
        &self.source_file
    }

    pub fn source_dset_template(&self) -> &NameTemplate {
        &self.source_dset
    }

    pub fn is_printf(&self) -> bool {
        matches!(self.sources, Sources::Printf(_))
    }

    pub fn unlim_dim_virtual(&self) -> Option<usize> {
        self.unlim_dim_virtual
    }

    pub fn unlim_dim_source(&self) -> Option<usize> {
        self.unlim_dim_source
    }

    pub fn source_space_status(&self) -> SpaceStatus {
        self.source_space_status
    }

    /// Virtual selection clipped to the current extent, once computed.
    pub fn clipped_virtual_select(&self) -> Option<&Dataspace> {
        self.clipped_virtual.resolve(&self.virtual_select)
    }

    pub fn clipped_source_select(&self) -> Option<&Dataspace> {
        self.clipped_source.resolve(&self.source_select)
    }

    /// The single source of a non-printf mapping.
    pub fn source(&self) -> Option<&SourceDataset> {
        match &self.sources {
            Sources::Single(src) => Some(src),
            Sources::Printf(_) => None,
        }
    }

    /// Sub-datasets of a printf mapping probed or opened so far.
    pub fn sub_datasets(&self) -> &[SourceDataset] {
        match &self.sources {
            Sources::Single(_) => &[],
            Sources::Printf(p) => &p.sub_dsets,
        }
    }

    /// Number of printf blocks within the resolved extent.
    pub fn sub_dset_nused(&self) -> usize {
        match &self.sources {
            Sources::Single(_) => 0,
            Sources::Printf(p) => p.nused,
        }
    }

    /// Every source dataset record of this mapping.
    pub(crate) fn sources_mut(&mut self) -> &mut [SourceDataset] {
        match &mut self.sources {
            Sources::Single(src) => std::slice::from_mut(src),
            Sources::Printf(p) => &mut p.sub_dsets,
        }
    }

    pub(crate) fn sources_ref(&self) -> &[SourceDataset] {
        match &self.sources {
            Sources::Single(src) => std::slice::from_ref(src),
            Sources::Printf(p) => &p.sub_dsets,
        }
    }
}

/// Where sources are looked up, captured when the layout is initialized.
#[derive(Debug, Clone)]
pub(crate) struct SourceEnv {
    pub(crate) vds_file: Arc<ContainerFile>,
    pub(crate) registry: FileRegistry,
    pub(crate) dset_name: String,
    pub(crate) dtype: DataType,
    pub(crate) intent: Intent,
    pub(crate) prefixes: Vec<String>,
}

/// The dataset a layout is initialized for.
#[derive(Debug, Clone, Copy)]
pub struct DatasetContext<'a> {
    pub file: &'a Arc<ContainerFile>,
    pub registry: &'a FileRegistry,
    pub name: &'a str,
    pub dtype: DataType,
    pub space: &'a Dataspace,
    pub dapl: &'a DatasetAccessProps,
}

/// One read or write request against a virtual dataset. `file_space` lives
/// in the virtual extent, `mem_space` in the caller's buffer.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest<'a> {
    pub file_space: &'a Dataspace,
    pub mem_space: &'a Dataspace,
    pub fill_value: &'a FillValue,
}

/// Storage-layout operations a dataset dispatches through.
pub trait LayoutOps {
    fn kind(&self) -> StorageKind;

    /// Bind the layout to its dataset and load access properties.
    fn init(&mut self, ctx: &DatasetContext<'_>) -> Result<()>;

    fn is_space_alloc(&self) -> bool;

    /// True when some underlying storage holds unflushed data.
    fn is_data_cached(&self) -> bool;

    /// Prepare per-mapping projections; returns the number of mapped elements.
    fn io_init(&mut self, io: &IoRequest<'_>) -> Result<u64>;

    fn read(&mut self, io: &IoRequest<'_>, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, io: &IoRequest<'_>, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Release what [`io_init`](Self::io_init) prepared.
    fn io_term(&mut self);

    /// Close every source and drop cached selections.
    fn dest(&mut self);
}

/// Mapping table of a virtual dataset.
#[derive(Debug, Clone, Default)]
pub struct VirtualLayout {
    pub(crate) mappings: Vec<MappingEntry>,
    pub(crate) min_dims: Vec<u64>,
    pub(crate) view: ViewPolicy,
    pub(crate) printf_gap: u64,
    pub(crate) initialized: bool,
    pub(crate) heap_id: Option<HeapId>,
    pub(crate) source_fapl: FileAccessProps,
    pub(crate) source_dapl: DatasetAccessProps,
    pub(crate) env: Option<SourceEnv>,
}

impl VirtualLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mapping from `vspace`'s selection to `src_space`'s selection
    /// in dataset `src_dset` of file `src_file`. Either name may contain
    /// `%b`. On error the layout is unchanged.
    pub fn add_mapping(
        &mut self,
        vspace: &Dataspace,
        src_file: &str,
        src_dset: &str,
        src_space: &Dataspace,
    ) -> Result<()> {
        validate::pre_check(vspace, src_space, SpaceStatus::Correct)?;
        self.check_rank(vspace.rank())?;

        let source_file = self.share_file_name(src_file)?;
        let source_dset = self.share_dset_name(src_dset)?;
        let entry = MappingEntry::new(
            vspace.clone(),
            src_space.clone(),
            source_file,
            source_dset,
            SpaceStatus::Correct,
        );
        validate::post_check(&entry)?;

        self.push_entry(entry)
    }

    /// Append an entry that already passed validation.
    pub(crate) fn push_entry(&mut self, entry: MappingEntry) -> Result<()> {
        self.check_rank(entry.virtual_select.rank())?;
        self.mappings.try_reserve(1)?;
        self.update_min_dims(&entry);
        self.mappings.push(entry);
        self.initialized = false;
        Ok(())
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if let Some(first) = self.mappings.first() {
            if first.virtual_select.rank() != rank {
                return Err(VdsError::BadValue(format!(
                    "mapping of rank {} in a layout of rank {}",
                    rank,
                    first.virtual_select.rank()
                )));
            }
        }
        Ok(())
    }

    fn share_file_name(&self, name: &str) -> Result<NameTemplate> {
        match self.mappings.iter().find(|m| m.source_file.as_str() == name) {
            Some(m) => Ok(m.source_file.clone()),
            None => NameTemplate::new(name),
        }
    }

    fn share_dset_name(&self, name: &str) -> Result<NameTemplate> {
        match self.mappings.iter().find(|m| m.source_dset.as_str() == name) {
            Some(m) => Ok(m.source_dset.clone()),
            None => NameTemplate::new(name),
        }
    }

    fn update_min_dims(&mut self, entry: &MappingEntry) {
        let rank = entry.virtual_select.rank();
        if self.min_dims.len() < rank {
            self.min_dims.resize(rank, 0);
        }
        if let Some((_, hi)) = entry.virtual_select.bounds() {
            for d in 0..rank {
                if Some(d) != entry.unlim_dim_virtual && hi[d] >= self.min_dims[d] {
                    self.min_dims[d] = hi[d] + 1;
                }
            }
        }
    }

    /// Mappings in declaration order.
    pub fn mappings(&self) -> &[MappingEntry] {
        &self.mappings
    }

    /// Iterate the mappings in declaration order.
    pub fn iterate_mappings(&self) -> impl Iterator<Item = &MappingEntry> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Smallest extent holding every bounded block of every mapping.
    pub fn min_dims(&self) -> &[u64] {
        &self.min_dims
    }

    /// Fail with `BadValue` if `dims` is smaller than the mappings need.
    pub fn check_min_dims(&self, dims: &[u64]) -> Result<()> {
        for (d, &min) in self.min_dims.iter().enumerate() {
            let have = dims.get(d).copied().unwrap_or(0);
            if have < min {
                return Err(VdsError::BadValue(format!(
                    "virtual dataset dimension {} is {} but mappings need {}",
                    d, have, min
                )));
            }
        }
        Ok(())
    }

    pub fn view(&self) -> ViewPolicy {
        self.view
    }

    pub fn printf_gap(&self) -> u64 {
        self.printf_gap
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn heap_id(&self) -> Option<HeapId> {
        self.heap_id
    }

    /// Access properties sources are opened with.
    pub fn source_fapl(&self) -> &FileAccessProps {
        &self.source_fapl
    }

    pub fn source_dapl(&self) -> &DatasetAccessProps {
        &self.source_dapl
    }

    /// True if any mapping has an unlimited virtual selection.
    pub fn has_unlimited(&self) -> bool {
        self.mappings.iter().any(|m| m.unlim_dim_virtual.is_some())
    }

    /// Number of source datasets currently open.
    pub fn open_source_count(&self) -> usize {
        self.mappings
            .iter()
            .flat_map(|m| m.sources_ref())
            .filter(|s| s.is_open())
            .count()
    }

    pub(crate) fn env(&self) -> Result<&SourceEnv> {
        self.env.as_ref().ok_or_else(|| {
            VdsError::Unsupported("virtual layout is not bound to a dataset".to_string())
        })
    }

    /// Load view and gap from `dapl` and capture where sources are found.
    pub(crate) fn bind(&mut self, ctx: &DatasetContext<'_>) -> Result<()> {
        self.view = ctx.dapl.view;
        self.printf_gap = match ctx.dapl.view {
            ViewPolicy::LastAvailable => ctx.dapl.printf_gap,
            ViewPolicy::FirstMissing => 0,
        };
        self.source_fapl = ctx
            .file
            .access_props()
            .with_close_degree(CloseDegree::Weak);
        self.source_dapl = ctx.dapl.clone();

        let origin = ctx.file.directory();
        self.env = Some(SourceEnv {
            vds_file: ctx.file.clone(),
            registry: ctx.registry.clone(),
            dset_name: ctx.name.to_string(),
            dtype: ctx.dtype,
            intent: ctx.file.intent(),
            prefixes: ctx.dapl.prefixes(&origin),
        });

        for entry in &mut self.mappings {
            if entry.virtual_space_status != SpaceStatus::Correct
                || entry.virtual_select.dims() != ctx.space.dims()
            {
                entry.virtual_select.copy_extent_from(ctx.space);
                entry.virtual_space_status = SpaceStatus::Correct;
            }
        }
        debug!(
            dataset = ctx.name,
            mappings = self.mappings.len(),
            view = ?self.view,
            printf_gap = self.printf_gap,
            "initialized virtual layout"
        );
        Ok(())
    }

    /// Close every source and forget cached selections.
    pub(crate) fn reset(&mut self) {
        for entry in &mut self.mappings {
            for src in entry.sources_mut() {
                src.close();
                src.projected_mem = None;
            }
            if let Sources::Printf(p) = &mut entry.sources {
                *p = PrintfSources::default();
            }
            entry.clipped_virtual = Clipped::Base;
            entry.clipped_source = Clipped::Base;
            entry.clip_size_virtual = None;
            entry.clip_size_source = None;
            entry.unlim_extent_virtual = None;
            entry.unlim_extent_source = None;
        }
        self.initialized = false;
    }
}

/// Open `src` if it is not open yet. Returns whether it is open afterwards.
///
/// A missing file or dataset is not an error: it is recorded as absent.
/// Opening copies the source's extent into `source_select` if that extent
/// was not known.
pub(crate) fn open_source(
    env: &SourceEnv,
    fapl: FileAccessProps,
    src: &mut SourceDataset,
    source_select: &mut Dataspace,
    status: &mut SpaceStatus,
) -> Result<bool> {
    if src.dset.is_some() {
        return Ok(true);
    }

    let opened = if src.file_name == SAME_FILE {
        env.vds_file.open_dataset(&src.dset_name)
    } else {
        match env.registry.prefix_open_file(
            &src.file_name,
            &env.vds_file,
            &env.prefixes,
            env.intent,
            fapl,
        ) {
            Ok(file) => {
                let dset = file.open_dataset(&src.dset_name);
                env.registry.close_file(&file);
                dset
            }
            Err(e) => Err(e),
        }
    };

    let dset = match opened {
        Ok(dset) => dset,
        Err(e) if e.is_source_absent() => {
            debug!(file = %src.file_name, dataset = %src.dset_name, "source not available: {}", e);
            src.exists = Existence::Absent;
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    if dset.dtype() != env.dtype {
        return Err(VdsError::BadValue(format!(
            "source {} stores {}, virtual dataset stores {}",
            src.dset_name,
            dset.dtype(),
            env.dtype
        )));
    }
    if *status == SpaceStatus::Invalid {
        source_select.copy_extent_from(&dset.space());
        *status = SpaceStatus::Correct;
    }
    debug!(file = %src.file_name, dataset = %src.dset_name, "opened source dataset");
    src.exists = Existence::Found;
    src.dset = Some(dset);
    Ok(true)
}
