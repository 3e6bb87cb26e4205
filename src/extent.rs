//! Resolution of unlimited virtual dimensions against source extents.
//!
//! Non-printf mappings follow the extent of their one unlimited source.
//! Printf mappings probe sub-datasets block by block; under
//! [`ViewPolicy::LastAvailable`] up to `printf_gap` consecutive missing
//! blocks are skipped over. Contributions are combined with `min` under
//! [`ViewPolicy::FirstMissing`] and `max` under `LastAvailable`.

use crate::dataspace::Dataspace;
use crate::error::{Result, VdsError};
use crate::layout::{
    open_source, Clipped, Existence, MappingEntry, SourceDataset, SourceEnv, Sources,
    VirtualLayout,
};
use crate::name_template::NameTemplate;
use crate::props::FileAccessProps;
use crate::types::ViewPolicy;
use tracing::{debug, trace};

/// Most consecutive missing printf blocks probed past the last one found.
pub(crate) const PRINTF_GAP_LIMIT: u64 = 4096;

impl VirtualLayout {
    /// Recompute the extent of `vspace` from the current sources. Returns
    /// whether the extent changed.
    pub fn set_extent_unlim(&mut self, vspace: &mut Dataspace) -> Result<bool> {
        let env = self.env()?.clone();
        let fapl = self.source_fapl;
        let (view, gap) = (self.view, self.printf_gap);
        let rank = vspace.rank();

        let mut new_dims: Vec<Option<u64>> = vec![None; rank];
        for entry in &mut self.mappings {
            let Some(u) = entry.unlim_dim_virtual else {
                continue;
            };
            let clip = if entry.is_printf() {
                resolve_printf(&env, fapl, entry, view, gap)?
            } else {
                resolve_single(&env, fapl, entry, view == ViewPolicy::FirstMissing)?
            };
            let slot = new_dims.get_mut(u).ok_or_else(|| {
                VdsError::BadValue(format!("unlimited dimension {} beyond rank {}", u, rank))
            })?;
            *slot = Some(match (*slot, view) {
                (None, _) => clip,
                (Some(cur), ViewPolicy::FirstMissing) => cur.min(clip),
                (Some(cur), ViewPolicy::LastAvailable) => cur.max(clip),
            });
        }

        let curr = vspace.dims().to_vec();
        let dims: Vec<u64> = (0..rank)
            .map(|d| {
                let min = self.min_dims.get(d).copied().unwrap_or(0);
                new_dims[d].unwrap_or(curr[d]).max(min)
            })
            .collect();

        let changed = dims != curr;
        if changed {
            vspace.set_extent(&dims)?;
            debug!(dataset = %env.dset_name, old = ?curr, new = ?dims, "virtual extent changed");
            if env.intent.is_writable() {
                env.vds_file.update_virtual_space(&env.dset_name, &dims)?;
            }
        }

        self.apply_clips(&dims)?;
        self.initialized = true;
        Ok(changed)
    }

    /// Compute clipped selections for the extent `vdims` without consulting
    /// the view policy or changing the extent.
    pub(crate) fn init_all(&mut self, vdims: &[u64]) -> Result<()> {
        let env = self.env()?.clone();
        let fapl = self.source_fapl;

        for entry in &mut self.mappings {
            let Some(u) = entry.unlim_dim_virtual else {
                continue;
            };
            if entry.is_printf() {
                let extent = vdims.get(u).copied().unwrap_or(0);
                let (first_inc, partial) = entry.virtual_select.first_inc_block(extent)?;
                let nused = to_index(first_inc + u64::from(partial))?;
                let Sources::Printf(p) = &mut entry.sources else {
                    continue;
                };
                if nused > 0 {
                    p.ensure(nused - 1)?;
                }
                for (j, sub) in p.sub_dsets.iter_mut().enumerate().take(nused) {
                    init_sub_dataset(
                        &entry.virtual_select,
                        &entry.source_file,
                        &entry.source_dset,
                        sub,
                        j,
                    )?;
                }
                p.nused = nused;
            } else {
                resolve_single(&env, fapl, entry, false)?;
            }
        }

        self.apply_clips(vdims)?;
        self.initialized = true;
        Ok(())
    }

    /// Cut every unlimited mapping's selections to the extent `vdims`.
    ///
    /// Non-printf mappings are clipped to the smaller of the extent and what
    /// their source supports. Printf blocks wholly inside the extent use the
    /// block selections directly; the rest are left for the I/O projector,
    /// which clips them once their source extent is known.
    pub(crate) fn apply_clips(&mut self, vdims: &[u64]) -> Result<()> {
        for entry in &mut self.mappings {
            let Some(u) = entry.unlim_dim_virtual else {
                continue;
            };
            let extent = vdims.get(u).copied().unwrap_or(0);

            match &mut entry.sources {
                Sources::Single(_) => {
                    let vsize = extent.min(entry.clip_size_virtual.unwrap_or(0));
                    if entry.unlim_extent_virtual == Some(vsize) {
                        continue;
                    }
                    let mut clipped_virtual = entry.virtual_select.clone();
                    clipped_virtual.clip_unlim(vsize)?;
                    let source_size = entry
                        .source_select
                        .clip_extent(clipped_virtual.npoints(), false)?;
                    let mut clipped_source = entry.source_select.clone();
                    clipped_source.clip_unlim(source_size)?;

                    trace!(vsize, source_size, "clipped unlimited mapping");
                    entry.clipped_virtual = Clipped::Own(clipped_virtual);
                    entry.clipped_source = Clipped::Own(clipped_source);
                    entry.unlim_extent_virtual = Some(vsize);
                    entry.clip_size_source = Some(source_size);
                }
                Sources::Printf(p) => {
                    let (first_inc, _) = entry.virtual_select.first_inc_block(extent)?;
                    for (j, sub) in p.sub_dsets.iter_mut().enumerate() {
                        if sub.virtual_select.is_none() {
                            continue;
                        }
                        let inside = (j as u64) < first_inc;
                        let (cv, cs) = if inside {
                            (Clipped::Base, Clipped::Base)
                        } else {
                            (Clipped::Unset, Clipped::Unset)
                        };
                        sub.clipped_virtual = cv;
                        sub.clipped_source = cs;
                    }
                    entry.unlim_extent_virtual = Some(extent);
                }
            }
        }
        Ok(())
    }
}

fn to_index(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| VdsError::OutOfMemory(format!("{} printf blocks", value)))
}

/// Fill in names and the block selection of printf block `j`.
pub(crate) fn init_sub_dataset(
    virtual_select: &Dataspace,
    file: &NameTemplate,
    dset: &NameTemplate,
    sub: &mut SourceDataset,
    j: usize,
) -> Result<()> {
    if sub.virtual_select.is_some() {
        return Ok(());
    }
    let block = j as u64;
    sub.file_name = file.build(block)?;
    sub.dset_name = dset.build(block)?;
    sub.virtual_select = Some(virtual_select.unlim_block(block)?);
    sub.clipped_virtual = Clipped::Base;
    sub.clipped_source = Clipped::Base;
    Ok(())
}

/// Virtual size a non-printf unlimited mapping supports right now; zero
/// when its source can't be opened.
fn resolve_single(
    env: &SourceEnv,
    fapl: FileAccessProps,
    entry: &mut MappingEntry,
    incl_trail: bool,
) -> Result<u64> {
    let us = entry.unlim_dim_source.ok_or_else(|| {
        VdsError::BadSelection("mapping has no unlimited source dimension".to_string())
    })?;
    let Sources::Single(src) = &mut entry.sources else {
        return Err(VdsError::BadValue("printf mapping resolved as single".to_string()));
    };

    if !open_source(
        env,
        fapl,
        src,
        &mut entry.source_select,
        &mut entry.source_space_status,
    )? {
        entry.unlim_extent_source = None;
        entry.clip_size_virtual = Some(0);
        return Ok(0);
    }
    let Some(dset) = src.dset.as_ref() else {
        return Ok(0);
    };

    let space = dset.space();
    entry.source_select.copy_extent_from(&space);
    let extent = space.dims().get(us).copied().unwrap_or(0);

    if entry.unlim_extent_source == Some(extent) && entry.clip_incl_trail == incl_trail {
        if let Some(clip) = entry.clip_size_virtual {
            return Ok(clip);
        }
    }

    let clip = entry
        .virtual_select
        .clip_extent_match(&entry.source_select, extent, incl_trail)?;
    trace!(source = %src.dset_name, extent, clip, "resolved unlimited source");
    entry.unlim_extent_source = Some(extent);
    entry.clip_size_virtual = Some(clip);
    entry.clip_incl_trail = incl_trail;
    Ok(clip)
}

/// Probe printf blocks and return the virtual size they cover.
fn resolve_printf(
    env: &SourceEnv,
    fapl: FileAccessProps,
    entry: &mut MappingEntry,
    view: ViewPolicy,
    gap: u64,
) -> Result<u64> {
    let u = entry.unlim_dim_virtual.ok_or_else(|| {
        VdsError::BadSelection("printf mapping without an unlimited dimension".to_string())
    })?;
    let Sources::Printf(p) = &mut entry.sources else {
        return Err(VdsError::BadValue("single mapping resolved as printf".to_string()));
    };

    if gap > PRINTF_GAP_LIMIT {
        debug!(gap, limit = PRINTF_GAP_LIMIT, "clamping printf gap");
    }
    let gap = gap.min(PRINTF_GAP_LIMIT);

    let mut first_missing = 0usize;
    let mut j = 0usize;
    while (j as u64) <= (first_missing as u64).saturating_add(gap) {
        p.ensure(j)?;
        let sub = &mut p.sub_dsets[j];
        if sub.exists == Existence::Found {
            first_missing = j + 1;
            j += 1;
            continue;
        }

        init_sub_dataset(
            &entry.virtual_select,
            &entry.source_file,
            &entry.source_dset,
            sub,
            j,
        )?;
        let found = open_source(
            env,
            fapl,
            sub,
            &mut entry.source_select,
            &mut entry.source_space_status,
        )?;
        trace!(block = j, file = %sub.file_name, dataset = %sub.dset_name, found, "probed printf source");
        if found {
            first_missing = j + 1;
            sub.close();
        }
        j += 1;
    }
    p.nused = first_missing;

    let clip = if first_missing == 0 {
        0
    } else {
        match view {
            ViewPolicy::LastAvailable => {
                let last = entry.virtual_select.unlim_block(first_missing as u64 - 1)?;
                last.bounds().map_or(0, |(_, hi)| hi[u] + 1)
            }
            ViewPolicy::FirstMissing => {
                let next = entry.virtual_select.unlim_block(first_missing as u64)?;
                next.bounds().map_or(0, |(lo, _)| lo[u])
            }
        }
    };
    entry.clip_size_virtual = Some(clip);
    Ok(clip)
}
