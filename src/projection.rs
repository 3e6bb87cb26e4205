//! Per-request projection of the file selection onto each mapping.
//!
//! Before a transfer every mapping, and every printf block the request
//! touches, gets the part of the caller's memory selection that lands in
//! it. Sources are opened on demand; a source that can't be opened
//! contributes nothing and its elements are filled on read.

use crate::dataspace::Dataspace;
use crate::error::Result;
use crate::extent::init_sub_dataset;
use crate::layout::{open_source, Clipped, Sources, VirtualLayout};
use crate::selection::Selection;
use std::ops::{Deref, DerefMut};
use tracing::trace;

impl VirtualLayout {
    /// Compute projected memory selections for a transfer between
    /// `file_space` (in the virtual extent) and `mem_space`. Returns how
    /// many elements of the request are backed by an open source.
    pub(crate) fn pre_io(&mut self, file_space: &Dataspace, mem_space: &Dataspace) -> Result<u64> {
        if !self.initialized {
            self.init_all(file_space.dims())?;
        }
        let env = self.env()?.clone();
        let fapl = self.source_fapl;
        let vdims = file_space.dims().to_vec();
        let bounds = file_space.bounds();

        let mut total = 0u64;
        for entry in &mut self.mappings {
            match &mut entry.sources {
                Sources::Single(src) => {
                    let Some(clipped) = entry.clipped_virtual.resolve(&entry.virtual_select) else {
                        continue;
                    };
                    let projected = Dataspace::project_intersection(file_space, mem_space, clipped)?;
                    let n = projected.npoints();
                    if n == 0 {
                        continue;
                    }
                    if open_source(
                        &env,
                        fapl,
                        src,
                        &mut entry.source_select,
                        &mut entry.source_space_status,
                    )? {
                        src.projected_mem = Some(projected);
                        total += n;
                    }
                }
                Sources::Printf(p) => {
                    let Some(u) = entry.unlim_dim_virtual else {
                        continue;
                    };
                    let Some((lo, hi)) = bounds.as_ref() else {
                        p.io_start = 0;
                        p.io_end = 0;
                        continue;
                    };
                    let start = entry.virtual_select.first_inc_block(lo[u])?.0;
                    let (end, partial) = entry.virtual_select.first_inc_block(hi[u] + 1)?;
                    let end = end + u64::from(partial);
                    p.io_end = usize::try_from(end).map_or(p.nused, |e| e.min(p.nused));
                    p.io_start = usize::try_from(start).map_or(p.io_end, |s| s.min(p.io_end));

                    for j in p.io_start..p.io_end {
                        p.ensure(j)?;
                        let sub = &mut p.sub_dsets[j];
                        init_sub_dataset(
                            &entry.virtual_select,
                            &entry.source_file,
                            &entry.source_dset,
                            sub,
                            j,
                        )?;

                        if sub.clipped_virtual.is_unset() {
                            if !open_source(
                                &env,
                                fapl,
                                sub,
                                &mut entry.source_select,
                                &mut entry.source_space_status,
                            )? {
                                continue;
                            }
                            let Some(block) = sub.virtual_select.as_ref() else {
                                continue;
                            };
                            let clipped = clip_to_extent(block, &vdims)?;
                            let source = Dataspace::project_intersection(
                                block,
                                &entry.source_select,
                                &clipped,
                            )?;
                            sub.clipped_virtual = Clipped::Own(clipped);
                            sub.clipped_source = Clipped::Own(source);
                        }

                        let Some(block) = sub.virtual_select.as_ref() else {
                            continue;
                        };
                        let Some(clipped) = sub.clipped_virtual.resolve(block) else {
                            continue;
                        };
                        let projected =
                            Dataspace::project_intersection(file_space, mem_space, clipped)?;
                        let n = projected.npoints();
                        if n == 0 {
                            continue;
                        }
                        if open_source(
                            &env,
                            fapl,
                            sub,
                            &mut entry.source_select,
                            &mut entry.source_space_status,
                        )? {
                            sub.projected_mem = Some(projected);
                            total += n;
                        }
                    }
                }
            }
        }

        trace!(requested = file_space.npoints(), mapped = total, "projected request");
        Ok(total)
    }

    /// Drop the projections made by [`pre_io`](Self::pre_io). Sources stay
    /// open.
    pub(crate) fn post_io(&mut self) {
        for entry in &mut self.mappings {
            for src in entry.sources_mut() {
                src.projected_mem = None;
            }
        }
    }

    /// Memory selections of every source taking part in the current
    /// request.
    pub(crate) fn projected_mem_spaces(&self) -> Vec<&Dataspace> {
        self.mappings
            .iter()
            .flat_map(|m| m.sources_ref())
            .filter_map(|s| s.projected_mem.as_ref())
            .collect()
    }
}

/// `space`'s selection cut to the extent `dims`.
fn clip_to_extent(space: &Dataspace, dims: &[u64]) -> Result<Dataspace> {
    let extent = crate::selection::Block::new(vec![0; dims.len()], dims.to_vec());
    let blocks = space
        .selection()
        .boxes(space.dims())?
        .iter()
        .filter_map(|b| b.intersect(&extent))
        .collect();
    let mut clipped = space.clone();
    clipped.set_selection(Selection::from_blocks(blocks))?;
    Ok(clipped)
}

/// A layout with projections in place. Dropping it runs
/// [`VirtualLayout::post_io`], on success and on error alike.
pub(crate) struct ProjectionGuard<'a> {
    layout: &'a mut VirtualLayout,
}

impl<'a> ProjectionGuard<'a> {
    pub(crate) fn new(layout: &'a mut VirtualLayout) -> Self {
        Self { layout }
    }
}

impl Deref for ProjectionGuard<'_> {
    type Target = VirtualLayout;

    fn deref(&self) -> &VirtualLayout {
        self.layout
    }
}

impl DerefMut for ProjectionGuard<'_> {
    fn deref_mut(&mut self) -> &mut VirtualLayout {
        self.layout
    }
}

impl Drop for ProjectionGuard<'_> {
    fn drop(&mut self) {
        self.layout.post_io();
    }
}
