//! Dataspaces: an extent plus a selection within it.
//!
//! Besides construction and hyperslab set operations this module carries the
//! selection algebra the virtual layout consumes: clipping of unlimited
//! selections, block enumeration, projection of intersections between
//! spaces, and subtraction.
//!
//! Element-level work is done on *runs*: maximal stretches of consecutive
//! row-major offsets within a [`Linearizer`]'s index space, listed in the
//! selection's iteration order.

use crate::error::{Result, VdsError};
use crate::selection::{Block, RegularHyperslab, Selection, UNLIMITED};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How a new hyperslab combines with the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOp {
    Set,
    Or,
    And,
}

/// An N-dimensional extent with a selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataspace {
    dims: Vec<u64>,
    max_dims: Vec<u64>,
    selection: Selection,
}

impl Dataspace {
    /// A rank-0 space holding one element.
    pub fn scalar() -> Self {
        Self {
            dims: Vec::new(),
            max_dims: Vec::new(),
            selection: Selection::All,
        }
    }

    /// A fixed-size space with everything selected.
    pub fn simple(dims: &[u64]) -> Self {
        Self {
            dims: dims.to_vec(),
            max_dims: dims.to_vec(),
            selection: Selection::All,
        }
    }

    /// A space that may grow up to `max_dims` ([`UNLIMITED`] for no bound).
    pub fn with_max(dims: &[u64], max_dims: &[u64]) -> Result<Self> {
        if dims.len() != max_dims.len() {
            return Err(VdsError::BadValue(
                "current and maximum dimensions have different ranks".to_string(),
            ));
        }
        if let Some(d) = (0..dims.len()).find(|&d| dims[d] > max_dims[d]) {
            return Err(VdsError::BadValue(format!(
                "dimension {} exceeds its maximum ({} > {})",
                d, dims[d], max_dims[d]
            )));
        }
        Ok(Self {
            dims: dims.to_vec(),
            max_dims: max_dims.to_vec(),
            selection: Selection::All,
        })
    }

    /// Replace the selection, checking its rank.
    pub fn with_selection(mut self, selection: Selection) -> Result<Self> {
        self.set_selection(selection)?;
        Ok(self)
    }

    /// Placeholder space for a selection read back from storage, before its
    /// real extent is known. The extent just covers the selection.
    pub fn from_decoded(selection: Selection, rank: usize) -> Self {
        let (dims, max_dims) = match selection.bounds(&vec![0; rank]) {
            Some((lo, hi)) => {
                let dims: Vec<u64> = (0..lo.len())
                    .map(|d| if hi[d] == UNLIMITED { lo[d] } else { hi[d] + 1 })
                    .collect();
                let max_dims = (0..lo.len())
                    .map(|d| if hi[d] == UNLIMITED { UNLIMITED } else { dims[d] })
                    .collect();
                (dims, max_dims)
            }
            None => (vec![0; rank], vec![0; rank]),
        };
        Self {
            dims,
            max_dims,
            selection,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn max_dims(&self) -> &[u64] {
        &self.max_dims
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Number of elements in the extent.
    pub fn extent_npoints(&self) -> u64 {
        self.dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
    }

    /// Change the current extent within the maximum. The selection is kept.
    pub fn set_extent(&mut self, dims: &[u64]) -> Result<()> {
        if dims.len() != self.rank() {
            return Err(VdsError::BadValue(format!(
                "extent of rank {} for a space of rank {}",
                dims.len(),
                self.rank()
            )));
        }
        if let Some(d) = (0..dims.len()).find(|&d| dims[d] > self.max_dims[d]) {
            return Err(VdsError::BadValue(format!(
                "dimension {} cannot grow past {}",
                d, self.max_dims[d]
            )));
        }
        self.dims = dims.to_vec();
        Ok(())
    }

    /// Take over another space's extent, keeping this selection.
    pub fn copy_extent_from(&mut self, other: &Dataspace) {
        self.dims = other.dims.clone();
        self.max_dims = other.max_dims.clone();
    }

    pub fn select_all(&mut self) {
        self.selection = Selection::All;
    }

    pub fn select_none(&mut self) {
        self.selection = Selection::None;
    }

    /// Select one contiguous box.
    pub fn select_slice(&mut self, ranges: &[Range<u64>]) -> Result<()> {
        self.set_selection(Selection::Regular(RegularHyperslab::from_ranges(ranges)))
    }

    /// Combine a hyperslab with the current selection. Stride and block
    /// default to 1.
    pub fn select_hyperslab(
        &mut self,
        op: SelectOp,
        start: &[u64],
        stride: Option<&[u64]>,
        count: &[u64],
        block: Option<&[u64]>,
    ) -> Result<()> {
        let rank = start.len();
        let ones = vec![1u64; rank];
        let hyper = RegularHyperslab::new(
            start.to_vec(),
            stride.unwrap_or(&ones).to_vec(),
            count.to_vec(),
            block.unwrap_or(&ones).to_vec(),
        )?;
        self.check_rank(rank)?;

        if op == SelectOp::Set {
            self.selection = Selection::Regular(hyper);
            return Ok(());
        }
        if hyper.unlimited_dim().is_some() || self.unlimited_dim().is_some() {
            return Err(VdsError::BadSelection(
                "set operations on unlimited hyperslabs are not supported".to_string(),
            ));
        }

        self.selection = match (&self.selection, op) {
            (Selection::Points(_), _) => {
                return Err(VdsError::BadSelection(
                    "cannot combine a hyperslab with a point selection".to_string(),
                ))
            }
            (Selection::None, SelectOp::Or) => Selection::Regular(hyper),
            (Selection::None, _) => Selection::None,
            (Selection::All, SelectOp::Or) => Selection::All,
            (Selection::All, _) => Selection::Regular(hyper),
            (current, SelectOp::Or) => {
                let mut blocks = current.boxes(&self.dims)?;
                for add in hyper.to_blocks()? {
                    let mut pieces = vec![add];
                    for existing in &blocks {
                        pieces = pieces.iter().flat_map(|p| p.subtract(existing)).collect();
                    }
                    blocks.extend(pieces);
                }
                Selection::from_blocks(blocks)
            }
            (current, _) => {
                let mine = current.boxes(&self.dims)?;
                let theirs = hyper.to_blocks()?;
                let blocks = mine
                    .iter()
                    .flat_map(|a| theirs.iter().filter_map(move |b| a.intersect(b)))
                    .collect();
                Selection::from_blocks(blocks)
            }
        };
        Ok(())
    }

    /// Select individual points, visited in the given order.
    pub fn select_points(&mut self, points: Vec<Vec<u64>>) -> Result<()> {
        self.set_selection(Selection::Points(points))
    }

    pub fn set_selection(&mut self, selection: Selection) -> Result<()> {
        match &selection {
            Selection::None | Selection::All => {}
            Selection::Points(points) => {
                for p in points {
                    self.check_rank(p.len())?;
                }
            }
            Selection::Regular(h) => self.check_rank(h.rank())?,
            Selection::Irregular(blocks) => {
                for b in blocks {
                    self.check_rank(b.start.len())?;
                }
            }
        }
        self.selection = selection;
        Ok(())
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank != self.rank() {
            return Err(VdsError::BadSelection(format!(
                "selection of rank {} in a space of rank {}",
                rank,
                self.rank()
            )));
        }
        Ok(())
    }

    /// Number of selected elements, or [`UNLIMITED`].
    pub fn npoints(&self) -> u64 {
        self.selection.npoints(&self.dims)
    }

    /// Inclusive bounding box of the selection.
    pub fn bounds(&self) -> Option<(Vec<u64>, Vec<u64>)> {
        self.selection.bounds(&self.dims)
    }

    pub fn unlimited_dim(&self) -> Option<usize> {
        self.selection.unlimited_dim()
    }

    pub fn is_hyperslab(&self) -> bool {
        self.selection.is_hyperslab()
    }

    fn regular(&self) -> Result<&RegularHyperslab> {
        match &self.selection {
            Selection::Regular(h) => Ok(h),
            _ => Err(VdsError::BadSelection(
                "operation needs a regular hyperslab".to_string(),
            )),
        }
    }

    pub fn num_elem_non_unlim(&self) -> Result<u64> {
        Ok(self.regular()?.num_elem_non_unlim())
    }

    /// Clip the unlimited dimension of the selection to `clip_size`.
    pub fn clip_unlim(&mut self, clip_size: u64) -> Result<()> {
        let clipped = self.regular()?.clip_unlim(clip_size)?;
        self.selection = clipped;
        Ok(())
    }

    /// Extent along the unlimited dimension that holds `clip_size` elements.
    pub fn clip_extent(&self, clip_size: u64, incl_trail: bool) -> Result<u64> {
        self.regular()?.clip_extent(clip_size, incl_trail)
    }

    /// Extent along this selection's unlimited dimension matching the
    /// slices `matching` holds within `match_clip_size`.
    pub fn clip_extent_match(
        &self,
        matching: &Dataspace,
        match_clip_size: u64,
        incl_trail: bool,
    ) -> Result<u64> {
        self.regular()?
            .clip_extent_match(matching.regular()?, match_clip_size, incl_trail)
    }

    /// This space with the selection narrowed to unlimited block `j`.
    pub fn unlim_block(&self, j: u64) -> Result<Dataspace> {
        Ok(Self {
            dims: self.dims.clone(),
            max_dims: self.max_dims.clone(),
            selection: Selection::Regular(self.regular()?.unlim_block(j)?),
        })
    }

    /// First block along the unlimited dimension not complete within
    /// `clip_size`, and whether it is partially inside.
    pub fn first_inc_block(&self, clip_size: u64) -> Result<(u64, bool)> {
        self.regular()?.first_inc_block(clip_size)
    }

    /// Project the elements of `src` that fall in `isect` onto `dst`.
    ///
    /// `src` and `dst` must select the same number of elements. The result
    /// selects, in `dst`'s extent, the elements at the same iteration
    /// ordinals as the `src` elements inside `isect` (which lives in `src`'s
    /// index space).
    pub fn project_intersection(
        src: &Dataspace,
        dst: &Dataspace,
        isect: &Dataspace,
    ) -> Result<Dataspace> {
        let npoints = src.npoints();
        if npoints != dst.npoints() {
            return Err(VdsError::BadSelection(format!(
                "projection between selections of {} and {} elements",
                npoints,
                dst.npoints()
            )));
        }

        let lin = Linearizer::covering(&[src, isect])?;
        let src_runs = src.runs(&lin)?;
        let isect_runs = isect.sorted_runs(&lin)?;

        let mut ordinals: Vec<Run> = Vec::new();
        let mut ord = 0u64;
        for r in &src_runs {
            let mut i = isect_runs.partition_point(|x| x.end() <= r.offset);
            while i < isect_runs.len() && isect_runs[i].offset < r.end() {
                let lo = r.offset.max(isect_runs[i].offset);
                let hi = r.end().min(isect_runs[i].end());
                push_run(&mut ordinals, ord + (lo - r.offset), hi - lo);
                i += 1;
            }
            ord += r.len;
        }

        let dst_lin = Linearizer::covering(&[dst])?;
        let dst_runs = dst.runs(&dst_lin)?;
        let picked = pick_ordinals(&dst_runs, &ordinals)?;
        Ok(dst.respan(picked, &dst_lin))
    }

    /// The elements of this selection not selected by any of `others`.
    pub fn subtract(&self, others: &[&Dataspace]) -> Result<Dataspace> {
        let mut spaces = vec![self];
        spaces.extend_from_slice(others);
        let lin = Linearizer::covering(&spaces)?;

        let mut cut = Vec::new();
        for other in others {
            cut.extend(other.runs(&lin)?);
        }
        let cut = coalesce(cut);

        let mut left = Vec::new();
        for r in self.runs(&lin)? {
            let mut a = r.offset;
            let end = r.end();
            let mut i = cut.partition_point(|c| c.end() <= a);
            while a < end {
                if i < cut.len() && cut[i].offset < end {
                    if cut[i].offset > a {
                        left.push(Run::new(a, cut[i].offset - a));
                    }
                    a = a.max(cut[i].end());
                    i += 1;
                } else {
                    left.push(Run::new(a, end - a));
                    break;
                }
            }
        }
        Ok(self.respan(left, &lin))
    }

    /// Runs of this selection in iteration order.
    pub(crate) fn runs(&self, lin: &Linearizer) -> Result<Vec<Run>> {
        match &self.selection {
            Selection::None => Ok(Vec::new()),
            Selection::Points(points) => Ok(points
                .iter()
                .map(|p| Run::new(lin.offset(p), 1))
                .collect()),
            Selection::Regular(h) => {
                let mut runs = Vec::new();
                regular_runs(h, lin, &mut runs)?;
                Ok(runs)
            }
            other => {
                let mut runs = Vec::new();
                for b in other.boxes(&self.dims)? {
                    box_runs(&b, lin, &mut runs);
                }
                Ok(coalesce(runs))
            }
        }
    }

    /// Runs sorted by offset with duplicates merged.
    fn sorted_runs(&self, lin: &Linearizer) -> Result<Vec<Run>> {
        Ok(coalesce(self.runs(lin)?))
    }

    /// A space with this extent selecting `runs`, keeping the point or
    /// hyperslab flavour of this selection.
    fn respan(&self, runs: Vec<Run>, lin: &Linearizer) -> Dataspace {
        let selection = if runs.is_empty() {
            Selection::None
        } else if matches!(self.selection, Selection::Points(_)) {
            Selection::Points(
                runs.iter()
                    .flat_map(|r| r.offset..r.end())
                    .map(|off| lin.coords(off))
                    .collect(),
            )
        } else if self.rank() == 0 {
            Selection::All
        } else {
            Selection::from_blocks(blocks_from_runs(&runs, lin))
        };
        Dataspace {
            dims: self.dims.clone(),
            max_dims: self.max_dims.clone(),
            selection,
        }
    }
}

/// A stretch of consecutive linear offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Run {
    pub offset: u64,
    pub len: u64,
}

impl Run {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Row-major mapping between coordinates and linear offsets.
#[derive(Debug, Clone)]
pub(crate) struct Linearizer {
    dims: Vec<u64>,
    strides: Vec<u64>,
}

impl Linearizer {
    fn from_dims(dims: Vec<u64>) -> Result<Self> {
        let mut strides = vec![1u64; dims.len()];
        for d in (0..dims.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1].checked_mul(dims[d + 1].max(1)).ok_or_else(|| {
                VdsError::BadSelection("index space too large to address".to_string())
            })?;
        }
        Ok(Self { dims, strides })
    }

    /// The space's own extent. The selection must lie inside it.
    pub fn exact(space: &Dataspace) -> Result<Self> {
        if space.unlimited_dim().is_some() {
            return Err(VdsError::BadSelection(
                "cannot address an unlimited selection".to_string(),
            ));
        }
        if let Some((_, hi)) = space.bounds() {
            if let Some(d) = (0..hi.len()).find(|&d| hi[d] >= space.dims[d]) {
                return Err(VdsError::BadSelection(format!(
                    "selection reaches {} in dimension {} of extent {}",
                    hi[d], d, space.dims[d]
                )));
            }
        }
        Self::from_dims(space.dims.clone())
    }

    /// An index space covering every space's extent and selection.
    pub fn covering(spaces: &[&Dataspace]) -> Result<Self> {
        let rank = spaces.first().map_or(0, |s| s.rank());
        let mut dims = vec![0u64; rank];
        for space in spaces {
            if space.rank() != rank {
                return Err(VdsError::BadSelection(format!(
                    "spaces of rank {} and {} cannot be combined",
                    rank,
                    space.rank()
                )));
            }
            if space.unlimited_dim().is_some() {
                return Err(VdsError::BadSelection(
                    "cannot address an unlimited selection".to_string(),
                ));
            }
            for d in 0..rank {
                dims[d] = dims[d].max(space.dims[d]);
            }
            if let Some((_, hi)) = space.bounds() {
                for d in 0..rank {
                    dims[d] = dims[d].max(hi[d] + 1);
                }
            }
        }
        Self::from_dims(dims)
    }

    pub fn offset(&self, coords: &[u64]) -> u64 {
        coords.iter().zip(&self.strides).map(|(c, s)| c * s).sum()
    }

    pub fn coords(&self, offset: u64) -> Vec<u64> {
        let mut rem = offset;
        self.strides
            .iter()
            .map(|&s| {
                let c = rem / s;
                rem %= s;
                c
            })
            .collect()
    }
}

/// Walk two run lists in lockstep by element ordinal, calling
/// `f(a_offset, b_offset, len)` for each common stretch.
pub(crate) fn zip_runs<F>(a: &[Run], b: &[Run], mut f: F) -> Result<()>
where
    F: FnMut(u64, u64, u64) -> Result<()>,
{
    let total_a: u64 = a.iter().map(|r| r.len).sum();
    let total_b: u64 = b.iter().map(|r| r.len).sum();
    if total_a != total_b {
        return Err(VdsError::BadSelection(format!(
            "selections of {} and {} elements cannot be paired",
            total_a, total_b
        )));
    }

    let (mut i, mut j) = (0, 0);
    let (mut used_a, mut used_b) = (0u64, 0u64);
    while i < a.len() && j < b.len() {
        let n = (a[i].len - used_a).min(b[j].len - used_b);
        f(a[i].offset + used_a, b[j].offset + used_b, n)?;
        used_a += n;
        used_b += n;
        if used_a == a[i].len {
            i += 1;
            used_a = 0;
        }
        if used_b == b[j].len {
            j += 1;
            used_b = 0;
        }
    }
    Ok(())
}

fn push_run(runs: &mut Vec<Run>, offset: u64, len: u64) {
    if let Some(last) = runs.last_mut() {
        if last.end() == offset {
            last.len += len;
            return;
        }
    }
    runs.push(Run::new(offset, len));
}

/// Sort and merge touching or overlapping runs.
fn coalesce(mut runs: Vec<Run>) -> Vec<Run> {
    runs.sort_unstable_by_key(|r| r.offset);
    let mut out: Vec<Run> = Vec::with_capacity(runs.len());
    for r in runs {
        match out.last_mut() {
            Some(last) if r.offset <= last.end() => {
                let end = last.end().max(r.end());
                last.len = end - last.offset;
            }
            _ => out.push(r),
        }
    }
    out
}

fn box_runs(b: &Block, lin: &Linearizer, out: &mut Vec<Run>) {
    if b.is_empty() {
        return;
    }
    let rank = b.start.len();
    if rank == 0 {
        out.push(Run::new(0, 1));
        return;
    }
    let last = rank - 1;
    let width = b.end[last] - b.start[last];
    let mut coords = b.start.clone();
    loop {
        out.push(Run::new(lin.offset(&coords), width));
        let mut d = last;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            coords[d] += 1;
            if coords[d] < b.end[d] {
                break;
            }
            coords[d] = b.start[d];
        }
    }
}

/// Runs of a regular hyperslab straight from its parameters, in row-major
/// order. Touching blocks along the last dimension merge.
fn regular_runs(h: &RegularHyperslab, lin: &Linearizer, out: &mut Vec<Run>) -> Result<()> {
    if h.unlimited_dim().is_some() {
        return Err(VdsError::BadSelection(
            "cannot enumerate an unlimited hyperslab".to_string(),
        ));
    }
    if h.count.iter().chain(&h.block).any(|&v| v == 0) {
        return Ok(());
    }
    let rank = h.rank();
    if rank == 0 {
        out.push(Run::new(0, 1));
        return Ok(());
    }
    let last = rank - 1;
    // (block index, offset inside the block) for each outer dimension
    let mut pos = vec![(0u64, 0u64); last];
    let mut coords = h.start.clone();
    loop {
        let base = lin.offset(&coords);
        for i in 0..h.count[last] {
            push_run(out, base + i * h.stride[last], h.block[last]);
        }

        let mut d = last;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            let (i, k) = &mut pos[d];
            *k += 1;
            if *k == h.block[d] {
                *k = 0;
                *i += 1;
            }
            if *i < h.count[d] {
                coords[d] = h.start[d] + *i * h.stride[d] + *k;
                break;
            }
            *i = 0;
            coords[d] = h.start[d];
        }
    }
}

/// Pick the elements of `runs` at the ordinal intervals `ordinals`.
fn pick_ordinals(runs: &[Run], ordinals: &[Run]) -> Result<Vec<Run>> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut base = 0u64;
    for o in ordinals {
        let mut a = o.offset;
        let b = o.end();
        while a < b {
            while i < runs.len() && base + runs[i].len <= a {
                base += runs[i].len;
                i += 1;
            }
            let Some(r) = runs.get(i) else {
                return Err(VdsError::BadSelection(
                    "ordinal beyond destination selection".to_string(),
                ));
            };
            let take = b.min(base + r.len) - a;
            push_run(&mut out, r.offset + (a - base), take);
            a += take;
        }
    }
    Ok(out)
}

/// Rebuild boxes from runs, splitting at row ends and stacking rows that
/// line up.
fn blocks_from_runs(runs: &[Run], lin: &Linearizer) -> Vec<Block> {
    let rank = lin.dims.len();
    let last = rank - 1;
    let row = lin.dims[last];
    let mut blocks: Vec<Block> = Vec::new();

    for r in runs {
        let mut off = r.offset;
        let mut left = r.len;
        while left > 0 {
            let start = lin.coords(off);
            let x = start[last];
            let take = left.min(row - x);
            let mut end: Vec<u64> = start.iter().map(|c| c + 1).collect();
            end[last] = x + take;
            let piece = Block::new(start, end);

            let stacked = rank >= 2
                && blocks
                    .last_mut()
                    .is_some_and(|prev| stack_onto(prev, &piece, rank - 2));
            if !stacked {
                blocks.push(piece);
            }
            off += take;
            left -= take;
        }
    }
    blocks
}

fn stack_onto(prev: &mut Block, next: &Block, d: usize) -> bool {
    let aligned = prev.end[d] == next.start[d]
        && (0..prev.start.len())
            .filter(|&k| k != d)
            .all(|k| prev.start[k] == next.start[k] && prev.end[k] == next.end[k]);
    if aligned {
        prev.end[d] = next.end[d];
    }
    aligned
}
