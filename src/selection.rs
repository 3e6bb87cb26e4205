//! Hyperslab, point and whole-extent selections.
//!
//! A [`Selection`] describes which elements of an N-dimensional extent take
//! part in an operation. Hyperslabs come in two shapes: a
//! [`RegularHyperslab`] (start, stride, count and block per dimension, with
//! at most one unlimited count or block) and an irregular union of disjoint
//! [`Block`]s, which is what clipping and projection produce.
//!
//! Hyperslab elements are visited in row-major coordinate order; points are
//! visited in the order they were listed.

use crate::error::{Result, VdsError};
use crate::utils::{take_u32, take_u64, take_u8};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Marker for an unlimited extent, count or block.
pub const UNLIMITED: u64 = u64::MAX;

/// Selection class codes used by the serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SelectionType {
    None = 0,
    Points = 1,
    Hyperslabs = 2,
    All = 3,
}

impl SelectionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SelectionType::None),
            1 => Some(SelectionType::Points),
            2 => Some(SelectionType::Hyperslabs),
            3 => Some(SelectionType::All),
            _ => None,
        }
    }
}

const HYPER_VERSION_IRREGULAR: u32 = 1;
const HYPER_VERSION_REGULAR: u32 = 2;
const HYPER_FLAG_REGULAR: u8 = 0x01;
const SIMPLE_VERSION: u32 = 1;

/// A regular hyperslab: `count` blocks of `block` elements spaced `stride`
/// apart, starting at `start`, in every dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularHyperslab {
    pub start: Vec<u64>,
    pub stride: Vec<u64>,
    pub count: Vec<u64>,
    pub block: Vec<u64>,
}

impl RegularHyperslab {
    /// Validate and build a regular hyperslab.
    pub fn new(start: Vec<u64>, stride: Vec<u64>, count: Vec<u64>, block: Vec<u64>) -> Result<Self> {
        let rank = start.len();
        if stride.len() != rank || count.len() != rank || block.len() != rank {
            return Err(VdsError::BadSelection(
                "hyperslab parameters have different ranks".to_string(),
            ));
        }

        let mut unlimited = None;
        for d in 0..rank {
            let count_unlim = count[d] == UNLIMITED;
            let block_unlim = block[d] == UNLIMITED;
            if count_unlim || block_unlim {
                if count_unlim && block_unlim {
                    return Err(VdsError::BadSelection(format!(
                        "count and block are both unlimited in dimension {}",
                        d
                    )));
                }
                if unlimited.is_some() {
                    return Err(VdsError::BadSelection(
                        "more than one unlimited dimension in hyperslab".to_string(),
                    ));
                }
                if block_unlim && count[d] != 1 {
                    return Err(VdsError::BadSelection(
                        "unlimited block requires a count of 1".to_string(),
                    ));
                }
                unlimited = Some(d);
            }
            if stride[d] == 0 {
                return Err(VdsError::BadSelection(format!(
                    "zero stride in dimension {}",
                    d
                )));
            }
            if count[d] > 1 && !block_unlim && stride[d] < block[d] {
                return Err(VdsError::BadSelection("hyperslab blocks overlap".to_string()));
            }
            let reach = if block_unlim || count[d] == 0 {
                Some(start[d])
            } else if count_unlim {
                start[d].checked_add(block[d])
            } else {
                (count[d] - 1)
                    .checked_mul(stride[d])
                    .and_then(|off| off.checked_add(block[d]))
                    .and_then(|len| start[d].checked_add(len))
            };
            if reach.is_none() {
                return Err(VdsError::BadSelection(format!(
                    "hyperslab end overflows in dimension {}",
                    d
                )));
            }
        }

        Ok(Self {
            start,
            stride,
            count,
            block,
        })
    }

    /// One contiguous block covering `ranges`.
    pub fn from_ranges(ranges: &[Range<u64>]) -> Self {
        let rank = ranges.len();
        let mut start = Vec::with_capacity(rank);
        let mut count = Vec::with_capacity(rank);
        let mut block = Vec::with_capacity(rank);
        for r in ranges {
            let len = r.end.saturating_sub(r.start);
            start.push(r.start);
            count.push(if len == 0 { 0 } else { 1 });
            block.push(len.max(1));
        }
        Self {
            start,
            stride: vec![1; rank],
            count,
            block,
        }
    }

    pub fn rank(&self) -> usize {
        self.start.len()
    }

    /// The dimension holding the unlimited count or block, if any.
    pub fn unlimited_dim(&self) -> Option<usize> {
        (0..self.rank()).find(|&d| self.count[d] == UNLIMITED || self.block[d] == UNLIMITED)
    }

    /// Number of selected elements, or [`UNLIMITED`].
    pub fn npoints(&self) -> u64 {
        if self.unlimited_dim().is_some() {
            return UNLIMITED;
        }
        self.count
            .iter()
            .zip(&self.block)
            .fold(1u64, |acc, (&c, &b)| acc.saturating_mul(c.saturating_mul(b)))
    }

    /// Product of `count * block` over every dimension but the unlimited one.
    pub fn num_elem_non_unlim(&self) -> u64 {
        let unlim = self.unlimited_dim();
        (0..self.rank())
            .filter(|&d| Some(d) != unlim)
            .fold(1u64, |acc, d| {
                acc.saturating_mul(self.count[d].saturating_mul(self.block[d]))
            })
    }

    /// Inclusive bounding box. The end is [`UNLIMITED`] along an unlimited dimension.
    pub fn bounds(&self) -> Option<(Vec<u64>, Vec<u64>)> {
        if self.count.iter().chain(&self.block).any(|&v| v == 0) {
            return None;
        }
        let end = (0..self.rank())
            .map(|d| {
                if self.count[d] == UNLIMITED || self.block[d] == UNLIMITED {
                    UNLIMITED
                } else {
                    self.start[d] + (self.count[d] - 1) * self.stride[d] + self.block[d] - 1
                }
            })
            .collect();
        Some((self.start.clone(), end))
    }

    /// The half-open intervals selected along dimension `d`.
    fn dim_ranges(&self, d: usize) -> Vec<Range<u64>> {
        (0..self.count[d])
            .map(|i| {
                let s = self.start[d] + i * self.stride[d];
                s..s + self.block[d]
            })
            .collect()
    }

    /// Expand into disjoint blocks, row-major. The hyperslab must be finite.
    pub fn to_blocks(&self) -> Result<Vec<Block>> {
        if self.unlimited_dim().is_some() {
            return Err(VdsError::BadSelection(
                "cannot enumerate an unlimited hyperslab".to_string(),
            ));
        }
        let rank = self.rank();
        let per_dim: Vec<Vec<Range<u64>>> = (0..rank).map(|d| self.dim_ranges(d)).collect();
        if per_dim.iter().any(|r| r.is_empty()) {
            return Ok(Vec::new());
        }

        let mut blocks = Vec::new();
        let mut idx = vec![0usize; rank];
        loop {
            blocks.push(Block {
                start: (0..rank).map(|d| per_dim[d][idx[d]].start).collect(),
                end: (0..rank).map(|d| per_dim[d][idx[d]].end).collect(),
            });

            let mut d = rank;
            loop {
                if d == 0 {
                    return Ok(blocks);
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < per_dim[d].len() {
                    break;
                }
                idx[d] = 0;
            }
        }
    }

    fn unlim(&self) -> Result<usize> {
        self.unlimited_dim().ok_or_else(|| {
            VdsError::BadSelection("hyperslab has no unlimited dimension".to_string())
        })
    }

    /// Extent along the unlimited dimension needed to hold `num_slices`
    /// slices. With `incl_trail` the gap after the last full block counts.
    pub fn clip_extent_real(&self, num_slices: u64, incl_trail: bool) -> Result<u64> {
        let u = self.unlim()?;
        let (start, stride, block) = (self.start[u], self.stride[u], self.block[u]);

        if num_slices == 0 {
            return Ok(if incl_trail { start } else { 0 });
        }
        if block == UNLIMITED || block == stride {
            return Ok(start + num_slices);
        }

        let count = num_slices / block;
        let rem = num_slices % block;
        Ok(if rem > 0 {
            start + count * stride + rem
        } else if incl_trail {
            start + count * stride
        } else {
            start + (count - 1) * stride + block
        })
    }

    /// Extent along the unlimited dimension that holds `clip_size` elements.
    pub fn clip_extent(&self, clip_size: u64, incl_trail: bool) -> Result<u64> {
        let non_unlim = self.num_elem_non_unlim();
        let slices = if non_unlim == 0 { 0 } else { clip_size / non_unlim };
        self.clip_extent_real(slices, incl_trail)
    }

    /// Extent this hyperslab must be clipped to so that it holds as many
    /// slices as `matching` has within an extent of `match_clip_size`.
    pub fn clip_extent_match(
        &self,
        matching: &RegularHyperslab,
        match_clip_size: u64,
        incl_trail: bool,
    ) -> Result<u64> {
        self.unlim()?;
        let m = matching.unlim()?;
        let (start, stride, block) = (matching.start[m], matching.stride[m], matching.block[m]);

        let num_slices = if match_clip_size <= start {
            0
        } else if block == UNLIMITED || block == stride {
            match_clip_size - start
        } else {
            let avail = match_clip_size - start;
            let mut slices = (avail / stride) * block + (avail % stride).min(block);
            if matching.count[m] != UNLIMITED {
                slices = slices.min(matching.count[m].saturating_mul(block));
            }
            slices
        };

        self.clip_extent_real(num_slices, incl_trail)
    }

    /// Clip the unlimited dimension to an extent of `clip_size`. A partial
    /// last block makes the result irregular.
    pub fn clip_unlim(&self, clip_size: u64) -> Result<Selection> {
        let u = self.unlim()?;
        let start = self.start[u];
        if clip_size <= start {
            return Ok(Selection::None);
        }

        let mut out = self.clone();
        if self.block[u] == UNLIMITED {
            out.block[u] = clip_size - start;
            return Ok(Selection::Regular(out));
        }

        let stride = self.stride[u];
        let count = (clip_size - start + stride - 1) / stride;
        let last_start = start + (count - 1) * stride;
        if last_start + self.block[u] <= clip_size {
            out.count[u] = count;
            return Ok(Selection::Regular(out));
        }

        let partial = clip_size - last_start;
        if count == 1 {
            out.count[u] = 1;
            out.block[u] = partial;
            return Ok(Selection::Regular(out));
        }

        out.count[u] = count - 1;
        let mut blocks = out.to_blocks()?;
        let mut tail = self.clone();
        tail.start[u] = last_start;
        tail.count[u] = 1;
        tail.block[u] = partial;
        blocks.extend(tail.to_blocks()?);
        Ok(Selection::from_blocks(blocks))
    }

    /// The `j`-th block along the unlimited dimension.
    pub fn unlim_block(&self, j: u64) -> Result<RegularHyperslab> {
        let u = self.unlim()?;
        if self.count[u] != UNLIMITED {
            return Err(VdsError::BadSelection(
                "unlimited block has no block index".to_string(),
            ));
        }
        let mut out = self.clone();
        out.count[u] = 1;
        out.start[u] = self.start[u] + j * self.stride[u];
        Ok(out)
    }

    /// Index of the first block along the unlimited dimension that is not
    /// complete within `clip_size`, and whether that block is partially inside.
    pub fn first_inc_block(&self, clip_size: u64) -> Result<(u64, bool)> {
        let u = self.unlim()?;
        let (start, stride, block) = (self.start[u], self.stride[u], self.block[u]);
        if start >= clip_size {
            return Ok((0, false));
        }
        let index = (clip_size - start + stride - block) / stride;
        let partial = stride * index < clip_size - start;
        Ok((index, partial))
    }
}

/// A half-open N-D box, `start[d] <= x < end[d]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub start: Vec<u64>,
    pub end: Vec<u64>,
}

impl Block {
    pub fn new(start: Vec<u64>, end: Vec<u64>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.end).any(|(s, e)| s >= e)
    }

    pub fn npoints(&self) -> u64 {
        self.start
            .iter()
            .zip(&self.end)
            .fold(1u64, |acc, (&s, &e)| acc.saturating_mul(e.saturating_sub(s)))
    }

    pub fn intersect(&self, other: &Block) -> Option<Block> {
        let start: Vec<u64> = self.start.iter().zip(&other.start).map(|(a, b)| *a.max(b)).collect();
        let end: Vec<u64> = self.end.iter().zip(&other.end).map(|(a, b)| *a.min(b)).collect();
        let block = Block { start, end };
        (!block.is_empty()).then_some(block)
    }

    /// `self` minus `other`, as up to `2 * rank` disjoint boxes.
    pub fn subtract(&self, other: &Block) -> Vec<Block> {
        let Some(cut) = self.intersect(other) else {
            return vec![self.clone()];
        };
        let mut pieces = Vec::new();
        let mut rest = self.clone();
        for d in 0..self.start.len() {
            if rest.start[d] < cut.start[d] {
                let mut lower = rest.clone();
                lower.end[d] = cut.start[d];
                pieces.push(lower);
                rest.start[d] = cut.start[d];
            }
            if cut.end[d] < rest.end[d] {
                let mut upper = rest.clone();
                upper.start[d] = cut.end[d];
                pieces.push(upper);
                rest.end[d] = cut.end[d];
            }
        }
        pieces
    }
}

/// Which elements of an extent are selected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Selection {
    /// Nothing.
    None,
    /// Every element of the extent.
    #[default]
    All,
    /// Individual coordinates, in listing order.
    Points(Vec<Vec<u64>>),
    /// A regular, possibly unlimited, hyperslab.
    Regular(RegularHyperslab),
    /// A union of disjoint boxes.
    Irregular(Vec<Block>),
}

impl Selection {
    /// Build a hyperslab from disjoint blocks, dropping empty ones.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let blocks: Vec<Block> = blocks.into_iter().filter(|b| !b.is_empty()).collect();
        if blocks.is_empty() {
            Selection::None
        } else {
            Selection::Irregular(blocks)
        }
    }

    pub fn sel_type(&self) -> SelectionType {
        match self {
            Selection::None => SelectionType::None,
            Selection::All => SelectionType::All,
            Selection::Points(_) => SelectionType::Points,
            Selection::Regular(_) | Selection::Irregular(_) => SelectionType::Hyperslabs,
        }
    }

    pub fn is_hyperslab(&self) -> bool {
        self.sel_type() == SelectionType::Hyperslabs
    }

    pub fn unlimited_dim(&self) -> Option<usize> {
        match self {
            Selection::Regular(h) => h.unlimited_dim(),
            _ => None,
        }
    }

    /// Number of selected elements within `dims`, or [`UNLIMITED`].
    pub fn npoints(&self, dims: &[u64]) -> u64 {
        match self {
            Selection::None => 0,
            Selection::All => dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d)),
            Selection::Points(points) => points.len() as u64,
            Selection::Regular(h) => h.npoints(),
            Selection::Irregular(blocks) => blocks.iter().map(Block::npoints).sum(),
        }
    }

    /// Inclusive bounding box, or `None` when nothing is selected.
    pub fn bounds(&self, dims: &[u64]) -> Option<(Vec<u64>, Vec<u64>)> {
        match self {
            Selection::None => None,
            Selection::All => {
                if dims.iter().any(|&d| d == 0) {
                    None
                } else {
                    Some((vec![0; dims.len()], dims.iter().map(|d| d - 1).collect()))
                }
            }
            Selection::Points(points) => {
                let first = points.first()?;
                let mut lo = first.clone();
                let mut hi = first.clone();
                for p in &points[1..] {
                    for d in 0..p.len() {
                        lo[d] = lo[d].min(p[d]);
                        hi[d] = hi[d].max(p[d]);
                    }
                }
                Some((lo, hi))
            }
            Selection::Regular(h) => h.bounds(),
            Selection::Irregular(blocks) => {
                let first = blocks.first()?;
                let mut lo = first.start.clone();
                let mut hi: Vec<u64> = first.end.iter().map(|e| e - 1).collect();
                for b in &blocks[1..] {
                    for d in 0..lo.len() {
                        lo[d] = lo[d].min(b.start[d]);
                        hi[d] = hi[d].max(b.end[d] - 1);
                    }
                }
                Some((lo, hi))
            }
        }
    }

    /// Disjoint boxes covering the selection within `dims`.
    pub fn boxes(&self, dims: &[u64]) -> Result<Vec<Block>> {
        match self {
            Selection::None => Ok(Vec::new()),
            Selection::All => {
                let b = Block::new(vec![0; dims.len()], dims.to_vec());
                Ok(if b.is_empty() { Vec::new() } else { vec![b] })
            }
            Selection::Points(points) => Ok(points
                .iter()
                .map(|p| Block::new(p.clone(), p.iter().map(|c| c + 1).collect()))
                .collect()),
            Selection::Regular(h) => h.to_blocks(),
            Selection::Irregular(blocks) => Ok(blocks.clone()),
        }
    }

    /// Size in bytes of the serialized form.
    pub fn serial_size(&self, rank: usize) -> usize {
        match self {
            Selection::Regular(_) => 13 + self.body_len(rank),
            _ => 16 + self.body_len(rank),
        }
    }

    fn body_len(&self, rank: usize) -> usize {
        match self {
            Selection::None | Selection::All => 0,
            Selection::Points(points) => 8 + points.len() * rank * 4,
            Selection::Regular(_) => 4 + rank * 32,
            Selection::Irregular(blocks) => 8 + blocks.len() * rank * 8,
        }
    }

    /// Append the serialized form to `out`.
    pub fn encode(&self, rank: usize, out: &mut Vec<u8>) -> Result<()> {
        out.put_u32_le(self.sel_type() as u32);
        match self {
            Selection::None | Selection::All => {
                out.put_u32_le(SIMPLE_VERSION);
                out.put_u32_le(0);
                out.put_u32_le(0);
            }
            Selection::Regular(h) => {
                out.put_u32_le(HYPER_VERSION_REGULAR);
                out.put_u8(HYPER_FLAG_REGULAR);
                out.put_u32_le(self.body_len(rank) as u32);
                out.put_u32_le(rank as u32);
                for d in 0..rank {
                    out.put_u64_le(h.start[d]);
                    out.put_u64_le(h.stride[d]);
                    out.put_u64_le(h.count[d]);
                    out.put_u64_le(h.block[d]);
                }
            }
            Selection::Irregular(blocks) => {
                out.put_u32_le(HYPER_VERSION_IRREGULAR);
                out.put_u32_le(0);
                out.put_u32_le(self.body_len(rank) as u32);
                out.put_u32_le(rank as u32);
                out.put_u32_le(blocks.len() as u32);
                for b in blocks {
                    for &s in &b.start {
                        out.put_u32_le(narrow(s)?);
                    }
                    for &e in &b.end {
                        out.put_u32_le(narrow(e - 1)?);
                    }
                }
            }
            Selection::Points(points) => {
                out.put_u32_le(SIMPLE_VERSION);
                out.put_u32_le(0);
                out.put_u32_le(self.body_len(rank) as u32);
                out.put_u32_le(rank as u32);
                out.put_u32_le(points.len() as u32);
                for p in points {
                    for &c in p {
                        out.put_u32_le(narrow(c)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode one selection from the front of `buf`, advancing it. Returns
    /// the rank recorded in the encoding, if the selection class carries one.
    pub fn decode(buf: &mut &[u8]) -> Result<(Selection, Option<usize>)> {
        let raw_type = take_u32(buf)?;
        let sel_type = SelectionType::from_u32(raw_type)
            .ok_or_else(|| VdsError::Codec(format!("unknown selection type {}", raw_type)))?;
        let version = take_u32(buf)?;

        match sel_type {
            SelectionType::None | SelectionType::All => {
                expect_version(version, SIMPLE_VERSION)?;
                take_u32(buf)?;
                let len = take_u32(buf)?;
                if len != 0 {
                    return Err(VdsError::Codec(format!("unexpected selection length {}", len)));
                }
                let sel = if sel_type == SelectionType::None {
                    Selection::None
                } else {
                    Selection::All
                };
                Ok((sel, None))
            }
            SelectionType::Hyperslabs if version == HYPER_VERSION_REGULAR => {
                let flags = take_u8(buf)?;
                if flags & HYPER_FLAG_REGULAR == 0 {
                    return Err(VdsError::Codec(
                        "irregular hyperslab in regular encoding".to_string(),
                    ));
                }
                let len = take_u32(buf)? as usize;
                let rank = take_u32(buf)? as usize;
                if len != 4 + rank * 32 {
                    return Err(VdsError::Codec(format!("bad hyperslab length {}", len)));
                }
                let mut params = [
                    Vec::with_capacity(rank),
                    Vec::with_capacity(rank),
                    Vec::with_capacity(rank),
                    Vec::with_capacity(rank),
                ];
                for _ in 0..rank {
                    for p in params.iter_mut() {
                        p.push(take_u64(buf)?);
                    }
                }
                let [start, stride, count, block] = params;
                let h = RegularHyperslab::new(start, stride, count, block)
                    .map_err(|e| VdsError::Codec(e.to_string()))?;
                Ok((Selection::Regular(h), Some(rank)))
            }
            SelectionType::Hyperslabs => {
                expect_version(version, HYPER_VERSION_IRREGULAR)?;
                take_u32(buf)?;
                let len = take_u32(buf)? as usize;
                let rank = take_u32(buf)? as usize;
                let nblocks = take_u32(buf)? as usize;
                if len != 8 + nblocks * rank * 8 {
                    return Err(VdsError::Codec(format!("bad hyperslab length {}", len)));
                }
                let mut blocks = Vec::new();
                blocks.try_reserve(nblocks)?;
                for _ in 0..nblocks {
                    let start = (0..rank).map(|_| take_u32(buf).map(u64::from)).collect::<Result<Vec<_>>>()?;
                    let end = (0..rank)
                        .map(|_| take_u32(buf).map(|e| u64::from(e) + 1))
                        .collect::<Result<Vec<_>>>()?;
                    blocks.push(Block::new(start, end));
                }
                Ok((Selection::from_blocks(blocks), Some(rank)))
            }
            SelectionType::Points => {
                expect_version(version, SIMPLE_VERSION)?;
                take_u32(buf)?;
                let len = take_u32(buf)? as usize;
                let rank = take_u32(buf)? as usize;
                let npoints = take_u32(buf)? as usize;
                if len != 8 + npoints * rank * 4 {
                    return Err(VdsError::Codec(format!("bad point list length {}", len)));
                }
                let mut points = Vec::new();
                points.try_reserve(npoints)?;
                for _ in 0..npoints {
                    points.push(
                        (0..rank)
                            .map(|_| take_u32(buf).map(u64::from))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                Ok((Selection::Points(points), Some(rank)))
            }
        }
    }
}

fn narrow(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| VdsError::Codec(format!("coordinate {} too large to encode", value)))
}

fn expect_version(found: u32, expected: u32) -> Result<()> {
    if found != expected {
        return Err(VdsError::Codec(format!(
            "unsupported selection version {} (expected {})",
            found, expected
        )));
    }
    Ok(())
}
