//! Read, write and flush of a virtual dataset, and its [`LayoutOps`]
//! implementation.

use crate::dataspace::{Dataspace, Linearizer};
use crate::error::{Result, VdsError};
use crate::layout::{
    DatasetContext, IoRequest, LayoutOps, SourceDataset, Sources, VirtualLayout,
};
use crate::projection::ProjectionGuard;
use crate::selection::Selection;
use crate::types::StorageKind;
use tracing::{trace, warn};

impl VirtualLayout {
    fn check_request(&self, io: &IoRequest<'_>) -> Result<()> {
        let env = self.env()?;
        if env.vds_file.features().mpio {
            return Err(VdsError::Unsupported(
                "parallel I/O on virtual datasets".to_string(),
            ));
        }
        if matches!(io.file_space.selection(), Selection::Points(_)) {
            return Err(VdsError::BadSelection(
                "point selections in the virtual dataset".to_string(),
            ));
        }
        let (nfile, nmem) = (io.file_space.npoints(), io.mem_space.npoints());
        if nfile != nmem {
            return Err(VdsError::BadValue(format!(
                "file selection has {} elements, memory selection has {}",
                nfile, nmem
            )));
        }
        Ok(())
    }

    /// Every source taking part in the current request, with its clipped
    /// virtual and source selections.
    fn participants(&self) -> Vec<(&SourceDataset, &Dataspace, &Dataspace)> {
        let mut out = Vec::new();
        for entry in &self.mappings {
            match &entry.sources {
                Sources::Single(src) => {
                    if let (Some(cv), Some(cs)) = (
                        entry.clipped_virtual.resolve(&entry.virtual_select),
                        entry.clipped_source.resolve(&entry.source_select),
                    ) {
                        out.push((src, cv, cs));
                    }
                }
                Sources::Printf(p) => {
                    let range = p.io_start.min(p.sub_dsets.len())..p.io_end.min(p.sub_dsets.len());
                    for sub in &p.sub_dsets[range] {
                        let Some(block) = sub.virtual_select.as_ref() else {
                            continue;
                        };
                        if let (Some(cv), Some(cs)) = (
                            sub.clipped_virtual.resolve(block),
                            sub.clipped_source.resolve(&entry.source_select),
                        ) {
                            out.push((sub, cv, cs));
                        }
                    }
                }
            }
        }
        out.retain(|(src, _, _)| src.projected_mem.is_some() && src.dset.is_some());
        out
    }

    fn read_virtual(&mut self, io: &IoRequest<'_>, buf: &mut [u8]) -> Result<()> {
        self.check_request(io)?;
        let npoints = io.file_space.npoints();
        let dtype = self.env()?.dtype;

        let mut layout = ProjectionGuard::new(self);
        let total = layout.pre_io(io.file_space, io.mem_space)?;

        for (src, cv, cs) in layout.participants() {
            let (Some(mem), Some(dset)) = (src.projected_mem.as_ref(), src.dset.as_ref()) else {
                continue;
            };
            let projected_src = Dataspace::project_intersection(cv, cs, io.file_space)?;
            dset.read(&projected_src, mem, buf)?;
        }

        if total < npoints {
            if let Some(fill) = io.fill_value.element_bytes(dtype)? {
                let fill_space = io.mem_space.subtract(&layout.projected_mem_spaces())?;
                trace!(unmapped = fill_space.npoints(), "filling unmapped elements");
                fill_selection(io.mem_space, &fill_space, &fill, buf)?;
            }
        }
        Ok(())
    }

    fn write_virtual(&mut self, io: &IoRequest<'_>, buf: &[u8]) -> Result<()> {
        self.check_request(io)?;
        let npoints = io.file_space.npoints();

        let mut layout = ProjectionGuard::new(self);
        let total = layout.pre_io(io.file_space, io.mem_space)?;
        if total != npoints {
            warn!(
                requested = npoints,
                mapped = total,
                "write touches unmapped elements of a virtual dataset"
            );
            return Err(VdsError::BadValue(format!(
                "write of {} elements to a virtual dataset maps only {}",
                npoints, total
            )));
        }

        for (src, cv, cs) in layout.participants() {
            let (Some(mem), Some(dset)) = (src.projected_mem.as_ref(), src.dset.as_ref()) else {
                continue;
            };
            let projected_src = Dataspace::project_intersection(cv, cs, io.file_space)?;
            dset.write(&projected_src, mem, buf)?;
        }
        Ok(())
    }

    fn open_sources(&self) -> impl Iterator<Item = &SourceDataset> {
        self.mappings
            .iter()
            .flat_map(|m| m.sources_ref())
            .filter(|s| s.dset.is_some())
    }
}

/// Write `fill` into every element of `fill_space` in a buffer laid out by
/// `mem_space`'s extent.
fn fill_selection(
    mem_space: &Dataspace,
    fill_space: &Dataspace,
    fill: &[u8],
    buf: &mut [u8],
) -> Result<()> {
    let size = fill.len();
    let lin = Linearizer::exact(mem_space)?;
    for run in fill_space.runs(&lin)? {
        let (start, end) = (run.offset as usize * size, run.end() as usize * size);
        let span = buf.get_mut(start..end).ok_or_else(|| {
            VdsError::BadValue(format!(
                "buffer of {} bytes too small for element {}",
                end - size,
                run.end() - 1
            ))
        })?;
        for elem in span.chunks_exact_mut(size) {
            elem.copy_from_slice(fill);
        }
    }
    Ok(())
}

impl LayoutOps for VirtualLayout {
    fn kind(&self) -> StorageKind {
        StorageKind::Virtual
    }

    fn init(&mut self, ctx: &DatasetContext<'_>) -> Result<()> {
        self.bind(ctx)
    }

    fn is_space_alloc(&self) -> bool {
        true
    }

    fn is_data_cached(&self) -> bool {
        self.open_sources()
            .filter_map(|s| s.dset.as_ref())
            .any(|d| d.dataset().has_cached_data())
    }

    fn io_init(&mut self, io: &IoRequest<'_>) -> Result<u64> {
        self.check_request(io)?;
        self.pre_io(io.file_space, io.mem_space)
    }

    /// Runs its own [`io_init`](LayoutOps::io_init) and
    /// [`io_term`](LayoutOps::io_term). Unmapped elements get the fill
    /// value, or are left alone when it is undefined.
    fn read(&mut self, io: &IoRequest<'_>, buf: &mut [u8]) -> Result<()> {
        self.read_virtual(io, buf)
    }

    /// Fails before writing anything unless every element is mapped to an
    /// available source.
    fn write(&mut self, io: &IoRequest<'_>, buf: &[u8]) -> Result<()> {
        self.write_virtual(io, buf)
    }

    fn flush(&mut self) -> Result<()> {
        for dset in self.open_sources().filter_map(|s| s.dset.as_ref()) {
            dset.flush()?;
        }
        Ok(())
    }

    fn io_term(&mut self) {
        self.post_io();
    }

    fn dest(&mut self) {
        self.reset();
        self.env = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_selection() {
        let mem = Dataspace::simple(&[2, 3]);
        let mut holes = Dataspace::simple(&[2, 3]);
        holes.select_slice(&[0..2, 2..3]).unwrap();
        let mut buf = vec![0u8; 6];
        fill_selection(&mem, &holes, &[9], &mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 9, 0, 0, 9]);

        let mut short = vec![0u8; 4];
        assert!(matches!(
            fill_selection(&mem, &holes, &[9], &mut short),
            Err(VdsError::BadValue(_))
        ));
    }
}
