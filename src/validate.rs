//! Legality checks for a single mapping, before and after the entry is built.

use crate::dataspace::Dataspace;
use crate::error::{Result, VdsError};
use crate::layout::{MappingEntry, SpaceStatus};
use crate::selection::{Selection, UNLIMITED};

/// Checks that only need the two selections.
///
/// `source_status` says whether `sspace`'s extent is the real extent of the
/// source dataset; element counts of bounded selections are compared only
/// then.
pub fn pre_check(vspace: &Dataspace, sspace: &Dataspace, source_status: SpaceStatus) -> Result<()> {
    if matches!(vspace.selection(), Selection::Points(_)) {
        return Err(VdsError::BadSelection(
            "point selections are not supported in the virtual space".to_string(),
        ));
    }
    if matches!(sspace.selection(), Selection::Points(_)) {
        return Err(VdsError::BadSelection(
            "point selections are not supported in the source space".to_string(),
        ));
    }

    match (vspace.unlimited_dim(), sspace.unlimited_dim()) {
        (Some(_), Some(_)) => {
            let v = vspace.num_elem_non_unlim()?;
            let s = sspace.num_elem_non_unlim()?;
            if v != s {
                return Err(VdsError::BadValue(format!(
                    "unlimited selections differ in their bounded dimensions ({} vs {} elements)",
                    v, s
                )));
            }
        }
        (None, Some(_)) => {
            return Err(VdsError::BadValue(
                "source selection is unlimited but the virtual selection is not".to_string(),
            ));
        }
        (None, None) if source_status == SpaceStatus::Correct => {
            let v = vspace.npoints();
            let s = sspace.npoints();
            if v != s {
                return Err(VdsError::BadValue(format!(
                    "virtual selection has {} elements, source selection has {}",
                    v, s
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Checks on a complete entry, once names are parsed.
pub fn post_check(entry: &MappingEntry) -> Result<()> {
    let nsubs = entry.source_file_template().nsubs() + entry.source_dset_template().nsubs();
    let printf_shape =
        entry.unlim_dim_virtual().is_some() && entry.unlim_dim_source().is_none();

    if !printf_shape {
        if nsubs > 0 {
            return Err(VdsError::BadValue(
                "%b in a source name requires an unlimited virtual selection and a bounded source selection"
                    .to_string(),
            ));
        }
        return Ok(());
    }

    if nsubs == 0 {
        return Err(VdsError::BadValue(
            "unlimited virtual selection with a bounded source needs %b in a source name"
                .to_string(),
        ));
    }
    let Selection::Regular(hyper) = entry.virtual_select().selection() else {
        return Err(VdsError::BadSelection(
            "printf mapping needs a hyperslab virtual selection".to_string(),
        ));
    };
    if let Some(u) = entry.unlim_dim_virtual() {
        if hyper.count[u] != UNLIMITED {
            return Err(VdsError::BadSelection(
                "printf mapping needs an unlimited count, not an unlimited block".to_string(),
            ));
        }
    }

    if entry.source_space_status() == SpaceStatus::Correct {
        let block = entry.virtual_select().unlim_block(0)?;
        let (v, s) = (block.npoints(), entry.source_select().npoints());
        if v != s {
            return Err(VdsError::BadValue(format!(
                "printf block has {} elements, source selection has {}",
                v, s
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataspace::SelectOp;
    use crate::name_template::NameTemplate;

    fn unlimited(dims: &[u64], count: &[u64], block: &[u64]) -> Dataspace {
        let max: Vec<u64> = dims.iter().map(|_| UNLIMITED).collect();
        let mut space = Dataspace::with_max(dims, &max).unwrap();
        let zeros = vec![0; dims.len()];
        space
            .select_hyperslab(SelectOp::Set, &zeros, Some(block), count, Some(block))
            .unwrap();
        space
    }

    fn entry(v: Dataspace, file: &str, dset: &str, s: Dataspace) -> MappingEntry {
        MappingEntry::new(
            v,
            s,
            NameTemplate::new(file).unwrap(),
            NameTemplate::new(dset).unwrap(),
            SpaceStatus::Correct,
        )
    }

    #[test]
    fn test_points_rejected() {
        let mut points = Dataspace::simple(&[4]);
        points.select_points(vec![vec![1]]).unwrap();
        let plain = Dataspace::simple(&[1]);
        assert!(matches!(
            pre_check(&points, &plain, SpaceStatus::Correct),
            Err(VdsError::BadSelection(_))
        ));
        assert!(matches!(
            pre_check(&plain, &points, SpaceStatus::Correct),
            Err(VdsError::BadSelection(_))
        ));
    }

    #[test]
    fn test_element_counts() {
        let v = Dataspace::simple(&[10]);
        let s = Dataspace::simple(&[8]);
        assert!(matches!(
            pre_check(&v, &s, SpaceStatus::Correct),
            Err(VdsError::BadValue(_))
        ));
        assert!(pre_check(&v, &s, SpaceStatus::Invalid).is_ok());

        let v = unlimited(&[0, 4], &[UNLIMITED, 1], &[1, 4]);
        let s = unlimited(&[0, 3], &[UNLIMITED, 1], &[1, 3]);
        assert!(matches!(
            pre_check(&v, &s, SpaceStatus::Correct),
            Err(VdsError::BadValue(_))
        ));
        assert!(matches!(
            pre_check(
                &Dataspace::simple(&[4, 4]),
                &unlimited(&[0, 4], &[UNLIMITED, 1], &[1, 4]),
                SpaceStatus::Correct
            ),
            Err(VdsError::BadValue(_))
        ));
    }

    #[test]
    fn test_printf_rules() {
        let v = unlimited(&[0], &[UNLIMITED], &[4]);
        let s = Dataspace::simple(&[4]);
        assert!(post_check(&entry(v.clone(), "src%b.h5", "/data", s.clone())).is_ok());
        assert!(matches!(
            post_check(&entry(v.clone(), "src.h5", "/data", s.clone())),
            Err(VdsError::BadValue(_))
        ));
        assert!(matches!(
            post_check(&entry(v, "src%b.h5", "/data", Dataspace::simple(&[5]))),
            Err(VdsError::BadValue(_))
        ));

        let mut block_unlim = Dataspace::with_max(&[0], &[UNLIMITED]).unwrap();
        block_unlim
            .select_hyperslab(SelectOp::Set, &[0], None, &[1], Some(&[UNLIMITED]))
            .unwrap();
        assert!(matches!(
            post_check(&entry(block_unlim, "src%b.h5", "/data", s.clone())),
            Err(VdsError::BadSelection(_))
        ));

        assert!(matches!(
            post_check(&entry(Dataspace::simple(&[4]), "src%b.h5", "/data", s)),
            Err(VdsError::BadValue(_))
        ));
    }
}
