//! Heap-blob encoding of a mapping table.
//!
//! Version 0 writes every name inline. Version 1 prefixes each entry with a
//! flag byte so that `"."` costs nothing and a repeated name can be written
//! as the index of the first entry that used it. Both end in a metadata
//! checksum over everything before it. Counts and back-indices are written
//! with the file's size-of-lengths width.
//!
//! ```text
//! u8 version | sizeN count | entries... | u32 checksum
//! v0 entry:  cstr file | cstr dset | selection source | selection virtual
//! v1 entry:  u8 flags | [cstr file | sizeN idx] | (cstr dset | sizeN idx) | selections
//! ```

use crate::checksum::{metadata_checksum, verify_trailing};
use crate::dataspace::Dataspace;
use crate::error::{Result, VdsError};
use crate::heap::HeapId;
use crate::layout::{MappingEntry, SpaceStatus, VirtualLayout, SAME_FILE};
use crate::name_template::NameTemplate;
use crate::props::{FileAccessProps, FileCreateProps, LibVersion};
use crate::selection::Selection;
use crate::storage::ContainerFile;
use crate::utils::{put_cstr, put_uint, take_cstr, take_u8, take_uint};
use crate::validate;
use std::collections::HashMap;
use tracing::debug;

pub const BLOB_VERSION_0: u8 = 0;
pub const BLOB_VERSION_1: u8 = 1;

/// The source file is the file holding the virtual dataset.
pub const FLAG_SAME_FILE: u8 = 0x01;
/// The source file name is a back-index.
pub const FLAG_FILE_SHARED: u8 = 0x02;
/// The source dataset name is a back-index.
pub const FLAG_DSET_SHARED: u8 = 0x04;
const FLAGS_ALL: u8 = FLAG_SAME_FILE | FLAG_FILE_SHARED | FLAG_DSET_SHARED;

const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameRef {
    Inline,
    Shared(usize),
    SameFile,
}

/// How each entry's names are written in version 1.
fn plan_names(mappings: &[MappingEntry], size_of_lengths: usize) -> Vec<(NameRef, NameRef)> {
    fn pick<'a>(
        seen: &mut HashMap<&'a str, usize>,
        name: &'a str,
        i: usize,
        size_of_lengths: usize,
    ) -> NameRef {
        match seen.get(name) {
            Some(&first) if size_of_lengths <= name.len() + 1 => NameRef::Shared(first),
            Some(_) => NameRef::Inline,
            None => {
                seen.insert(name, i);
                NameRef::Inline
            }
        }
    }

    let mut files: HashMap<&str, usize> = HashMap::new();
    let mut dsets: HashMap<&str, usize> = HashMap::new();

    let mut plan = Vec::with_capacity(mappings.len());
    for (i, m) in mappings.iter().enumerate() {
        let file = if m.source_file_name() == SAME_FILE {
            NameRef::SameFile
        } else {
            pick(&mut files, m.source_file_name(), i, size_of_lengths)
        };
        let dset = pick(&mut dsets, m.source_dset_name(), i, size_of_lengths);
        plan.push((file, dset));
    }
    plan
}

fn name_len(name: &str, how: NameRef, size_of_lengths: usize) -> usize {
    match how {
        NameRef::Inline => name.len() + 1,
        NameRef::Shared(_) => size_of_lengths,
        NameRef::SameFile => 0,
    }
}

fn selections_len(m: &MappingEntry) -> usize {
    m.source_select.selection().serial_size(m.source_select.rank())
        + m.virtual_select.selection().serial_size(m.virtual_select.rank())
}

/// Encoded size of `mappings` in blob version `version`.
pub fn encoded_size(mappings: &[MappingEntry], version: u8, size_of_lengths: usize) -> usize {
    let header = 1 + size_of_lengths;
    let body: usize = if version == BLOB_VERSION_0 {
        mappings
            .iter()
            .map(|m| m.source_file_name().len() + 1 + m.source_dset_name().len() + 1 + selections_len(m))
            .sum()
    } else {
        plan_names(mappings, size_of_lengths)
            .iter()
            .zip(mappings)
            .map(|(&(file, dset), m)| {
                1 + name_len(m.source_file_name(), file, size_of_lengths)
                    + name_len(m.source_dset_name(), dset, size_of_lengths)
                    + selections_len(m)
            })
            .sum()
    };
    header + body + CHECKSUM_LEN
}

/// The version a file with lower bound `low_bound` should use: version 1
/// when allowed and no larger than version 0.
pub fn choose_version(mappings: &[MappingEntry], size_of_lengths: usize, low_bound: LibVersion) -> u8 {
    if low_bound >= LibVersion::V200
        && encoded_size(mappings, BLOB_VERSION_1, size_of_lengths)
            <= encoded_size(mappings, BLOB_VERSION_0, size_of_lengths)
    {
        BLOB_VERSION_1
    } else {
        BLOB_VERSION_0
    }
}

/// Encode `mappings` in blob version `version`.
pub fn encode_version(
    mappings: &[MappingEntry],
    version: u8,
    size_of_lengths: usize,
) -> Result<Vec<u8>> {
    if version > BLOB_VERSION_1 {
        return Err(VdsError::Codec(format!("unknown blob version {}", version)));
    }
    let mut out = Vec::new();
    out.try_reserve_exact(encoded_size(mappings, version, size_of_lengths))?;

    out.push(version);
    put_uint(&mut out, mappings.len() as u64, size_of_lengths)?;

    if version == BLOB_VERSION_0 {
        for m in mappings {
            put_cstr(&mut out, m.source_file_name());
            put_cstr(&mut out, m.source_dset_name());
            encode_selections(m, &mut out)?;
        }
    } else {
        let plan = plan_names(mappings, size_of_lengths);
        for (&(file, dset), m) in plan.iter().zip(mappings) {
            let mut flags = 0u8;
            match file {
                NameRef::SameFile => flags |= FLAG_SAME_FILE,
                NameRef::Shared(_) => flags |= FLAG_FILE_SHARED,
                NameRef::Inline => {}
            }
            if let NameRef::Shared(_) = dset {
                flags |= FLAG_DSET_SHARED;
            }
            out.push(flags);
            write_name(&mut out, m.source_file_name(), file, size_of_lengths)?;
            write_name(&mut out, m.source_dset_name(), dset, size_of_lengths)?;
            encode_selections(m, &mut out)?;
        }
    }

    let checksum = metadata_checksum(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

fn write_name(out: &mut Vec<u8>, name: &str, how: NameRef, size_of_lengths: usize) -> Result<()> {
    match how {
        NameRef::Inline => put_cstr(out, name),
        NameRef::Shared(idx) => put_uint(out, idx as u64, size_of_lengths)?,
        NameRef::SameFile => {}
    }
    Ok(())
}

fn encode_selections(m: &MappingEntry, out: &mut Vec<u8>) -> Result<()> {
    m.source_select
        .selection()
        .encode(m.source_select.rank(), out)?;
    m.virtual_select
        .selection()
        .encode(m.virtual_select.rank(), out)
}

/// Encode with the version the file allows. `None` when there is nothing
/// to store.
pub fn encode(
    layout: &VirtualLayout,
    fcpl: &FileCreateProps,
    fapl: &FileAccessProps,
) -> Result<Option<Vec<u8>>> {
    if layout.is_empty() {
        return Ok(None);
    }
    let width = usize::from(fcpl.size_of_lengths);
    let version = choose_version(layout.mappings(), width, fapl.low_bound);
    let blob = encode_version(layout.mappings(), version, width)?;
    debug!(version, mappings = layout.len(), bytes = blob.len(), "encoded virtual layout");
    Ok(Some(blob))
}

/// Decode a blob into mapping entries. Selections get placeholder extents
/// (`rank` is used where the encoding has none) and the source extents are
/// marked unknown until the sources are opened.
pub fn decode(blob: &[u8], size_of_lengths: usize, rank: usize) -> Result<Vec<MappingEntry>> {
    verify_trailing(blob).map_err(|(expected, computed)| {
        if blob.len() < CHECKSUM_LEN {
            VdsError::Codec("blob too short for a checksum".to_string())
        } else {
            VdsError::Checksum { expected, computed }
        }
    })?;
    let mut buf = &blob[..blob.len() - CHECKSUM_LEN];

    let version = take_u8(&mut buf)?;
    if version > BLOB_VERSION_1 {
        return Err(VdsError::Codec(format!("unknown blob version {}", version)));
    }
    let count = take_uint(&mut buf, size_of_lengths)?;
    let count = usize::try_from(count)
        .map_err(|_| VdsError::Codec(format!("mapping count {} too large", count)))?;

    let mut entries: Vec<MappingEntry> = Vec::new();
    entries.try_reserve(count.min(buf.len()))?;
    for i in 0..count {
        let (source_file, source_dset) = if version == BLOB_VERSION_0 {
            (
                NameTemplate::new(&take_cstr(&mut buf)?)?,
                NameTemplate::new(&take_cstr(&mut buf)?)?,
            )
        } else {
            let flags = take_u8(&mut buf)?;
            if flags & !FLAGS_ALL != 0 {
                return Err(VdsError::Codec(format!("unknown mapping flags {:#04x}", flags)));
            }
            let file = if flags & FLAG_SAME_FILE != 0 {
                NameTemplate::new(SAME_FILE)?
            } else if flags & FLAG_FILE_SHARED != 0 {
                let k = back_index(&mut buf, size_of_lengths, i)?;
                entries[k].source_file.clone()
            } else {
                NameTemplate::new(&take_cstr(&mut buf)?)?
            };
            let dset = if flags & FLAG_DSET_SHARED != 0 {
                let k = back_index(&mut buf, size_of_lengths, i)?;
                entries[k].source_dset.clone()
            } else {
                NameTemplate::new(&take_cstr(&mut buf)?)?
            };
            (file, dset)
        };

        let (source_sel, source_rank) = Selection::decode(&mut buf)?;
        let (virtual_sel, virtual_rank) = Selection::decode(&mut buf)?;
        let source_select = Dataspace::from_decoded(source_sel, source_rank.unwrap_or(rank));
        let virtual_select = Dataspace::from_decoded(virtual_sel, virtual_rank.unwrap_or(rank));

        validate::pre_check(&virtual_select, &source_select, SpaceStatus::Invalid)?;
        let mut entry = MappingEntry::new(
            virtual_select,
            source_select,
            source_file,
            source_dset,
            SpaceStatus::Invalid,
        );
        entry.virtual_space_status = SpaceStatus::Invalid;
        validate::post_check(&entry)?;
        entries.push(entry);
    }

    if !buf.is_empty() {
        return Err(VdsError::Codec(format!(
            "{} trailing bytes after mapping table",
            buf.len()
        )));
    }
    Ok(entries)
}

fn back_index(buf: &mut &[u8], size_of_lengths: usize, current: usize) -> Result<usize> {
    let k = take_uint(buf, size_of_lengths)?;
    match usize::try_from(k) {
        Ok(k) if k < current => Ok(k),
        _ => Err(VdsError::Codec(format!(
            "entry {} refers to name of entry {}",
            current, k
        ))),
    }
}

/// Write the layout's blob into `file`'s heap and remember where it went.
pub fn store(layout: &mut VirtualLayout, file: &ContainerFile) -> Result<Option<HeapId>> {
    let fcpl = file.create_props();
    let fapl = file.access_props();
    layout.heap_id = match encode(layout, &fcpl, &fapl)? {
        Some(blob) => Some(file.heap_insert(&blob)?),
        None => None,
    };
    Ok(layout.heap_id)
}

/// Rebuild a layout from the blob at `heap_id`.
pub fn load(file: &ContainerFile, heap_id: Option<HeapId>, rank: usize) -> Result<VirtualLayout> {
    let mut layout = VirtualLayout::new();
    if let Some(id) = heap_id {
        let blob = file.heap_get(id)?;
        let width = usize::from(file.create_props().size_of_lengths);
        for entry in decode(&blob, width, rank)? {
            layout.push_entry(entry)?;
        }
        debug!(mappings = layout.len(), "decoded virtual layout");
    }
    layout.heap_id = heap_id;
    Ok(layout)
}

/// Store a copy of the layout's blob in `dst`. The blob is always
/// re-encoded into a new heap object, even when `dst` is the source file.
pub fn copy(layout: &VirtualLayout, dst: &ContainerFile) -> Result<Option<HeapId>> {
    let mut copy = layout.clone();
    copy.heap_id = None;
    store(&mut copy, dst)
}

/// Remove the layout's heap object.
pub fn delete(layout: &mut VirtualLayout, file: &ContainerFile) -> Result<()> {
    if let Some(id) = layout.heap_id.take() {
        file.heap_remove(id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataspace::SelectOp;
    use crate::selection::UNLIMITED;

    fn slab(dims: &[u64], start: u64, len: u64) -> Dataspace {
        let mut space = Dataspace::simple(dims);
        space.select_slice(&[start..start + len]).unwrap();
        space
    }

    fn abc_layout() -> VirtualLayout {
        let mut layout = VirtualLayout::new();
        let src = Dataspace::simple(&[4]);
        layout.add_mapping(&slab(&[12], 0, 4), ".", "A", &src).unwrap();
        layout.add_mapping(&slab(&[12], 4, 4), ".", "A", &src).unwrap();
        layout.add_mapping(&slab(&[12], 8, 4), ".", "B", &src).unwrap();
        layout
    }

    #[test]
    fn test_v1_shares_dataset_names() {
        let layout = abc_layout();
        let blob = encode_version(layout.mappings(), BLOB_VERSION_1, 2).unwrap();
        assert_eq!(blob.len(), encoded_size(layout.mappings(), BLOB_VERSION_1, 2));

        let sel_len = selections_len(&layout.mappings()[0]);
        // version + count, then entry 0: flags + "A\0" + selections
        let entry1 = 1 + 2 + 1 + 2 + sel_len;
        assert_eq!(blob[3], FLAG_SAME_FILE);
        assert_eq!(blob[entry1], FLAG_SAME_FILE | FLAG_DSET_SHARED);
        assert_eq!(&blob[entry1 + 1..entry1 + 3], &[0, 0]);
        let entry2 = entry1 + 1 + 2 + sel_len;
        assert_eq!(blob[entry2], FLAG_SAME_FILE);
        assert_eq!(&blob[entry2 + 1..entry2 + 3], b"B\0");

        let decoded = decode(&blob, 2, 1).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(std::sync::Arc::ptr_eq(
            decoded[0].source_dset_template().shared(),
            decoded[1].source_dset_template().shared()
        ));
        assert_eq!(decoded[2].source_dset_name(), "B");
        assert_eq!(decoded[1].source_file_name(), ".");
    }

    #[test]
    fn test_no_sharing_when_index_is_wider() {
        let layout = abc_layout();
        let blob = encode_version(layout.mappings(), BLOB_VERSION_1, 8).unwrap();
        let sel_len = selections_len(&layout.mappings()[0]);
        let entry1 = 1 + 8 + 1 + 2 + sel_len;
        assert_eq!(blob[entry1], FLAG_SAME_FILE);
    }

    #[test]
    fn test_reencode_is_stable() {
        let mut layout = abc_layout();
        let mut vspace = Dataspace::with_max(&[0], &[UNLIMITED]).unwrap();
        vspace
            .select_hyperslab(SelectOp::Set, &[12], Some(&[4]), &[UNLIMITED], Some(&[4]))
            .unwrap();
        layout
            .add_mapping(&vspace, "src%b.h5", "/data", &Dataspace::simple(&[4]))
            .unwrap();

        for version in [BLOB_VERSION_0, BLOB_VERSION_1] {
            let first = encode_version(layout.mappings(), version, 8).unwrap();
            let decoded = decode(&first, 8, 1).unwrap();
            let second = encode_version(&decoded, version, 8).unwrap();
            assert_eq!(first, second);
            assert!(decoded[3].is_printf());
            assert_eq!(decoded[3].source_space_status(), SpaceStatus::Invalid);
        }
    }

    #[test]
    fn test_version_choice() {
        let layout = abc_layout();
        let m = layout.mappings();
        assert_eq!(choose_version(m, 8, LibVersion::V114), BLOB_VERSION_0);
        assert_eq!(choose_version(m, 8, LibVersion::V200), BLOB_VERSION_1);
        assert!(encoded_size(m, BLOB_VERSION_1, 8) <= encoded_size(m, BLOB_VERSION_0, 8));
    }

    #[test]
    fn test_corruption_detected() {
        let layout = abc_layout();
        let mut blob = encode_version(layout.mappings(), BLOB_VERSION_0, 8).unwrap();
        blob[5] ^= 0xff;
        assert!(matches!(decode(&blob, 8, 1), Err(VdsError::Checksum { .. })));
        assert!(matches!(decode(&[1, 2], 8, 1), Err(VdsError::Codec(_))));
    }

    fn resealed(mut body: Vec<u8>) -> Vec<u8> {
        body.truncate(body.len() - CHECKSUM_LEN);
        let sum = metadata_checksum(&body);
        body.extend_from_slice(&sum.to_le_bytes());
        body
    }

    #[test]
    fn test_forward_back_index_rejected() {
        let layout = abc_layout();
        let mut blob = encode_version(layout.mappings(), BLOB_VERSION_1, 2).unwrap();
        let sel_len = selections_len(&layout.mappings()[0]);
        let entry1 = 1 + 2 + 1 + 2 + sel_len;

        // Point entry 1's shared name at itself.
        blob[entry1 + 1] = 1;
        let blob = resealed(blob);
        assert!(matches!(decode(&blob, 2, 1), Err(VdsError::Codec(_))));
    }

    #[test]
    fn test_overflowing_hyperslab_rejected() {
        let mut body = vec![BLOB_VERSION_0];
        put_uint(&mut body, 1, 8).unwrap();
        put_cstr(&mut body, "a.h5");
        put_cstr(&mut body, "/d");
        Selection::All.encode(1, &mut body).unwrap();
        let at = body.len();
        let h = crate::selection::RegularHyperslab::new(vec![0], vec![1], vec![10], vec![1]).unwrap();
        Selection::Regular(h).encode(1, &mut body).unwrap();
        // start of dimension 0 follows the 17-byte regular header
        body[at + 17..at + 25].copy_from_slice(&(u64::MAX - 2).to_le_bytes());
        let sum = metadata_checksum(&body);
        body.extend_from_slice(&sum.to_le_bytes());

        assert!(matches!(decode(&body, 8, 1), Err(VdsError::Codec(_))));
    }

    #[test]
    fn test_empty_layout() {
        let layout = VirtualLayout::new();
        assert!(encode(&layout, &FileCreateProps::new(), &FileAccessProps::new())
            .unwrap()
            .is_none());
        let blob = encode_version(&[], BLOB_VERSION_0, 8).unwrap();
        assert!(decode(&blob, 8, 1).unwrap().is_empty());
    }
}
