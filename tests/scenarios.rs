//! End-to-end behaviour of virtual datasets over in-memory container files.

use h5vds::{
    ContainerFile, DataType, DatasetAccessProps, DatasetCreateProps, Dataspace, Element,
    FileAccessProps, FileCreateProps, FileRegistry, FillValue, Intent, LibVersion, MemDataset,
    SelectOp, StoredDataset, VdsError, ViewPolicy, VirtualDataset, UNLIMITED,
};
use std::sync::Arc;

const VDS_FILE: &str = "/vds/main.h5";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (FileRegistry, Arc<ContainerFile>) {
    init_tracing();
    let registry = FileRegistry::new();
    let file = registry
        .create_file(VDS_FILE, FileCreateProps::new(), FileAccessProps::new())
        .unwrap();
    (registry, file)
}

/// Register a closed source file holding one dataset.
fn add_source<T: Element>(
    registry: &FileRegistry,
    file: &str,
    dset: &str,
    space: &Dataspace,
    values: &[T],
) -> Arc<ContainerFile> {
    let f = registry
        .create_file(file, FileCreateProps::new(), FileAccessProps::new())
        .unwrap();
    let ds = MemDataset::with_values(dset, space, values).unwrap();
    f.insert_dataset(Arc::new(ds)).unwrap();
    registry.close_file(&f);
    f
}

fn slab(dims: &[u64], ranges: &[std::ops::Range<u64>]) -> Dataspace {
    let mut space = Dataspace::simple(dims);
    space.select_slice(ranges).unwrap();
    space
}

fn unlimited_1d() -> Dataspace {
    Dataspace::with_max(&[0], &[UNLIMITED]).unwrap()
}

/// Virtual selection `[0:4] [4:8] ...` without end.
fn printf_blocks(block: u64) -> Dataspace {
    let mut vspace = unlimited_1d();
    vspace
        .select_hyperslab(SelectOp::Set, &[0], Some(&[block]), &[UNLIMITED], Some(&[block]))
        .unwrap();
    vspace
}

fn printf_dataset(
    registry: &FileRegistry,
    file: &Arc<ContainerFile>,
    dapl: &DatasetAccessProps,
    fill: FillValue,
) -> VirtualDataset {
    let mut dcpl = DatasetCreateProps::new().with_fill_value(fill);
    dcpl.set_virtual(&printf_blocks(4), "src%b.h5", "/data", &Dataspace::simple(&[4]))
        .unwrap();
    VirtualDataset::create(
        file,
        registry,
        "/vds",
        DataType::F32,
        &unlimited_1d(),
        &dcpl,
        dapl,
    )
    .unwrap()
}

fn add_block(registry: &FileRegistry, j: u64) {
    let values: Vec<f32> = (0..4).map(|i| (10 * j + i) as f32).collect();
    add_source(
        registry,
        &format!("src{}.h5", j),
        "/data",
        &Dataspace::simple(&[4]),
        &values,
    );
}

fn read_all<T: Element>(vds: &mut VirtualDataset) -> Vec<T> {
    let space = vds.space().unwrap();
    vds.read_vec(&space).unwrap()
}

#[test]
fn test_concatenation_of_two_sources() {
    let (registry, file) = setup();
    let a: Vec<f32> = (0..10).map(|v| v as f32).collect();
    let b: Vec<f32> = (0..10).map(|v| 100.0 + v as f32).collect();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[10]), &a);
    add_source(&registry, "b.h5", "/B", &Dataspace::simple(&[10]), &b);

    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&slab(&[20], &[0..10]), "a.h5", "/A", &Dataspace::simple(&[10]))
        .unwrap();
    dcpl.set_virtual(&slab(&[20], &[10..20]), "b.h5", "/B", &Dataspace::simple(&[10]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::F32,
        &Dataspace::simple(&[20]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let got: Vec<f32> = vds.read_array(&[5..15]).unwrap().iter().copied().collect();
    assert_eq!(got, vec![5.0, 6.0, 7.0, 8.0, 9.0, 100.0, 101.0, 102.0, 103.0, 104.0]);
    assert_eq!(vds.layout().open_source_count(), 2);
}

#[test]
fn test_read_into_strided_memory() {
    let (registry, file) = setup();
    let a: Vec<i32> = (0..6).collect();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[2, 3]), &a);

    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&slab(&[2, 3], &[0..2, 0..3]), "a.h5", "/A", &Dataspace::simple(&[2, 3]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/grid",
        DataType::I32,
        &Dataspace::simple(&[2, 3]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let file_space = slab(&[2, 3], &[0..2, 1..3]);
    let mut mem = Dataspace::simple(&[2, 4]);
    mem.select_slice(&[0..2, 2..4]).unwrap();
    let mut buf = vec![0u8; 8 * 4];
    vds.read(&file_space, &mem, &mut buf).unwrap();
    let got: Vec<i32> = buf
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(got, vec![0, 0, 1, 2, 0, 0, 4, 5]);
}

#[test]
fn test_unlimited_source_last_available() {
    let (registry, file) = setup();
    let source_space = Dataspace::with_max(&[7, 4], &[UNLIMITED, 4]).unwrap();
    let values: Vec<i32> = (0..28).collect();
    add_source(&registry, "s.h5", "/d", &source_space, &values);

    let mut vspace = Dataspace::with_max(&[0, 4], &[UNLIMITED, 4]).unwrap();
    vspace
        .select_hyperslab(SelectOp::Set, &[0, 0], None, &[UNLIMITED, 1], Some(&[1, 4]))
        .unwrap();
    let mut sspace = source_space.clone();
    sspace
        .select_hyperslab(SelectOp::Set, &[0, 0], None, &[UNLIMITED, 1], Some(&[1, 4]))
        .unwrap();
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&vspace, "s.h5", "/d", &sspace).unwrap();

    let dapl = DatasetAccessProps::new().with_view(ViewPolicy::LastAvailable);
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::I32,
        &Dataspace::with_max(&[0, 4], &[UNLIMITED, 4]).unwrap(),
        &dcpl,
        &dapl,
    )
    .unwrap();

    assert!(vds.set_extent_unlim().unwrap());
    assert_eq!(vds.extent(), &[7, 4]);
    assert_eq!(file.virtual_header("/vds").unwrap().space.dims(), &[7, 4]);
    assert_eq!(read_all::<i32>(&mut vds), values);
    assert!(!vds.set_extent_unlim().unwrap());
}

#[test]
fn test_unlimited_source_first_missing_matches_source_extent() {
    let (registry, file) = setup();
    let source_space = Dataspace::with_max(&[5], &[UNLIMITED]).unwrap();
    add_source(&registry, "s.h5", "/d", &source_space, &[1u8, 2, 3, 4, 5]);

    let mut vspace = unlimited_1d();
    vspace
        .select_hyperslab(SelectOp::Set, &[0], None, &[UNLIMITED], None)
        .unwrap();
    let mut sspace = source_space.clone();
    sspace
        .select_hyperslab(SelectOp::Set, &[0], None, &[UNLIMITED], None)
        .unwrap();
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&vspace, "s.h5", "/d", &sspace).unwrap();

    let dapl = DatasetAccessProps::new().with_view(ViewPolicy::FirstMissing);
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U8,
        &unlimited_1d(),
        &dcpl,
        &dapl,
    )
    .unwrap();
    assert_eq!(vds.space().unwrap().dims(), &[5]);
    assert_eq!(read_all::<u8>(&mut vds), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_printf_first_missing() {
    let (registry, file) = setup();
    for j in 0..3 {
        add_block(&registry, j);
    }
    let dapl = DatasetAccessProps::new().with_view(ViewPolicy::FirstMissing);
    let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::Default);

    assert_eq!(vds.space().unwrap().dims(), &[12]);
    let expected: Vec<f32> = [0, 1, 2, 3, 10, 11, 12, 13, 20, 21, 22, 23]
        .iter()
        .map(|&v| v as f32)
        .collect();
    assert_eq!(read_all::<f32>(&mut vds), expected);

    let entry = &vds.mappings()[0];
    assert!(entry.is_printf());
    assert_eq!(entry.sub_dset_nused(), 3);
    assert_eq!(entry.sub_datasets()[1].file_name(), "src1.h5");
}

#[test]
fn test_printf_last_available_with_gap() {
    let (registry, file) = setup();
    for j in [0, 1, 3] {
        add_block(&registry, j);
    }
    let dapl = DatasetAccessProps::new()
        .with_view(ViewPolicy::LastAvailable)
        .with_printf_gap(1);
    let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::user(-1.0f32));

    assert_eq!(vds.space().unwrap().dims(), &[16]);
    assert_eq!(vds.mappings()[0].sub_dset_nused(), 4);

    let got = read_all::<f32>(&mut vds);
    assert_eq!(&got[0..4], &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(&got[8..12], &[-1.0; 4]);
    assert_eq!(&got[12..16], &[30.0, 31.0, 32.0, 33.0]);
}

#[test]
fn test_huge_printf_gap_is_bounded() {
    let (registry, file) = setup();
    for j in [0, 2] {
        add_block(&registry, j);
    }
    let dapl = DatasetAccessProps::new()
        .with_view(ViewPolicy::LastAvailable)
        .with_printf_gap(u64::MAX);
    let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::user(-1.0f32));

    assert_eq!(vds.space().unwrap().dims(), &[12]);
    assert_eq!(vds.mappings()[0].sub_dset_nused(), 3);

    let got = read_all::<f32>(&mut vds);
    assert_eq!(&got[4..8], &[-1.0; 4]);
    assert_eq!(&got[8..12], &[20.0, 21.0, 22.0, 23.0]);
}

#[test]
fn test_printf_gap_ignored_under_first_missing() {
    let (registry, file) = setup();
    for j in [0, 1, 3] {
        add_block(&registry, j);
    }
    let dapl = DatasetAccessProps::new()
        .with_view(ViewPolicy::FirstMissing)
        .with_printf_gap(5);
    let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::Default);
    assert_eq!(vds.layout().printf_gap(), 0);
    assert_eq!(vds.space().unwrap().dims(), &[8]);
}

#[test]
fn test_first_block_absent_gives_empty_extent() {
    for view in [ViewPolicy::FirstMissing, ViewPolicy::LastAvailable] {
        let (registry, file) = setup();
        add_block(&registry, 1);
        let dapl = DatasetAccessProps::new().with_view(view);
        let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::Default);
        assert_eq!(vds.space().unwrap().dims(), &[0], "{:?}", view);
        assert!(read_all::<f32>(&mut vds).is_empty());
    }
}

#[test]
fn test_name_sharing_in_blob() {
    init_tracing();
    let registry = FileRegistry::new();
    let fcpl = FileCreateProps::new().with_size_of_lengths(2).unwrap();
    let fapl = FileAccessProps::new().with_low_bound(LibVersion::V200);
    let file = registry.create_file(VDS_FILE, fcpl, fapl).unwrap();
    for (name, base) in [("A", 0.0f32), ("B", 100.0)] {
        let values: Vec<f32> = (0..8).map(|v| base + v as f32).collect();
        let ds = MemDataset::with_values(name, &Dataspace::simple(&[8]), &values).unwrap();
        file.insert_dataset(Arc::new(ds)).unwrap();
    }

    let src = |r: std::ops::Range<u64>| slab(&[8], &[r]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&slab(&[12], &[0..4]), ".", "A", &src(0..4)).unwrap();
    dcpl.set_virtual(&slab(&[12], &[4..8]), ".", "A", &src(4..8)).unwrap();
    dcpl.set_virtual(&slab(&[12], &[8..12]), ".", "B", &src(0..4)).unwrap();
    let vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::F32,
        &Dataspace::simple(&[12]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let blob = file.heap_get(vds.layout().heap_id().unwrap()).unwrap();
    assert_eq!(blob[0], 1, "version 1 is no larger here");
    assert_eq!(&blob[1..3], &[3, 0]);
    assert_eq!(blob[3], 0x01);
    assert_eq!(&blob[4..6], b"A\0");
    vds.close();

    let mut reopened =
        VirtualDataset::open(&file, &registry, "/vds", &DatasetAccessProps::new()).unwrap();
    let m = reopened.mappings();
    assert!(Arc::ptr_eq(
        m[0].source_dset_template().shared(),
        m[1].source_dset_template().shared()
    ));
    assert_eq!(m[2].source_dset_name(), "B");
    assert_eq!(m[1].source_file_name(), ".");

    let got = read_all::<f32>(&mut reopened);
    assert_eq!(&got[..8], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    assert_eq!(&got[8..], &[100.0, 101.0, 102.0, 103.0]);
}

#[test]
fn test_old_low_bound_uses_version_0() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[4]), &[1i16, 2, 3, 4]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[4]), "a.h5", "/A", &Dataspace::simple(&[4]))
        .unwrap();
    let vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::I16,
        &Dataspace::simple(&[4]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    let blob = file.heap_get(vds.layout().heap_id().unwrap()).unwrap();
    assert_eq!(blob[0], 0);
    assert_eq!(&blob[9..14], b"a.h5\0");
}

#[test]
fn test_write_to_unmapped_region_fails() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[10]), &[7i32; 10]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&slab(&[20], &[0..10]), "a.h5", "/A", &Dataspace::simple(&[10]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::I32,
        &Dataspace::simple(&[20]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let err = vds.write_slice(&[5..15], &[1i32; 10]).unwrap_err();
    assert!(matches!(err, VdsError::BadValue(_)));
    let source = registry
        .open_file("a.h5", Intent::ReadOnly, FileAccessProps::new())
        .unwrap();
    let values = source.dataset("/A").unwrap();
    let mut buf = vec![0u8; 40];
    values
        .read(&Dataspace::simple(&[10]), &Dataspace::simple(&[10]), &mut buf)
        .unwrap();
    assert!(buf.chunks_exact(4).all(|c| c == 7i32.to_le_bytes()));
    registry.close_file(&source);
}

#[test]
fn test_write_then_read_round_trip() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[5]), &[0u16; 5]);
    add_source(&registry, "b.h5", "/B", &Dataspace::simple(&[5]), &[0u16; 5]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&slab(&[10], &[0..5]), "a.h5", "/A", &Dataspace::simple(&[5]))
        .unwrap();
    dcpl.set_virtual(&slab(&[10], &[5..10]), "b.h5", "/B", &Dataspace::simple(&[5]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U16,
        &Dataspace::simple(&[10]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let values: Vec<u16> = (1..=6).collect();
    vds.write_slice(&[2..8], &values).unwrap();
    assert!(vds.is_data_cached());
    vds.flush().unwrap();
    assert!(!vds.is_data_cached());

    let back: Vec<u16> = vds.read_array(&[2..8]).unwrap().iter().copied().collect();
    assert_eq!(back, values);
    assert_eq!(read_all::<u16>(&mut vds), vec![0, 0, 1, 2, 3, 4, 5, 6, 0, 0]);
}

#[test]
fn test_fill_and_projection_cover_request() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[3]), &[1u8, 2, 3]);
    let mut dcpl = DatasetCreateProps::new().with_fill_value(FillValue::user(9u8));
    dcpl.set_virtual(&slab(&[8], &[2..5]), "a.h5", "/A", &Dataspace::simple(&[3]))
        .unwrap();
    dcpl.set_virtual(&slab(&[8], &[5..8]), "gone.h5", "/A", &Dataspace::simple(&[3]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U8,
        &Dataspace::simple(&[8]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    assert_eq!(read_all::<u8>(&mut vds), vec![9, 9, 1, 2, 3, 9, 9, 9]);
    assert!(matches!(
        vds.write_slice(&[4..6], &[0u8, 0]),
        Err(VdsError::BadValue(_))
    ));
}

#[test]
fn test_undefined_fill_leaves_buffer() {
    let (registry, file) = setup();
    let mut dcpl = DatasetCreateProps::new().with_fill_value(FillValue::Undefined);
    dcpl.set_virtual(&Dataspace::simple(&[4]), "gone.h5", "/x", &Dataspace::simple(&[4]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U8,
        &Dataspace::simple(&[4]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    let all = Dataspace::simple(&[4]);
    let mut buf = vec![0xaau8; 4];
    vds.read(&all, &all, &mut buf).unwrap();
    assert_eq!(buf, vec![0xaa; 4]);
}

#[test]
fn test_empty_extent_reads_nothing() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[0]), &[] as &[f64]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[0]), "a.h5", "/A", &Dataspace::simple(&[0]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::F64,
        &Dataspace::simple(&[0]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    assert!(read_all::<f64>(&mut vds).is_empty());
}

#[test]
fn test_request_checks() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[4]), &[0u8; 4]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[4]), "a.h5", "/A", &Dataspace::simple(&[4]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U8,
        &Dataspace::simple(&[4]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let all = Dataspace::simple(&[4]);
    let mut buf = [0u8; 4];
    assert!(matches!(
        vds.read(&all, &Dataspace::simple(&[3]), &mut buf),
        Err(VdsError::BadValue(_))
    ));
    let mut points = Dataspace::simple(&[4]);
    points.select_points(vec![vec![1], vec![2]]).unwrap();
    assert!(matches!(
        vds.read(&points, &Dataspace::simple(&[2]), &mut buf),
        Err(VdsError::BadSelection(_))
    ));
    assert!(matches!(
        vds.read(&slab(&[8], &[2..6]), &all, &mut buf),
        Err(VdsError::BadSelection(_))
    ));
}

#[test]
fn test_parallel_io_rejected() {
    init_tracing();
    let registry = FileRegistry::new();
    let fapl = FileAccessProps::new().with_driver(h5vds::FileDriver::Mpio);
    let file = registry
        .create_file(VDS_FILE, FileCreateProps::new(), fapl)
        .unwrap();
    let ds = MemDataset::with_values("/A", &Dataspace::simple(&[4]), &[0u8; 4]).unwrap();
    file.insert_dataset(Arc::new(ds)).unwrap();
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[4]), ".", "/A", &Dataspace::simple(&[4]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U8,
        &Dataspace::simple(&[4]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    let all = Dataspace::simple(&[4]);
    assert!(matches!(
        vds.read(&all, &all, &mut [0u8; 4]),
        Err(VdsError::Unsupported(_))
    ));
}

#[test]
fn test_source_type_mismatch() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[4]), &[0i64; 4]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[4]), "a.h5", "/A", &Dataspace::simple(&[4]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::F64,
        &Dataspace::simple(&[4]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    assert!(matches!(
        vds.read_vec::<f64>(&Dataspace::simple(&[4])),
        Err(VdsError::BadValue(_))
    ));
}

#[test]
fn test_explicit_set_extent() {
    let (registry, file) = setup();
    for j in 0..2 {
        add_block(&registry, j);
    }
    let dapl = DatasetAccessProps::new().with_view(ViewPolicy::FirstMissing);
    let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::user(-1.0f32));
    vds.set_extent(&[6]).unwrap();
    assert_eq!(vds.extent(), &[6]);
    let got = vds.read_vec::<f32>(&Dataspace::simple(&[6])).unwrap();
    assert_eq!(got, vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0]);
}

#[test]
fn test_prefix_search_for_sources() {
    init_tracing();
    let registry = FileRegistry::new();
    let file = registry
        .create_file("/work/v.h5", FileCreateProps::new(), FileAccessProps::new())
        .unwrap();
    add_source(&registry, "/store/a.h5", "/A", &Dataspace::simple(&[2]), &[4u32, 5]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[2]), "a.h5", "/A", &Dataspace::simple(&[2]))
        .unwrap();

    let create = |dapl: &DatasetAccessProps, name: &str| {
        VirtualDataset::create(
            &file,
            &registry,
            name,
            DataType::U32,
            &Dataspace::simple(&[2]),
            &dcpl,
            dapl,
        )
        .unwrap()
    };

    let mut without = create(&DatasetAccessProps::new(), "/plain");
    assert_eq!(read_all::<u32>(&mut without), vec![0, 0]);

    let mut with = create(&DatasetAccessProps::new().with_vds_prefix("/store"), "/prefixed");
    assert_eq!(read_all::<u32>(&mut with), vec![4, 5]);
}

fn unlimited_rows(registry: &FileRegistry, file: &Arc<ContainerFile>) -> VirtualDataset {
    let mut vspace = Dataspace::with_max(&[0, 4], &[UNLIMITED, 4]).unwrap();
    vspace
        .select_hyperslab(SelectOp::Set, &[0, 0], None, &[UNLIMITED, 1], Some(&[1, 4]))
        .unwrap();
    let mut sspace = Dataspace::with_max(&[0, 4], &[UNLIMITED, 4]).unwrap();
    sspace
        .select_hyperslab(SelectOp::Set, &[0, 0], None, &[UNLIMITED, 1], Some(&[1, 4]))
        .unwrap();
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&vspace, "s.h5", "/d", &sspace).unwrap();
    VirtualDataset::create(
        file,
        registry,
        "/rows",
        DataType::I32,
        &Dataspace::with_max(&[0, 4], &[UNLIMITED, 4]).unwrap(),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap()
}

#[test]
fn test_refresh_sees_grown_source() {
    let (registry, file) = setup();
    let space = Dataspace::with_max(&[7, 4], &[UNLIMITED, 4]).unwrap();
    add_source(&registry, "s.h5", "/d", &space, &(0..28).collect::<Vec<i32>>());
    let mut vds = unlimited_rows(&registry, &file);
    assert_eq!(vds.space().unwrap().dims(), &[7, 4]);

    let source = registry
        .open_file("s.h5", Intent::ReadWrite, FileAccessProps::new())
        .unwrap();
    let grown = Dataspace::with_max(&[9, 4], &[UNLIMITED, 4]).unwrap();
    let values: Vec<i32> = (0..36).collect();
    let ds = MemDataset::with_values("/d", &grown, &values).unwrap();
    source.replace_dataset(Arc::new(ds)).unwrap();
    registry.close_file(&source);

    vds.refresh().unwrap();
    assert_eq!(vds.extent(), &[9, 4]);
    assert_eq!(read_all::<i32>(&mut vds), values);
}

#[test]
fn test_printf_source_appears_later() {
    let (registry, file) = setup();
    for j in 0..3 {
        add_block(&registry, j);
    }
    let dapl = DatasetAccessProps::new().with_view(ViewPolicy::FirstMissing);
    let mut vds = printf_dataset(&registry, &file, &dapl, FillValue::Default);
    assert_eq!(vds.space().unwrap().dims(), &[12]);

    add_block(&registry, 3);
    vds.refresh().unwrap();
    assert_eq!(vds.extent(), &[16]);
    let got = read_all::<f32>(&mut vds);
    assert_eq!(&got[12..], &[30.0, 31.0, 32.0, 33.0]);
}

#[test]
fn test_held_files_outlive_dataset() {
    let (registry, file) = setup();
    let source = add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[4]), &[1u8, 2, 3, 4]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[4]), "a.h5", "/A", &Dataspace::simple(&[4]))
        .unwrap();
    let mut vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U8,
        &Dataspace::simple(&[4]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();
    assert!(!source.is_open());
    assert_eq!(read_all::<u8>(&mut vds), vec![1, 2, 3, 4]);
    assert!(source.is_open(), "open source keeps its file open");

    let held = vds.layout().hold_source_files();
    assert_eq!(held.len(), 1);
    drop(vds);
    assert!(source.is_open());
    held.release();
    assert!(!source.is_open());
}

#[test]
fn test_copy_and_reopen() {
    let (registry, file) = setup();
    add_source(&registry, "a.h5", "/A", &Dataspace::simple(&[3]), &[7u32, 8, 9]);
    let mut dcpl = DatasetCreateProps::new();
    dcpl.set_virtual(&Dataspace::simple(&[3]), "a.h5", "/A", &Dataspace::simple(&[3]))
        .unwrap();
    let vds = VirtualDataset::create(
        &file,
        &registry,
        "/vds",
        DataType::U32,
        &Dataspace::simple(&[3]),
        &dcpl,
        &DatasetAccessProps::new(),
    )
    .unwrap();

    let other = registry
        .create_file("/vds/other.h5", FileCreateProps::new(), FileAccessProps::new())
        .unwrap();
    vds.copy_to(&other, "/copy").unwrap();
    assert_eq!(other.heap_len(), 1);

    let mut copy = VirtualDataset::open(&other, &registry, "/copy", &DatasetAccessProps::new())
        .unwrap();
    assert_eq!(copy.mappings()[0].source_file_name(), "a.h5");
    assert_eq!(read_all::<u32>(&mut copy), vec![7, 8, 9]);
}
