use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::tempdir;
use tiffmend::diagnose::{ChannelStatus, DiagnosticConfig};
use tiffmend::format::PixelType;
use tiffmend::repair::{diagnose_file, repair_file, RepairError};
use tiffmend::sidecar::parse_sidecar;
use tiffmend::source::{PlaneSource, SourceImage};
use tiffmend::writer::{
    extract, selects_big_tiff, Compression, OutputSink, TiffWriter, WriteConfig,
};

// ── fixtures ─────────────────────────────────────────────────────────────────

/// Row-major little-endian u16 plane with the first `signal` pixels set.
fn plane_u16(height: u32, width: u32, signal: usize) -> Vec<u8> {
    let mut raw = vec![0u8; (height * width) as usize * 2];
    for i in 0..signal {
        raw[i * 2..i * 2 + 2].copy_from_slice(&1000u16.to_le_bytes());
    }
    raw
}

fn ome_xml(size_c: u32, names: &[&str], width: u32, height: u32) -> String {
    let channels: String = names
        .iter()
        .enumerate()
        .map(|(i, n)| format!("<Channel ID=\"Channel:0:{i}\" Name=\"{n}\" SamplesPerPixel=\"1\"/>"))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <OME xmlns=\"http://www.openmicroscopy.org/Schemas/OME/2016-06\">\
         <Image ID=\"Image:0\"><Pixels ID=\"Pixels:0\" Type=\"uint16\" \
         DimensionOrder=\"XYZCT\" SizeX=\"{width}\" SizeY=\"{height}\" SizeZ=\"1\" \
         SizeC=\"{size_c}\" SizeT=\"1\" PhysicalSizeX=\"0.65\" PhysicalSizeY=\"0.65\">\
         {channels}<TiffData/></Pixels></Image></OME>"
    )
}

fn write_container(
    path: &Path,
    planes: &[Vec<u8>],
    shape: (u32, u32),
    description: Option<&str>,
    compression: Compression,
) {
    let config = WriteConfig { tile_shape: (64, 64), compression, per_channel_files: false };
    let file = File::create(path).unwrap();
    let mut writer = TiffWriter::new(BufWriter::new(file), false).unwrap();
    for (i, raw) in planes.iter().enumerate() {
        let desc = if i == 0 { description } else { None };
        writer.append_plane(raw, shape, PixelType::U16, desc, &config).unwrap();
    }
    writer.finalize().unwrap();
}

/// Overwrite `len` bytes at `offset` with zeros.  On a deflate-compressed
/// segment this guarantees a decode failure (invalid zlib header).
fn smash_bytes(path: &Path, offset: u64, len: usize) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&vec![0u8; len]).unwrap();
}

// ── Scenario A: declared 5, stored 3, one unreadable ─────────────────────────

#[test]
fn scenario_a_truncated_and_corrupt_panel() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("panel.ome.tif");
    let shape = (100, 100);
    let planes = vec![
        plane_u16(100, 100, 1000), // 10% non-zero
        plane_u16(100, 100, 0),    // empty
        plane_u16(100, 100, 500),  // will be corrupted on disk
    ];
    let xml = ome_xml(5, &["DAPI", "CD3", "CD8", "CD20", "PanCK"], 100, 100);
    write_container(&src, &planes, shape, Some(&xml), Compression::Deflate);

    let offset = {
        let image = SourceImage::open(&src).unwrap();
        image.page_info(2).unwrap().byte_offset
    };
    smash_bytes(&src, offset, 8);

    let diagnosed = diagnose_file(&src, &DiagnosticConfig::default()).unwrap();
    let statuses: Vec<ChannelStatus> = diagnosed.report.entries.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            ChannelStatus::Valid,
            ChannelStatus::Empty,
            ChannelStatus::Corrupt,
            ChannelStatus::Missing,
            ChannelStatus::Missing,
        ]
    );
    assert_eq!(diagnosed.report.declared_count, 5);
    assert_eq!(diagnosed.report.accessible_page_count, 3);
    assert_eq!(diagnosed.report.entries[3].backing_page, None);
    assert!(diagnosed.report.entries[2].detail.is_some());

    let (map, metadata) = diagnosed.reconcile().unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.original(0), Some(0));
    assert_eq!(metadata.size_c, 1);
    assert_eq!(metadata.channels[0].name, "DAPI");
    // Whole-image attributes copied verbatim from the name-bearing source.
    assert_eq!(metadata.physical_size_x, 0.65);

    let out = dir.path().join("repaired.ome.tif");
    let outcome = extract(
        &diagnosed.image,
        &map,
        &metadata,
        &OutputSink::new(&out),
        &WriteConfig::default(),
    )
    .unwrap();
    assert_eq!(outcome.planes_written, 1);

    // Metadata-consistency invariant: SizeC == Channel count == page count.
    let repaired = SourceImage::open(&out).unwrap();
    assert_eq!(repaired.page_count(), 1);
    let sc = parse_sidecar(repaired.sidecar_xml(), repaired.page_count());
    assert_eq!(sc.attrs.size_c, Some(1));
    assert_eq!(sc.declared_count(), 1);
    assert_eq!(sc.channels[0].name, "DAPI");
    assert!(sc.warnings.is_empty());
}

// ── Scenario B: healthy panel round-trips losslessly ─────────────────────────

#[test]
fn scenario_b_all_valid_names_preserved() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("healthy.ome.tif");
    let shape = (100, 100);
    let planes = vec![
        plane_u16(100, 100, 1000),
        plane_u16(100, 100, 2000),
        plane_u16(100, 100, 3000),
    ];
    let xml = ome_xml(3, &["DAPI", "CD45", "PanCK"], 100, 100);
    write_container(&src, &planes, shape, Some(&xml), Compression::Lzw);

    let out = dir.path().join("healthy_cleaned.ome.tif");
    let outcome = repair_file(
        &src,
        &DiagnosticConfig::default(),
        &OutputSink::new(&out),
        &WriteConfig::default(),
    )
    .unwrap();
    assert_eq!(outcome.extraction.planes_written, 3);

    let repaired = SourceImage::open(&out).unwrap();
    assert_eq!(repaired.page_count(), 3);
    let sc = parse_sidecar(repaired.sidecar_xml(), repaired.page_count());
    assert_eq!(sc.attrs.size_c, Some(3));
    let names: Vec<&str> = sc.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["DAPI", "CD45", "PanCK"]);

    // Lossless re-encoding of retained pixel data.
    for (i, original) in planes.iter().enumerate() {
        let plane = repaired.read_full(i as u32).unwrap();
        assert_eq!(&plane.to_le_bytes(), original);
    }
}

// ── Scenario C: no sidecar at all ────────────────────────────────────────────

#[test]
fn scenario_c_no_sidecar_synthesizes_channels() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("bare.tif");
    let shape = (64, 64);
    let planes: Vec<Vec<u8>> = (0..4).map(|_| plane_u16(64, 64, 512)).collect();
    write_container(&src, &planes, shape, None, Compression::Lzw);

    let diagnosed = diagnose_file(&src, &DiagnosticConfig::default()).unwrap();
    assert_eq!(diagnosed.report.declared_count, 4);
    assert!(diagnosed.report.entries.iter().all(|e| e.status == ChannelStatus::Valid));
    assert!(diagnosed.report.entries.iter().all(|e| e.name.is_empty()));
    assert!(diagnosed
        .report
        .warnings
        .iter()
        .any(|w| matches!(w, tiffmend::MetadataWarning::NoSidecar { pages: 4 })));

    let out = dir.path().join("bare_cleaned.ome.tif");
    let (map, metadata) = diagnosed.reconcile().unwrap();
    let config = WriteConfig { per_channel_files: true, ..WriteConfig::default() };
    let outcome = extract(&diagnosed.image, &map, &metadata, &OutputSink::new(&out), &config).unwrap();

    let repaired = SourceImage::open(&out).unwrap();
    let sc = parse_sidecar(repaired.sidecar_xml(), repaired.page_count());
    assert_eq!(sc.attrs.size_c, Some(4));
    assert!(sc.channels.iter().all(|c| c.name.is_empty()));

    // Unnamed channels fall back to index-only artifact names.
    assert_eq!(outcome.per_channel_paths.len(), 4);
    for (i, path) in outcome.per_channel_paths.iter().enumerate() {
        assert!(path.ends_with(format!("bare_cleaned_channel_{i:03}.ome.tif")));
        let single = SourceImage::open(path).unwrap();
        assert_eq!(single.page_count(), 1);
        let single_sc = parse_sidecar(single.sidecar_xml(), 1);
        assert_eq!(single_sc.attrs.size_c, Some(1));
    }
}

// ── Scenario D: large-file trigger ───────────────────────────────────────────

#[test]
fn scenario_d_selects_big_tiff_before_first_byte() {
    let config = WriteConfig::default();
    // 3 × 50k × 50k × u16 ≈ 15 GB projected: past the 32-bit offset limit.
    assert!(selects_big_tiff(3, (50_000, 50_000), PixelType::U16, &config));
    assert!(!selects_big_tiff(3, (1_000, 1_000), PixelType::U16, &config));

    // The variant is committed in the very first bytes laid down.
    let mut cursor = Cursor::new(Vec::new());
    TiffWriter::new(&mut cursor, true).unwrap();
    let bytes = cursor.into_inner();
    assert_eq!(&bytes[..2], b"II");
    assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 43);
}

#[test]
fn big_tiff_output_reads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("big.ome.tif");
    let config = WriteConfig { tile_shape: (32, 32), ..WriteConfig::default() };
    let raw = plane_u16(48, 48, 100);

    let file = File::create(&path).unwrap();
    let mut writer = TiffWriter::new(BufWriter::new(file), true).unwrap();
    writer.append_plane(&raw, (48, 48), PixelType::U16, Some("big variant"), &config).unwrap();
    writer.finalize().unwrap();

    let image = SourceImage::open(&path).unwrap();
    assert!(image.is_big_tiff());
    assert_eq!(image.page_count(), 1);
    assert_eq!(image.read_full(0).unwrap().to_le_bytes(), raw);
}

// ── Boundary: threshold inclusivity ──────────────────────────────────────────

#[test]
fn threshold_is_inclusive() {
    let dir = tempdir().unwrap();
    let config = DiagnosticConfig { sample_stride: Some(1), ..DiagnosticConfig::default() };

    // Exactly 1% of 100x100 sampled pixels: classifies Valid.
    let on_threshold = dir.path().join("exact.tif");
    write_container(&on_threshold, &[plane_u16(100, 100, 100)], (100, 100), None, Compression::Lzw);
    let report = diagnose_file(&on_threshold, &config).unwrap().report;
    assert_eq!(report.entries[0].status, ChannelStatus::Valid);
    let stats = report.entries[0].stats.unwrap();
    assert_eq!(stats.nonzero_pct, 1.0);

    // One pixel short: Empty.
    let below = dir.path().join("below.tif");
    write_container(&below, &[plane_u16(100, 100, 99)], (100, 100), None, Compression::Lzw);
    let report = diagnose_file(&below, &config).unwrap().report;
    assert_eq!(report.entries[0].status, ChannelStatus::Empty);
}

// ── Boundary: zero valid channels ────────────────────────────────────────────

#[test]
fn all_empty_panel_is_a_hard_stop() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("void.ome.tif");
    let planes = vec![plane_u16(64, 64, 0), plane_u16(64, 64, 0)];
    let xml = ome_xml(2, &["A", "B"], 64, 64);
    write_container(&src, &planes, (64, 64), Some(&xml), Compression::Lzw);

    let out = dir.path().join("void_cleaned.ome.tif");
    let err = repair_file(
        &src,
        &DiagnosticConfig::default(),
        &OutputSink::new(&out),
        &WriteConfig::default(),
    )
    .unwrap_err();
    match &err {
        RepairError::NoValidChannels { report, .. } => {
            assert_eq!(report.declared_count, 2);
        }
        other => panic!("expected NoValidChannels, got {other:?}"),
    }
    // The diagnosis is still available and no output was produced.
    assert!(err.report().is_some());
    assert!(!out.exists());
}

// ── Extraction failure cleans up partial output ──────────────────────────────

#[test]
fn extraction_failure_removes_partial_output() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("flaky.ome.tif");
    let planes = vec![plane_u16(100, 100, 1000), plane_u16(100, 100, 1000)];
    let xml = ome_xml(2, &["A", "B"], 100, 100);
    write_container(&src, &planes, (100, 100), Some(&xml), Compression::Deflate);

    let diagnosed = diagnose_file(&src, &DiagnosticConfig::default()).unwrap();
    let (map, metadata) = diagnosed.reconcile().unwrap();
    assert_eq!(map.len(), 2);

    // The file changes between diagnosis and extraction: plane 1 becomes
    // unreadable, which is fatal for the whole extraction.
    let offset = diagnosed.image.page_info(1).unwrap().byte_offset;
    smash_bytes(&src, offset, 8);

    let out = dir.path().join("flaky_cleaned.ome.tif");
    let result = extract(
        &diagnosed.image,
        &map,
        &metadata,
        &OutputSink::new(&out),
        &WriteConfig::default(),
    );
    assert!(result.is_err());
    assert!(!out.exists(), "partial output must be removed");
}

// ── Determinism & idempotence ────────────────────────────────────────────────

#[test]
fn diagnosis_is_deterministic() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("panel.ome.tif");
    let planes = vec![plane_u16(128, 128, 900), plane_u16(128, 128, 10)];
    let xml = ome_xml(3, &["A", "B", "C"], 128, 128);
    write_container(&src, &planes, (128, 128), Some(&xml), Compression::Lzw);

    let config = DiagnosticConfig::default();
    let first = diagnose_file(&src, &config).unwrap().report;
    let second = diagnose_file(&src, &config).unwrap().report;
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn reconciled_metadata_is_idempotent_across_extractions() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("panel.ome.tif");
    let planes = vec![plane_u16(64, 64, 500), plane_u16(64, 64, 500)];
    let xml = ome_xml(2, &["DAPI", "CD3"], 64, 64);
    write_container(&src, &planes, (64, 64), Some(&xml), Compression::Lzw);

    let diagnosed = diagnose_file(&src, &DiagnosticConfig::default()).unwrap();
    let (map, metadata) = diagnosed.reconcile().unwrap();

    let out_a = dir.path().join("a.ome.tif");
    let out_b = dir.path().join("b.ome.tif");
    let config = WriteConfig::default();
    extract(&diagnosed.image, &map, &metadata, &OutputSink::new(&out_a), &config).unwrap();
    extract(&diagnosed.image, &map, &metadata, &OutputSink::new(&out_b), &config).unwrap();

    let sidecar_a = SourceImage::open(&out_a).unwrap().sidecar_xml().unwrap().to_owned();
    let sidecar_b = SourceImage::open(&out_b).unwrap().sidecar_xml().unwrap().to_owned();
    assert_eq!(sidecar_a, sidecar_b);
}

// ── Per-channel artifacts carry the channel name ─────────────────────────────

#[test]
fn per_channel_files_embed_names() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("named.ome.tif");
    let planes = vec![plane_u16(64, 64, 500), plane_u16(64, 64, 500)];
    let xml = ome_xml(2, &["DAPI", "CD3 epsilon"], 64, 64);
    write_container(&src, &planes, (64, 64), Some(&xml), Compression::Lzw);

    let out = dir.path().join("named_cleaned.ome.tif");
    let config = WriteConfig { per_channel_files: true, ..WriteConfig::default() };
    let outcome = repair_file(
        &src,
        &DiagnosticConfig::default(),
        &OutputSink::new(&out),
        &config,
    )
    .unwrap();

    let names: Vec<String> = outcome
        .extraction
        .per_channel_paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "named_cleaned_000_DAPI.ome.tif".to_owned(),
            "named_cleaned_001_CD3_epsilon.ome.tif".to_owned(),
        ]
    );
}

// ── JPEG output restrictions ─────────────────────────────────────────────────

#[test]
fn jpeg_output_rejects_u16_planes() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("panel.ome.tif");
    write_container(&src, &[plane_u16(64, 64, 500)], (64, 64), None, Compression::Lzw);

    let diagnosed = diagnose_file(&src, &DiagnosticConfig::default()).unwrap();
    let (map, metadata) = diagnosed.reconcile().unwrap();

    let out = dir.path().join("panel.jpegged.tif");
    let config = WriteConfig { compression: Compression::Jpeg, ..WriteConfig::default() };
    let result = extract(&diagnosed.image, &map, &metadata, &OutputSink::new(&out), &config);
    assert!(result.is_err());
    assert!(!out.exists());
}

// ── Uncompressed output round-trips ──────────────────────────────────────────

#[test]
fn uncompressed_output_reads_back() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.tif");
    let raw = plane_u16(80, 80, 640);
    write_container(&src, &[raw.clone()], (80, 80), None, Compression::None);

    let image = SourceImage::open(&src).unwrap();
    assert_eq!(image.read_full(0).unwrap().to_le_bytes(), raw);

    // Strided read of the same plane visits the lattice only.
    let sampled = image.read_strided(0, 8).unwrap();
    assert_eq!(sampled.height, 10);
    assert_eq!(sampled.width, 10);
    assert_eq!(sampled.len(), 100);
}
