use proptest::prelude::*;
use std::sync::Mutex;
use tiffmend::diagnose::{
    diagnose, ChannelDiagnosis, ChannelStatus, DiagnosticConfig, ValidityReport,
};
use tiffmend::format::{CompressionTag, PixelType};
use tiffmend::reconcile::reconcile;
use tiffmend::sidecar::{parse_sidecar, MetadataWarning};
use tiffmend::source::{CorruptPageError, Openable, PlaneBuf, PlaneSource, SampleData, SourcePage};

// ── Mock source ──────────────────────────────────────────────────────────────

/// Synthetic source that reports attempted read sizes instead of doing
/// real I/O.  The declared dimensions can be absurd; only lattice-sized
/// buffers are ever materialized.
struct MockSource {
    pages: u32,
    shape: (u32, u32),
    /// Bytes allocated by each strided read.
    read_bytes: Mutex<Vec<u64>>,
}

impl MockSource {
    fn new(pages: u32, shape: (u32, u32)) -> Self {
        Self { pages, shape, read_bytes: Mutex::new(Vec::new()) }
    }
}

impl PlaneSource for MockSource {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn page_info(&self, index: u32) -> Option<SourcePage> {
        (index < self.pages).then(|| SourcePage {
            index,
            shape: self.shape,
            pixel_type: PixelType::U16,
            byte_offset: 16,
            tiling: Some((512, 512)),
            compression: CompressionTag::Lzw,
            openable: Openable::Unknown,
        })
    }

    fn read_strided(&self, _index: u32, stride: u32) -> Result<PlaneBuf, CorruptPageError> {
        let stride = stride.max(1);
        let height = self.shape.0.div_ceil(stride);
        let width = self.shape.1.div_ceil(stride);
        let n = height as usize * width as usize;
        self.read_bytes.lock().unwrap().push(n as u64 * 2);

        // A tenth of the lattice carries signal.
        let mut data = vec![0u16; n];
        for v in data.iter_mut().take(n / 10) {
            *v = 800;
        }
        Ok(PlaneBuf { height, width, data: SampleData::U16(data) })
    }

    fn read_region(
        &self,
        _index: u32,
        _origin: (u32, u32),
        size: (u32, u32),
    ) -> Result<PlaneBuf, CorruptPageError> {
        let n = size.0 as usize * size.1 as usize;
        Ok(PlaneBuf { height: size.0, width: size.1, data: SampleData::U16(vec![0u16; n]) })
    }
}

// ── Memory boundedness ───────────────────────────────────────────────────────

#[test]
fn diagnosis_memory_is_bounded_on_terabyte_dimensions() {
    // 2M × 2M u16 planes: 8 TB each at full resolution.
    let source = MockSource::new(6, (2_000_000, 2_000_000));
    let declared = parse_sidecar(None, 6).channels;
    let report = diagnose(&source, &declared, &DiagnosticConfig::default());

    assert_eq!(report.entries.len(), 6);
    assert!(report.entries.iter().all(|e| e.status == ChannelStatus::Valid));

    // Every strided read stayed within a constant bound, independent of
    // the 8 TB plane size: the auto stride targets a few million elements.
    let reads = source.read_bytes.lock().unwrap();
    assert_eq!(reads.len(), 6);
    for &bytes in reads.iter() {
        assert!(bytes <= 16 * 1024 * 1024, "strided read allocated {bytes} bytes");
    }

    // The full-load estimate is analytic only.
    assert_eq!(
        report.estimated_peak_memory_bytes,
        2_000_000u64 * 2_000_000 * 2 * 6
    );
}

#[test]
fn explicit_stride_is_honored() {
    let source = MockSource::new(1, (10_000, 10_000));
    let declared = parse_sidecar(None, 1).channels;
    let config = DiagnosticConfig { sample_stride: Some(100), ..DiagnosticConfig::default() };
    let report = diagnose(&source, &declared, &config);
    assert_eq!(report.sample_stride, 100);
    assert_eq!(source.read_bytes.lock().unwrap()[0], 100 * 100 * 2);
}

// ── Channel cap ──────────────────────────────────────────────────────────────

#[test]
fn max_channels_cancels_the_tail() {
    let source = MockSource::new(10, (1_000, 1_000));
    let declared = parse_sidecar(None, 10).channels;
    let config = DiagnosticConfig { max_channels: Some(4), ..DiagnosticConfig::default() };
    let report = diagnose(&source, &declared, &config);

    assert_eq!(report.entries.len(), 4);
    assert_eq!(report.declared_count, 10);
    assert_eq!(source.read_bytes.lock().unwrap().len(), 4);
}

// ── Missing classification without I/O ───────────────────────────────────────

#[test]
fn declared_beyond_physical_classify_missing() {
    let source = MockSource::new(3, (1_000, 1_000));
    let declared = parse_sidecar(None, 5).channels;
    assert_eq!(declared.len(), 5);
    let report = diagnose(&source, &declared, &DiagnosticConfig::default());

    let statuses: Vec<ChannelStatus> = report.entries.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            ChannelStatus::Valid,
            ChannelStatus::Valid,
            ChannelStatus::Valid,
            ChannelStatus::Missing,
            ChannelStatus::Missing,
        ]
    );
    // Missing channels never triggered a read.
    assert_eq!(source.read_bytes.lock().unwrap().len(), 3);
}

// ── Sidecar parsing ──────────────────────────────────────────────────────────

#[test]
fn sidecar_names_parse_in_declared_order() {
    let xml = r#"<?xml version="1.0"?>
        <OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06">
          <Image ID="Image:0">
            <Pixels ID="Pixels:0" Type="uint16" DimensionOrder="XYZCT"
                    SizeX="2048" SizeY="2048" SizeZ="1" SizeC="3" SizeT="1"
                    PhysicalSizeX="0.5" PhysicalSizeY="0.5">
              <Channel ID="Channel:0:0" Name="DAPI" SamplesPerPixel="1"/>
              <Channel ID="Channel:0:1" Name="CD3" SamplesPerPixel="1"/>
              <Channel ID="Channel:0:2" Name="CD8" SamplesPerPixel="1"/>
            </Pixels>
          </Image>
        </OME>"#;
    let summary = parse_sidecar(Some(xml), 3);
    assert_eq!(summary.declared_count(), 3);
    let names: Vec<&str> = summary.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["DAPI", "CD3", "CD8"]);
    assert_eq!(summary.channels[0].expected_shape, Some((2048, 2048)));
    assert_eq!(summary.channels[0].expected_pixel_type, Some(PixelType::U16));
    assert_eq!(summary.attrs.physical_size_x, Some(0.5));
    assert!(summary.warnings.is_empty());
}

#[test]
fn sidecar_size_c_padding_and_mismatch_warnings() {
    // SizeC says 4 but only 2 Channel elements are listed, and only 2
    // physical pages exist.
    let xml = r#"<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06">
          <Image ID="Image:0">
            <Pixels ID="Pixels:0" Type="uint16" DimensionOrder="XYZCT"
                    SizeX="512" SizeY="512" SizeZ="1" SizeC="4" SizeT="1">
              <Channel ID="Channel:0:0" Name="DAPI"/>
              <Channel ID="Channel:0:1" Name="CD3"/>
            </Pixels>
          </Image>
        </OME>"#;
    let summary = parse_sidecar(Some(xml), 2);
    assert_eq!(summary.declared_count(), 4);
    assert_eq!(summary.channels[2].name, "");
    assert!(summary
        .warnings
        .iter()
        .any(|w| matches!(w, MetadataWarning::ChannelCountDisagrees { size_c: 4, elements: 2 })));
    assert!(summary
        .warnings
        .iter()
        .any(|w| matches!(w, MetadataWarning::CountMismatch { declared: 4, physical: 2 })));
}

#[test]
fn malformed_sidecar_degrades_to_partial_list() {
    let xml = r#"<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06">
          <Image><Pixels SizeC="3" SizeX="64" SizeY="64" Type="uint16">
            <Channel Name="DAPI"/>
            <Channel Name="CD3"
        "#; // truncated mid-attribute
    let summary = parse_sidecar(Some(xml), 3);
    assert!(summary
        .warnings
        .iter()
        .any(|w| matches!(w, MetadataWarning::MalformedSidecar { .. })));
    // The channels parsed before the breakage survive, padded to SizeC.
    assert!(summary.channels.iter().any(|c| c.name == "DAPI"));
    assert_eq!(summary.declared_count(), 3);
}

#[test]
fn non_ome_description_counts_as_no_sidecar() {
    let summary = parse_sidecar(Some("ImageJ=1.53c\nimages=4"), 4);
    assert_eq!(summary.declared_count(), 4);
    assert!(summary.channels.iter().all(|c| c.name.is_empty()));
    assert!(summary
        .warnings
        .iter()
        .any(|w| matches!(w, MetadataWarning::NoSidecar { pages: 4 })));
}

// ── Reconciliation properties ────────────────────────────────────────────────

fn report_from_statuses(statuses: &[ChannelStatus]) -> ValidityReport {
    let entries: Vec<ChannelDiagnosis> = statuses
        .iter()
        .enumerate()
        .map(|(i, &status)| ChannelDiagnosis {
            declared_index: i as u32,
            name: format!("ch{i}"),
            status,
            stats: None,
            backing_page: (status != ChannelStatus::Missing).then_some(i as u32),
            detail: None,
        })
        .collect();
    ValidityReport {
        declared_count: entries.len() as u32,
        accessible_page_count: entries.len() as u32,
        estimated_peak_memory_bytes: 0,
        sample_stride: 1,
        non_zero_threshold_pct: 1.0,
        warnings: Vec::new(),
        entries,
    }
}

proptest! {
    #[test]
    fn renumbering_map_is_an_order_preserving_bijection(
        raw in prop::collection::vec(0u8..4, 1..40)
    ) {
        let statuses: Vec<ChannelStatus> = raw
            .iter()
            .map(|s| match s {
                0 => ChannelStatus::Valid,
                1 => ChannelStatus::Empty,
                2 => ChannelStatus::Missing,
                _ => ChannelStatus::Corrupt,
            })
            .collect();
        let report = report_from_statuses(&statuses);
        let sidecar = parse_sidecar(None, statuses.len() as u32);
        let valid: Vec<u32> = report.valid_indices().collect();

        match reconcile(&report, &sidecar, None) {
            Ok((map, metadata)) => {
                prop_assert!(!valid.is_empty());
                prop_assert_eq!(map.len(), valid.len());
                prop_assert_eq!(metadata.size_c as usize, map.len());
                prop_assert_eq!(metadata.channels.len(), map.len());
                for (new, orig) in map.iter() {
                    // Contiguous new indices, original order preserved.
                    prop_assert_eq!(valid[new as usize], orig);
                    prop_assert_eq!(map.new_index(orig), Some(new));
                    prop_assert_eq!(
                        &metadata.channels[new as usize].name,
                        &format!("ch{orig}")
                    );
                }
            }
            Err(_) => prop_assert!(valid.is_empty()),
        }
    }
}
