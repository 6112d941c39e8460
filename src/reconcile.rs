//! Metadata Reconciler — selects the retained channel set and synthesizes
//! a fresh, consistent metadata tree for exactly those channels.
//!
//! The reconciled tree is the artifact the repaired container's sidecar is
//! written from, verbatim: `SizeC` equals the renumbering map's length
//! equals the number of planes the extraction writer will emit, which is
//! the invariant defective inputs violate.

use crate::diagnose::{ChannelStatus, ValidityReport};
use crate::format::PixelType;
use crate::sidecar::SidecarSummary;
use crate::source::SourcePage;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Reconciliation found nothing to retain.  A hard stop: an empty-channel
/// output container is not a meaningful artifact.
#[derive(Error, Debug)]
#[error(
    "no valid channels to retain ({empty} empty, {corrupt} corrupt, {missing} of {declared} \
     declared missing)"
)]
pub struct NoValidChannelsError {
    pub declared: u32,
    pub empty: usize,
    pub corrupt: usize,
    pub missing: usize,
}

// ── RenumberingMap ───────────────────────────────────────────────────────────

/// Order-preserving bijection from the retained original indices to the
/// contiguous range `0..len`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenumberingMap {
    /// `retained[new_index] == original_declared_index`, ascending.
    retained: Vec<u32>,
}

impl RenumberingMap {
    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    /// Iterate `(new_index, original_index)` in new-index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.retained.iter().enumerate().map(|(new, &orig)| (new as u32, orig))
    }

    pub fn original(&self, new_index: u32) -> Option<u32> {
        self.retained.get(new_index as usize).copied()
    }

    pub fn new_index(&self, original: u32) -> Option<u32> {
        self.retained.iter().position(|&o| o == original).map(|i| i as u32)
    }
}

// ── ReconciledMetadata ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledChannel {
    /// Copied unmodified from the declared channel; may be empty.
    pub name: String,
}

/// Freshly synthesized metadata tree for the retained channels.  Never
/// mutated after creation; the writer embeds `to_ome_xml()` verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledMetadata {
    pub size_c: u32,
    pub size_x: u32,
    pub size_y: u32,
    pub pixel_type: PixelType,
    pub dimension_order: String,
    pub physical_size_x: f64,
    pub physical_size_y: f64,
    pub channels: Vec<ReconciledChannel>,
    /// Fresh per-repair identity, fixed at construction so rendering is
    /// deterministic for a given metadata value.
    pub uuid: String,
}

impl ReconciledMetadata {
    /// Render the embedded sidecar.  The output satisfies
    /// `Pixels.SizeC == count(Channel elements)` by construction.
    pub fn to_ome_xml(&self) -> String {
        let channels: String = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, ch)| {
                format!(
                    "      <Channel ID=\"Channel:0:{i}\" Name=\"{}\" SamplesPerPixel=\"1\" />\n",
                    quick_xml::escape::escape(&ch.name)
                )
            })
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <OME xmlns=\"http://www.openmicroscopy.org/Schemas/OME/2016-06\"\n\
             \x20    xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"\n\
             \x20    UUID=\"urn:uuid:{uuid}\"\n\
             \x20    xsi:schemaLocation=\"http://www.openmicroscopy.org/Schemas/OME/2016-06 \
             http://www.openmicroscopy.org/Schemas/OME/2016-06/ome.xsd\">\n\
             \x20 <Image ID=\"Image:0\" Name=\"Extracted Channels\">\n\
             \x20   <Pixels ID=\"Pixels:0\"\n\
             \x20           Type=\"{ptype}\"\n\
             \x20           DimensionOrder=\"{dim_order}\"\n\
             \x20           SizeX=\"{size_x}\"\n\
             \x20           SizeY=\"{size_y}\"\n\
             \x20           SizeZ=\"1\"\n\
             \x20           SizeC=\"{size_c}\"\n\
             \x20           SizeT=\"1\"\n\
             \x20           PhysicalSizeX=\"{phys_x}\"\n\
             \x20           PhysicalSizeY=\"{phys_y}\"\n\
             \x20           PhysicalSizeXUnit=\"µm\"\n\
             \x20           PhysicalSizeYUnit=\"µm\"\n\
             \x20           Interleaved=\"false\"\n\
             \x20           BigEndian=\"false\">\n\
             {channels}\
             \x20     <TiffData />\n\
             \x20   </Pixels>\n\
             \x20 </Image>\n\
             </OME>",
            uuid = self.uuid,
            ptype = self.pixel_type.ome_name(),
            dim_order = self.dimension_order,
            size_x = self.size_x,
            size_y = self.size_y,
            size_c = self.size_c,
            phys_x = self.physical_size_x,
            phys_y = self.physical_size_y,
            channels = channels,
        )
    }

    /// Metadata for one retained channel written to its own container
    /// (`per_channel_files`).  Gets its own identity.
    pub fn single_channel(&self, new_index: u32) -> Option<ReconciledMetadata> {
        let channel = self.channels.get(new_index as usize)?.clone();
        Some(ReconciledMetadata {
            size_c: 1,
            channels: vec![channel],
            uuid: Uuid::new_v4().to_string(),
            ..self.clone()
        })
    }
}

// ── Reconciliation ───────────────────────────────────────────────────────────

/// Select all `Valid` channels in ascending original order and synthesize
/// the metadata tree for exactly that set.
///
/// `reference` is the page record of the first retained plane; it supplies
/// the authoritative output dimensions and element kind.  Whole-image
/// attributes (dimension order, physical pixel size) are copied from the
/// source sidecar when any retained channel carries a name, and defaulted
/// otherwise.
pub fn reconcile(
    report: &ValidityReport,
    sidecar: &SidecarSummary,
    reference: Option<&SourcePage>,
) -> Result<(RenumberingMap, ReconciledMetadata), NoValidChannelsError> {
    let retained: Vec<&crate::diagnose::ChannelDiagnosis> = report
        .entries
        .iter()
        .filter(|e| e.status == ChannelStatus::Valid)
        .collect();

    if retained.is_empty() {
        return Err(NoValidChannelsError {
            declared: report.declared_count,
            empty: report.count(ChannelStatus::Empty),
            corrupt: report.count(ChannelStatus::Corrupt),
            missing: report.count(ChannelStatus::Missing),
        });
    }

    let map = RenumberingMap { retained: retained.iter().map(|e| e.declared_index).collect() };

    let name_bearing = retained.iter().any(|e| !e.name.is_empty());
    let attrs = &sidecar.attrs;

    let (size_y, size_x) = reference
        .map(|p| p.shape)
        .or_else(|| match (attrs.size_y, attrs.size_x) {
            (Some(h), Some(w)) => Some((h, w)),
            _ => None,
        })
        .unwrap_or((0, 0));
    let pixel_type = reference
        .map(|p| p.pixel_type)
        .or(attrs.pixel_type)
        .unwrap_or(PixelType::U16);

    let metadata = ReconciledMetadata {
        size_c: map.len() as u32,
        size_x,
        size_y,
        pixel_type,
        dimension_order: if name_bearing {
            attrs.dimension_order.clone().unwrap_or_else(|| "XYZCT".into())
        } else {
            "XYZCT".into()
        },
        physical_size_x: if name_bearing { attrs.physical_size_x.unwrap_or(1.0) } else { 1.0 },
        physical_size_y: if name_bearing { attrs.physical_size_y.unwrap_or(1.0) } else { 1.0 },
        channels: retained
            .iter()
            .map(|e| ReconciledChannel { name: e.name.clone() })
            .collect(),
        uuid: Uuid::new_v4().to_string(),
    };
    debug_assert_eq!(metadata.size_c as usize, map.len());

    Ok((map, metadata))
}
