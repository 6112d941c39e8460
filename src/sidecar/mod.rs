//! Metadata Sidecar Parser — extracts the logical channel list from an
//! embedded OME-XML sidecar, independently of whether those channels are
//! physically backed.
//!
//! Parsing is never fatal.  A missing sidecar degrades to one synthesized,
//! empty-named channel per physical page (the file is still diagnosable,
//! just without names).  A malformed sidecar yields whatever channels were
//! parsed before the breakage, plus a [`MetadataWarning`].
//!
//! # Alignment assumption
//! Declared channel order is the authoritative logical order, and physical
//! page order is assumed to align 1:1 with it up to the first missing
//! channel (trailing truncation).  That matches the observed failure mode —
//! an export interrupted near the end — but the parser cannot distinguish
//! it from leading or interior truncation, so a declared/physical count
//! mismatch is surfaced as a warning rather than silently trusted.

use crate::format::PixelType;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

/// One logical channel as asserted by the sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct DeclaredChannel {
    /// 0-based, matches sidecar ordering.
    pub declared_index: u32,
    /// Possibly empty; synthesized channels always have an empty name.
    pub name: String,
    /// (height, width) from `Pixels/@SizeY,@SizeX`, when declared.
    pub expected_shape: Option<(u32, u32)>,
    pub expected_pixel_type: Option<PixelType>,
}

/// Non-fatal sidecar findings, folded into the validity report.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum MetadataWarning {
    #[error("no metadata sidecar; synthesized {pages} unnamed channel(s) from physical pages")]
    NoSidecar { pages: u32 },
    #[error("sidecar is malformed: {detail}")]
    MalformedSidecar { detail: String },
    #[error("sidecar declares SizeC={size_c} but lists {elements} Channel element(s)")]
    ChannelCountDisagrees { size_c: u32, elements: u32 },
    #[error("{declared} channel(s) declared but only {physical} physical page(s) present")]
    CountMismatch { declared: u32, physical: u32 },
}

/// Whole-image attributes captured from `Pixels`, copied into the
/// reconciled metadata when the source sidecar carried them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageAttrs {
    pub dimension_order: Option<String>,
    pub physical_size_x: Option<f64>,
    pub physical_size_y: Option<f64>,
    pub pixel_type: Option<PixelType>,
    pub size_x: Option<u32>,
    pub size_y: Option<u32>,
    pub size_c: Option<u32>,
}

/// Result of one sidecar parse: the declared channel list in authoritative
/// order, plus everything noteworthy that happened on the way.
#[derive(Debug, Clone)]
pub struct SidecarSummary {
    pub channels: Vec<DeclaredChannel>,
    pub attrs: ImageAttrs,
    pub warnings: Vec<MetadataWarning>,
}

impl SidecarSummary {
    pub fn declared_count(&self) -> u32 {
        self.channels.len() as u32
    }
}

/// Parse the embedded sidecar, if any, into the declared channel list.
///
/// `physical_pages` is used only to synthesize a fallback channel list and
/// to detect the declared/physical count mismatch; the parse itself never
/// touches the container.
pub fn parse_sidecar(raw_xml: Option<&str>, physical_pages: u32) -> SidecarSummary {
    let mut warnings = Vec::new();

    let (mut channels, attrs) = match raw_xml {
        Some(xml) => parse_ome(xml, &mut warnings),
        None => (Vec::new(), ImageAttrs::default()),
    };

    if channels.is_empty() && attrs.size_c.is_none() {
        // Either no description at all, or one that is not an OME sidecar.
        warnings.push(MetadataWarning::NoSidecar { pages: physical_pages });
        channels = (0..physical_pages)
            .map(|i| DeclaredChannel {
                declared_index: i,
                name: String::new(),
                expected_shape: None,
                expected_pixel_type: None,
            })
            .collect();
    } else if let Some(size_c) = attrs.size_c {
        let elements = channels.len() as u32;
        if size_c != elements {
            warnings.push(MetadataWarning::ChannelCountDisagrees { size_c, elements });
            // SizeC is the count the schema invariant hangs on; pad the
            // list so every declared slot is diagnosable.
            let pad_shape = channels.first().and_then(|c| c.expected_shape);
            for i in elements..size_c {
                channels.push(DeclaredChannel {
                    declared_index: i,
                    name: String::new(),
                    expected_shape: pad_shape,
                    expected_pixel_type: attrs.pixel_type,
                });
            }
        }
    }

    let declared = channels.len() as u32;
    if declared > physical_pages {
        warnings.push(MetadataWarning::CountMismatch { declared, physical: physical_pages });
    }

    SidecarSummary { channels, attrs, warnings }
}

fn parse_ome(xml: &str, warnings: &mut Vec<MetadataWarning>) -> (Vec<DeclaredChannel>, ImageAttrs) {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut channels: Vec<DeclaredChannel> = Vec::new();
    let mut attrs = ImageAttrs::default();
    let expected_shape = |a: &ImageAttrs| match (a.size_y, a.size_x) {
        (Some(h), Some(w)) => Some((h, w)),
        _ => None,
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"Pixels" => {
                    for attr in e.attributes().with_checks(false).flatten() {
                        let value = match attr.unescape_value() {
                            Ok(v) => v.into_owned(),
                            Err(_) => continue,
                        };
                        match attr.key.local_name().as_ref() {
                            b"SizeC" => attrs.size_c = value.parse().ok(),
                            b"SizeX" => attrs.size_x = value.parse().ok(),
                            b"SizeY" => attrs.size_y = value.parse().ok(),
                            b"Type" => attrs.pixel_type = PixelType::from_ome_name(&value),
                            b"DimensionOrder" => attrs.dimension_order = Some(value),
                            b"PhysicalSizeX" => attrs.physical_size_x = value.parse().ok(),
                            b"PhysicalSizeY" => attrs.physical_size_y = value.parse().ok(),
                            _ => {}
                        }
                    }
                }
                b"Channel" => {
                    let mut name = String::new();
                    for attr in e.attributes().with_checks(false).flatten() {
                        if attr.key.local_name().as_ref() == b"Name" {
                            if let Ok(v) = attr.unescape_value() {
                                name = v.into_owned();
                            }
                        }
                    }
                    channels.push(DeclaredChannel {
                        declared_index: channels.len() as u32,
                        name,
                        expected_shape: expected_shape(&attrs),
                        expected_pixel_type: attrs.pixel_type,
                    });
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                warnings.push(MetadataWarning::MalformedSidecar { detail: e.to_string() });
                break;
            }
        }
    }

    // Channel elements seen before SizeX/SizeY were parsed carry no shape;
    // backfill from the final attribute set.
    if let Some(shape) = expected_shape(&attrs) {
        for ch in &mut channels {
            ch.expected_shape.get_or_insert(shape);
            ch.expected_pixel_type = ch.expected_pixel_type.or(attrs.pixel_type);
        }
    }

    (channels, attrs)
}
