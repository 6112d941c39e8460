//! Validity Diagnostic Engine — classifies every declared channel with a
//! bounded, strided read; never a full-resolution full-plane read.
//!
//! # Classification
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `Valid` | backing page read; sampled non-background fraction ≥ threshold |
//! | `Empty` | backing page read; sampled fraction below threshold |
//! | `Missing` | no backing page exists (declared more channels than stored) |
//! | `Corrupt` | backing page exists but the strided read failed |
//!
//! The threshold comparison is inclusive (`>=`): a channel sitting exactly
//! on the threshold classifies `Valid`.  Running the pass twice with the
//! same config on an unchanged file yields an identical report — the
//! stride fixes the sampled lattice and the lattice fixes the statistics.
//!
//! # Failure model
//! Per-channel problems are folded into the report (internally a
//! `Result` per channel, flattened); the pass as a whole never fails.
//! With the `parallel` feature the channels fan out over a Rayon pool —
//! strided reads keep per-worker memory independent of source resolution,
//! and the report is assembled by index, so output order is deterministic
//! even though execution order is not.

use crate::sidecar::{DeclaredChannel, MetadataWarning};
use crate::source::{PlaneSource, SampleData};
use log::{debug, info};
use serde::Serialize;

/// Auto-stride target: keep the sampled lattice near this many elements.
const TARGET_SAMPLE_ELEMENTS: u64 = 4_194_304;

/// Background floor for float samples; integer kinds use exact zero.
const FLOAT_BACKGROUND_FLOOR: f64 = 1e-6;

// ── Configuration ────────────────────────────────────────────────────────────

/// Options for one diagnostic pass.  Everything has a documented default.
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    /// Minimum sampled non-background percentage for a channel to classify
    /// `Valid`.  Inclusive comparison.
    pub non_zero_threshold_pct: f32,
    /// Sample every n-th row and column.  `None` picks the smallest stride
    /// that keeps the lattice near a few million elements, whatever the
    /// source resolution.
    pub sample_stride: Option<u32>,
    /// Cap the number of channels diagnosed (wide panels).  Reaching the
    /// cap cancels the remainder of the pass; see [`ValidityReport`].
    pub max_channels: Option<u32>,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self { non_zero_threshold_pct: 1.0, sample_stride: None, max_channels: None }
    }
}

// ── Diagnosis records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelStatus {
    Valid,
    Empty,
    Missing,
    Corrupt,
}

impl ChannelStatus {
    pub fn name(self) -> &'static str {
        match self {
            ChannelStatus::Valid => "valid",
            ChannelStatus::Empty => "empty",
            ChannelStatus::Missing => "missing",
            ChannelStatus::Corrupt => "corrupt",
        }
    }
}

/// Statistics over the sampled lattice.  Present only for channels whose
/// backing page was actually read (`Valid` and `Empty`).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SampleStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Percentage of sampled elements above the background floor.
    pub nonzero_pct: f64,
    /// Number of elements in the sampled lattice.
    pub sampled: u64,
}

/// Result of validity analysis for one declared channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDiagnosis {
    pub declared_index: u32,
    /// Channel name from the sidecar; empty for synthesized channels.
    pub name: String,
    pub status: ChannelStatus,
    pub stats: Option<SampleStats>,
    /// Physical page this channel maps to; `None` when `Missing`.
    pub backing_page: Option<u32>,
    /// Read-failure detail for `Corrupt` channels.
    pub detail: Option<String>,
}

/// Aggregate over all declared channels of one file.
#[derive(Debug, Clone, Serialize)]
pub struct ValidityReport {
    /// One entry per diagnosed channel, in declared order.  Covers every
    /// declared channel unless `max_channels` cancelled the tail of the
    /// pass, in which case exactly the first `max_channels` appear.
    pub entries: Vec<ChannelDiagnosis>,
    /// Full declared channel count, independent of any cap.
    pub declared_count: u32,
    /// Pages physically enumerated in the container directory.
    pub accessible_page_count: u32,
    /// Analytic cost of a hypothetical full-resolution load of every
    /// declared plane (dimensions × dtype × count).  Never allocated.
    pub estimated_peak_memory_bytes: u64,
    /// The stride the pass actually sampled with.
    pub sample_stride: u32,
    pub non_zero_threshold_pct: f32,
    /// Sidecar findings, attached by the caller that parsed the sidecar.
    pub warnings: Vec<MetadataWarning>,
}

impl ValidityReport {
    pub fn count(&self, status: ChannelStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn valid_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .filter(|e| e.status == ChannelStatus::Valid)
            .map(|e| e.declared_index)
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "{} valid, {} empty, {} corrupt, {} of {} declared channel(s) missing; \
             {} page(s) accessible; full-resolution load would need {}",
            self.count(ChannelStatus::Valid),
            self.count(ChannelStatus::Empty),
            self.count(ChannelStatus::Corrupt),
            self.count(ChannelStatus::Missing),
            self.declared_count,
            self.accessible_page_count,
            human_bytes(self.estimated_peak_memory_bytes),
        )
    }

    /// Per-channel status table for console or log emission.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<7} {:<22} {:<8} {:>12} {:>12} {:>10}  {}\n",
            "Index", "Name", "Status", "Max", "Mean", "Non-zero%", "Page"
        ));
        for e in &self.entries {
            let (max, mean, nz) = match e.stats {
                Some(s) => (
                    format!("{:.0}", s.max),
                    format!("{:.2}", s.mean),
                    format!("{:.2}", s.nonzero_pct),
                ),
                None => ("—".into(), "—".into(), "—".into()),
            };
            let page = e.backing_page.map_or_else(|| "—".into(), |p| p.to_string());
            out.push_str(&format!(
                "{:<7} {:<22} {:<8} {:>12} {:>12} {:>10}  {}\n",
                e.declared_index, e.name, e.status.name(), max, mean, nz, page
            ));
            if let Some(detail) = &e.detail {
                out.push_str(&format!("        ↳ {detail}\n"));
            }
        }
        out
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.2} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.2} MiB", b / MIB)
    } else {
        format!("{bytes} B")
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Diagnose every declared channel against the physical planes.
///
/// Read-only and side-effect-free; failure on one channel never aborts the
/// pass.
pub fn diagnose<S: PlaneSource>(
    source: &S,
    declared: &[DeclaredChannel],
    config: &DiagnosticConfig,
) -> ValidityReport {
    let page_count = source.page_count();
    let stride = config
        .sample_stride
        .map(|s| s.max(1))
        .unwrap_or_else(|| auto_stride(source));
    let threshold = config.non_zero_threshold_pct;

    let limit = match config.max_channels {
        Some(cap) => (cap as usize).min(declared.len()),
        None => declared.len(),
    };
    if limit < declared.len() {
        info!(
            "channel cap reached: diagnosing {limit} of {} declared channel(s)",
            declared.len()
        );
    }
    debug!("diagnostic pass: stride={stride}, threshold={threshold}%, {limit} channel(s)");

    let work = &declared[..limit];
    #[cfg(feature = "parallel")]
    let entries: Vec<ChannelDiagnosis> = {
        use rayon::prelude::*;
        work.par_iter()
            .map(|ch| classify(source, ch, page_count, stride, threshold))
            .collect()
    };
    #[cfg(not(feature = "parallel"))]
    let entries: Vec<ChannelDiagnosis> = work
        .iter()
        .map(|ch| classify(source, ch, page_count, stride, threshold))
        .collect();

    ValidityReport {
        entries,
        declared_count: declared.len() as u32,
        accessible_page_count: page_count,
        estimated_peak_memory_bytes: estimate_full_load(source, declared.len() as u64),
        sample_stride: stride,
        non_zero_threshold_pct: threshold,
        warnings: Vec::new(),
    }
}

/// Classify one declared channel.  The per-channel `Result` from the
/// strided read is folded here, so the caller's report is complete by
/// construction.
fn classify<S: PlaneSource>(
    source: &S,
    channel: &DeclaredChannel,
    page_count: u32,
    stride: u32,
    threshold_pct: f32,
) -> ChannelDiagnosis {
    let index = channel.declared_index;
    if index >= page_count {
        return ChannelDiagnosis {
            declared_index: index,
            name: channel.name.clone(),
            status: ChannelStatus::Missing,
            stats: None,
            backing_page: None,
            detail: None,
        };
    }

    match source.read_strided(index, stride) {
        Err(e) => ChannelDiagnosis {
            declared_index: index,
            name: channel.name.clone(),
            status: ChannelStatus::Corrupt,
            stats: None,
            backing_page: Some(index),
            detail: Some(e.to_string()),
        },
        Ok(buf) => {
            let stats = sample_stats(&buf.data);
            let status = if stats.nonzero_pct >= f64::from(threshold_pct) {
                ChannelStatus::Valid
            } else {
                ChannelStatus::Empty
            };
            ChannelDiagnosis {
                declared_index: index,
                name: channel.name.clone(),
                status,
                stats: Some(stats),
                backing_page: Some(index),
                detail: None,
            }
        }
    }
}

/// Smallest stride that keeps the sampled lattice near the target element
/// count, derived from the first page that reports a shape.
fn auto_stride<S: PlaneSource>(source: &S) -> u32 {
    let shape = (0..source.page_count())
        .filter_map(|i| source.page_info(i))
        .map(|p| p.shape)
        .find(|&(h, w)| h > 0 && w > 0);
    match shape {
        Some((h, w)) => {
            let pixels = u64::from(h) * u64::from(w);
            if pixels <= TARGET_SAMPLE_ELEMENTS {
                1
            } else {
                (pixels as f64 / TARGET_SAMPLE_ELEMENTS as f64).sqrt().ceil() as u32
            }
        }
        None => 1,
    }
}

fn estimate_full_load<S: PlaneSource>(source: &S, declared: u64) -> u64 {
    (0..source.page_count())
        .filter_map(|i| source.page_info(i))
        .find(|p| p.shape.0 > 0 && p.shape.1 > 0)
        .map(|p| {
            u64::from(p.shape.0) * u64::from(p.shape.1) * p.pixel_type.byte_width() as u64 * declared
        })
        .unwrap_or(0)
}

// ── Statistics ───────────────────────────────────────────────────────────────

/// Compute the sampled statistics, dispatching the background floor on the
/// element-kind tag.
pub fn sample_stats(data: &SampleData) -> SampleStats {
    match data {
        SampleData::U8(v) => fold(v, |x| f64::from(x), 0.0),
        SampleData::U16(v) => fold(v, |x| f64::from(x), 0.0),
        SampleData::U32(v) => fold(v, |x| f64::from(x), 0.0),
        SampleData::I8(v) => fold(v, |x| f64::from(x), 0.0),
        SampleData::I16(v) => fold(v, |x| f64::from(x), 0.0),
        SampleData::I32(v) => fold(v, |x| f64::from(x), 0.0),
        SampleData::F32(v) => fold(v, |x| f64::from(x), FLOAT_BACKGROUND_FLOOR),
    }
}

fn fold<T: Copy>(values: &[T], to_f64: impl Fn(T) -> f64, floor: f64) -> SampleStats {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0f64;
    let mut signal = 0u64;
    for &v in values {
        let x = to_f64(v);
        min = min.min(x);
        max = max.max(x);
        sum += x;
        if x.abs() > floor {
            signal += 1;
        }
    }
    let n = values.len() as u64;
    if n == 0 {
        return SampleStats { min: 0.0, max: 0.0, mean: 0.0, nonzero_pct: 0.0, sampled: 0 };
    }
    SampleStats {
        min,
        max,
        mean: sum / n as f64,
        nonzero_pct: 100.0 * signal as f64 / n as f64,
        sampled: n,
    }
}
