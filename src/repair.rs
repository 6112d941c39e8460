//! High-level repair pipeline — the primary embedding surface.
//!
//! ```no_run
//! use tiffmend::repair::{diagnose_file, repair_file};
//! use tiffmend::diagnose::DiagnosticConfig;
//! use tiffmend::writer::{OutputSink, WriteConfig};
//!
//! // Diagnose only
//! let diagnosed = diagnose_file("panel.ome.tiff", &DiagnosticConfig::default())?;
//! println!("{}", diagnosed.report.summary());
//!
//! // Full repair
//! let sink = OutputSink::new("panel_cleaned.ome.tiff");
//! let outcome = repair_file(
//!     "panel.ome.tiff",
//!     &DiagnosticConfig::default(),
//!     &sink,
//!     &WriteConfig::default(),
//! )?;
//! println!("kept {} channel(s)", outcome.extraction.planes_written);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Diagnosis and repair are deliberately decoupled: the validity report is
//! produced whenever the file opens at all, even when reconciliation or
//! extraction subsequently fails — the failing variants of [`RepairError`]
//! carry the report.

use crate::diagnose::{diagnose, DiagnosticConfig, ValidityReport};
use crate::reconcile::{reconcile, NoValidChannelsError, ReconciledMetadata, RenumberingMap};
use crate::sidecar::{parse_sidecar, SidecarSummary};
use crate::source::{FileAccessError, PlaneSource, SourceImage};
use crate::writer::{extract, ExtractOutcome, OutputSink, WriteConfig, WriteError};
use std::path::Path;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum RepairError {
    #[error(transparent)]
    Open(#[from] FileAccessError),
    /// Reconciliation retained nothing.  The diagnosis still happened and
    /// is carried here.
    #[error("{source}")]
    NoValidChannels {
        report: Box<ValidityReport>,
        source: NoValidChannelsError,
    },
    /// Extraction failed after a successful diagnosis; partial outputs
    /// were already cleaned up by the writer.
    #[error("{source}")]
    Write {
        report: Box<ValidityReport>,
        source: WriteError,
    },
}

impl RepairError {
    /// The validity report, when the file opened far enough to produce one.
    pub fn report(&self) -> Option<&ValidityReport> {
        match self {
            RepairError::Open(_) => None,
            RepairError::NoValidChannels { report, .. } | RepairError::Write { report, .. } => {
                Some(report)
            }
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// An opened container with its sidecar parsed and every declared channel
/// diagnosed.  Holds the read-only source handle for a later extraction.
pub struct Diagnosed {
    pub image: SourceImage,
    pub sidecar: SidecarSummary,
    pub report: ValidityReport,
}

/// Open, parse the sidecar, and run the diagnostic pass.
pub fn diagnose_file<P: AsRef<Path>>(
    path: P,
    config: &DiagnosticConfig,
) -> Result<Diagnosed, FileAccessError> {
    let image = SourceImage::open(path)?;
    let sidecar = parse_sidecar(image.sidecar_xml(), image.page_count());
    let mut report = diagnose(&image, &sidecar.channels, config);
    report.warnings = sidecar.warnings.clone();
    Ok(Diagnosed { image, sidecar, report })
}

impl Diagnosed {
    /// Reconcile the report into a renumbering map and fresh metadata tree.
    pub fn reconcile(&self) -> Result<(RenumberingMap, ReconciledMetadata), NoValidChannelsError> {
        let reference = self
            .report
            .valid_indices()
            .next()
            .and_then(|i| self.image.page_info(i));
        reconcile(&self.report, &self.sidecar, reference.as_ref())
    }
}

/// Result of a completed repair.
#[derive(Debug)]
pub struct RepairOutcome {
    pub report: ValidityReport,
    pub extraction: ExtractOutcome,
}

/// Diagnose, reconcile, and extract in one call.
pub fn repair_file<P: AsRef<Path>>(
    path: P,
    diag_config: &DiagnosticConfig,
    sink: &OutputSink,
    write_config: &WriteConfig,
) -> Result<RepairOutcome, RepairError> {
    let diagnosed = diagnose_file(path, diag_config)?;
    let (map, metadata) = match diagnosed.reconcile() {
        Ok(pair) => pair,
        Err(source) => {
            return Err(RepairError::NoValidChannels {
                report: Box::new(diagnosed.report),
                source,
            })
        }
    };
    match extract(&diagnosed.image, &map, &metadata, sink, write_config) {
        Ok(extraction) => Ok(RepairOutcome { report: diagnosed.report, extraction }),
        Err(source) => Err(RepairError::Write { report: Box::new(diagnosed.report), source }),
    }
}
