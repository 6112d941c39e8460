pub mod format;
pub mod codec;
pub mod source;
pub mod sidecar;
pub mod diagnose;
pub mod reconcile;
pub mod writer;
pub mod repair;

pub use diagnose::{diagnose, ChannelStatus, DiagnosticConfig, ValidityReport};
pub use format::{CompressionTag, PixelType};
pub use reconcile::{reconcile, ReconciledMetadata, RenumberingMap};
pub use sidecar::{parse_sidecar, DeclaredChannel, MetadataWarning, SidecarSummary};
pub use source::{PlaneSource, SourceImage, SourcePage};
pub use writer::{extract, Compression, OutputSink, WriteConfig};
