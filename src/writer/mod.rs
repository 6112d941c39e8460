//! Streaming Extraction Writer — emits the repaired container.
//!
//! # Layout strategy
//! The header is reserved up front with a zero directory offset.  Planes
//! are appended one at a time: each is re-tiled, each tile compressed and
//! written immediately, and only the per-tile offset/byte-count lists are
//! retained.  `finalize()` then writes every page directory (out-of-line
//! tag payloads first, entries in ascending tag order), chains them, and
//! patches the header — the same reserve-then-patch shape as any
//! append-only container writer.
//!
//! # Large-file trigger
//! Whether the output is classic TIFF or BigTIFF changes the directory
//! structure laid down at the start of the file, so the choice cannot be
//! deferred: the projected total size is computed analytically
//! (pessimistically uncompressed) before the first byte, and the 64-bit
//! variant is selected when it would exceed the 32-bit offset limit.
//!
//! # Failure semantics
//! Extraction is strictly sequential with a single plane resident at a
//! time.  Any read failure on a retained plane is fatal for the whole
//! extraction, and every artifact this extraction created so far is
//! removed — a repaired file must never claim a channel it cannot fully
//! back.

use crate::codec::{get_codec, CodecError};
use crate::format::{
    ContainerHeader, CompressionTag, Endian, PixelType, TAG_BITS_PER_SAMPLE, TAG_COMPRESSION,
    TAG_IMAGE_DESCRIPTION, TAG_IMAGE_LENGTH, TAG_IMAGE_WIDTH, TAG_PHOTOMETRIC,
    TAG_SAMPLES_PER_PIXEL, TAG_SAMPLE_FORMAT, TAG_TILE_BYTE_COUNTS, TAG_TILE_LENGTH,
    TAG_TILE_OFFSETS, TAG_TILE_WIDTH, TYPE_ASCII, TYPE_LONG, TYPE_LONG8, TYPE_SHORT,
};
use crate::reconcile::{ReconciledMetadata, RenumberingMap};
use crate::source::{CorruptPageError, PlaneSource};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Addressability limit of the classic 32-bit container variant.
const CLASSIC_OFFSET_LIMIT: u64 = u32::MAX as u64;

const PHOTOMETRIC_MIN_IS_BLACK: u64 = 1;
const JPEG_QUALITY: u8 = 90;

// ── Configuration ────────────────────────────────────────────────────────────

/// Output compression scheme.  `Deflate` is accepted alongside the
/// documented set because source toolchains routinely produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    Deflate,
    Jpeg,
}

impl Compression {
    pub fn tag(self) -> CompressionTag {
        match self {
            Compression::None => CompressionTag::None,
            Compression::Lzw => CompressionTag::Lzw,
            Compression::Deflate => CompressionTag::Deflate,
            Compression::Jpeg => CompressionTag::Jpeg,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lzw => "lzw",
            Compression::Deflate => "deflate",
            Compression::Jpeg => "jpeg",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compression::None),
            "lzw" => Some(Compression::Lzw),
            "deflate" => Some(Compression::Deflate),
            "jpeg" => Some(Compression::Jpeg),
            _ => None,
        }
    }
}

/// Configuration for [`extract`].
#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// (width, length) of output tiles.
    pub tile_shape: (u32, u32),
    pub compression: Compression,
    /// Additionally write each retained plane as its own single-channel
    /// container, named after the channel.
    pub per_channel_files: bool,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self { tile_shape: (512, 512), compression: Compression::Lzw, per_channel_files: false }
    }
}

/// Where the repaired artifacts go.  Exclusively owned by the single
/// extraction writer for the duration of the call.
#[derive(Debug, Clone)]
pub struct OutputSink {
    pub path: PathBuf,
    /// Directory for per-channel files; defaults to the primary output's
    /// parent directory.
    pub channel_dir: Option<PathBuf>,
}

impl OutputSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_owned(), channel_dir: None }
    }

    fn channel_dir(&self) -> PathBuf {
        self.channel_dir
            .clone()
            .unwrap_or_else(|| self.path.parent().map_or_else(|| PathBuf::from("."), Path::to_owned))
    }
}

/// What an extraction produced.
#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub path: PathBuf,
    pub big_tiff: bool,
    pub planes_written: u32,
    pub per_channel_paths: Vec<PathBuf>,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("cannot create output {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("IO error writing output: {0}")]
    Io(#[from] io::Error),
    /// A plane that diagnosed `Valid` failed to read back.  Diagnosis and
    /// extraction happen at different times; the file may have changed, or
    /// the strided sample may have missed a corrupt region.
    #[error("retained plane unreadable during extraction: {0}")]
    SourceRead(#[from] CorruptPageError),
    #[error("retained plane {page} no longer matches diagnosis (expected {expected:?}, found {actual:?})")]
    PlaneMismatch { page: u32, expected: (u32, u32), actual: (u32, u32) },
    #[error("{compression} output is not supported for {pixel_type:?} planes")]
    UnsupportedCompression { compression: &'static str, pixel_type: PixelType },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ── Partial-output cleanup ───────────────────────────────────────────────────

/// Removes every recorded artifact on drop unless disarmed.  Armed for the
/// whole extraction so a fatal error anywhere leaves nothing behind.
struct PartialOutputs {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl PartialOutputs {
    fn new() -> Self {
        Self { paths: Vec::new(), armed: true }
    }

    fn track(&mut self, path: &Path) {
        self.paths.push(path.to_owned());
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialOutputs {
    fn drop(&mut self) {
        if self.armed {
            for path in &self.paths {
                if fs::remove_file(path).is_ok() {
                    info!("removed partial output {}", path.display());
                }
            }
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Emit the repaired container (and optionally one container per retained
/// channel) from the renumbering map and reconciled metadata.
///
/// Planes are processed in new-index order, exactly one full-resolution
/// plane resident at a time.
pub fn extract<S: PlaneSource>(
    source: &S,
    map: &RenumberingMap,
    metadata: &ReconciledMetadata,
    sink: &OutputSink,
    config: &WriteConfig,
) -> Result<ExtractOutcome, WriteError> {
    if config.compression == Compression::Jpeg && metadata.pixel_type != PixelType::U8 {
        return Err(WriteError::UnsupportedCompression {
            compression: config.compression.name(),
            pixel_type: metadata.pixel_type,
        });
    }

    let plane_shape = (metadata.size_y, metadata.size_x);
    let big_tiff = selects_big_tiff(map.len() as u64, plane_shape, metadata.pixel_type, config);
    debug!(
        "extraction: {} plane(s), tile {}x{}, {} compression, big_tiff={big_tiff}",
        map.len(),
        config.tile_shape.0,
        config.tile_shape.1,
        config.compression.name()
    );

    if config.per_channel_files {
        fs::create_dir_all(sink.channel_dir())?;
    }

    let mut partials = PartialOutputs::new();
    partials.track(&sink.path);
    let file = File::create(&sink.path)
        .map_err(|source| WriteError::Create { path: sink.path.clone(), source })?;
    let mut writer = TiffWriter::new(BufWriter::new(file), big_tiff)?;
    let sidecar_xml = metadata.to_ome_xml();

    let mut per_channel_paths = Vec::new();
    for (new_index, original) in map.iter() {
        let page = source
            .page_info(original)
            .ok_or(CorruptPageError::NoSuchPage(original))
            .map_err(WriteError::SourceRead)?;
        if page.shape != plane_shape {
            return Err(WriteError::PlaneMismatch {
                page: original,
                expected: plane_shape,
                actual: page.shape,
            });
        }

        // The only full-resolution read in the pipeline; the buffer is
        // dropped before the next plane is touched.
        let plane = source.read_full(original)?;
        let raw = plane.to_le_bytes();
        drop(plane);

        let description = (new_index == 0).then_some(sidecar_xml.as_str());
        writer.append_plane(&raw, plane_shape, metadata.pixel_type, description, config)?;

        if config.per_channel_files {
            let channel_meta = metadata
                .single_channel(new_index)
                .expect("renumbering map and metadata agree on channel count");
            let path = per_channel_path(sink, original, &channel_meta.channels[0].name);
            partials.track(&path);
            write_single_plane(&path, &raw, plane_shape, &channel_meta, config)?;
            per_channel_paths.push(path);
        }
    }

    writer.finalize()?;
    partials.disarm();
    info!(
        "wrote {} ({} plane(s), big_tiff={big_tiff})",
        sink.path.display(),
        map.len()
    );

    Ok(ExtractOutcome {
        path: sink.path.clone(),
        big_tiff,
        planes_written: map.len() as u32,
        per_channel_paths,
    })
}

/// One complete single-channel container, used by `per_channel_files`.
/// Gets its own large-file decision from its own projected size.
fn write_single_plane(
    path: &Path,
    raw: &[u8],
    shape: (u32, u32),
    metadata: &ReconciledMetadata,
    config: &WriteConfig,
) -> Result<(), WriteError> {
    let big = selects_big_tiff(1, shape, metadata.pixel_type, config);
    let file = File::create(path)
        .map_err(|source| WriteError::Create { path: path.to_owned(), source })?;
    let mut writer = TiffWriter::new(BufWriter::new(file), big)?;
    let xml = metadata.to_ome_xml();
    writer.append_plane(raw, shape, metadata.pixel_type, Some(&xml), config)?;
    writer.finalize()?;
    Ok(())
}

/// `{stem}_{orig:03}_{sanitized_name}.ome.tif`, keeping the channel's
/// original declared index for traceability to the diagnosis table.
fn per_channel_path(sink: &OutputSink, original: u32, name: &str) -> PathBuf {
    let stem = sink
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repaired".into());
    let stem = stem.strip_suffix(".ome").unwrap_or(&stem).to_owned();
    let file_name = if name.is_empty() {
        format!("{stem}_channel_{original:03}.ome.tif")
    } else {
        format!("{stem}_{original:03}_{}.ome.tif", sanitize_name(name))
    };
    sink.channel_dir().join(file_name)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Whether an extraction with these parameters must use the 64-bit-offset
/// container variant.  Decided before any byte is written — the variant
/// changes the directory structure laid down at the start of the file.
pub fn selects_big_tiff(
    planes: u64,
    shape: (u32, u32),
    pixel_type: PixelType,
    config: &WriteConfig,
) -> bool {
    projected_size(planes, shape, pixel_type, config) > CLASSIC_OFFSET_LIMIT
}

/// Analytic projected output size: plane count × padded plane size × dtype
/// width plus directory overhead, pessimistically uncompressed (none of
/// the supported schemes has a dependable ratio estimate).
fn projected_size(
    planes: u64,
    shape: (u32, u32),
    pixel_type: PixelType,
    config: &WriteConfig,
) -> u64 {
    let (tw, th) = config.tile_shape;
    let (height, width) = shape;
    let tiles = u64::from(width.div_ceil(tw.max(1))) * u64::from(height.div_ceil(th.max(1)));
    let tile_bytes = u64::from(tw) * u64::from(th) * pixel_type.byte_width() as u64;
    // Per-page directory: two offset/count lists plus a dozen fixed entries.
    let directory = tiles * 16 + 512;
    16 + planes * (tiles * tile_bytes + directory)
}

// ── Low-level container writer ───────────────────────────────────────────────

/// One page directory's worth of bookkeeping, kept until `finalize`.
struct PageDraft {
    shape: (u32, u32),
    pixel_type: PixelType,
    tile_shape: (u32, u32),
    compression: Compression,
    tile_offsets: Vec<u64>,
    tile_byte_counts: Vec<u64>,
    description: Option<String>,
}

/// Append-only tiled TIFF/BigTIFF encoder over any seekable sink.
pub struct TiffWriter<W: Write + Seek> {
    writer: W,
    header: ContainerHeader,
    drafts: Vec<PageDraft>,
    finalized: bool,
}

impl<W: Write + Seek> TiffWriter<W> {
    /// Reserve the header (directory offset zero) and position the stream
    /// for the first tile.  `big_tiff` is fixed here and cannot change
    /// afterwards — it determines the directory structure.
    pub fn new(mut writer: W, big_tiff: bool) -> Result<Self, WriteError> {
        let header = ContainerHeader { endian: Endian::Little, big_tiff, first_ifd_offset: 0 };
        writer.seek(SeekFrom::Start(0))?;
        header.write(&mut writer)?;
        Ok(Self { writer, header, drafts: Vec::new(), finalized: false })
    }

    pub fn is_big_tiff(&self) -> bool {
        self.header.big_tiff
    }

    /// Re-tile one plane (`raw` is row-major little-endian sample data),
    /// compress each tile, and append.  Only offset/byte-count lists are
    /// retained; tile buffers live one at a time.
    pub fn append_plane(
        &mut self,
        raw: &[u8],
        shape: (u32, u32),
        pixel_type: PixelType,
        description: Option<&str>,
        config: &WriteConfig,
    ) -> Result<(), WriteError> {
        let (height, width) = shape;
        let (tw, th) = (config.tile_shape.0.max(1), config.tile_shape.1.max(1));
        let bpp = pixel_type.byte_width();
        let row_bytes = width as usize * bpp;
        debug_assert_eq!(raw.len(), height as usize * row_bytes);

        let mut tile_offsets = Vec::new();
        let mut tile_byte_counts = Vec::new();

        for ty in 0..height.div_ceil(th) {
            for tx in 0..width.div_ceil(tw) {
                // Pad edge tiles to the full tile size, zero-filled.
                let mut tile = vec![0u8; tw as usize * th as usize * bpp];
                let x0 = (tx * tw) as usize;
                let y0 = (ty * th) as usize;
                let copy_w = ((width as usize).saturating_sub(x0)).min(tw as usize);
                let copy_h = ((height as usize).saturating_sub(y0)).min(th as usize);
                for r in 0..copy_h {
                    let src = (y0 + r) * row_bytes + x0 * bpp;
                    let dst = r * tw as usize * bpp;
                    tile[dst..dst + copy_w * bpp]
                        .copy_from_slice(&raw[src..src + copy_w * bpp]);
                }

                let payload = encode_tile(&tile, (tw, th), pixel_type, config.compression)?;
                let offset = self.writer.stream_position()?;
                self.writer.write_all(&payload)?;
                tile_offsets.push(offset);
                tile_byte_counts.push(payload.len() as u64);
            }
        }

        self.drafts.push(PageDraft {
            shape,
            pixel_type,
            tile_shape: (tw, th),
            compression: config.compression,
            tile_offsets,
            tile_byte_counts,
            description: description.map(str::to_owned),
        });
        Ok(())
    }

    /// Write every page directory, chain them, and patch the header.
    /// Must be called exactly once.
    pub fn finalize(&mut self) -> Result<(), WriteError> {
        assert!(!self.finalized, "finalize called twice");
        self.finalized = true;

        let endian = self.header.endian;
        let big = self.header.big_tiff;
        let mut prev_next_field: Option<u64> = None;

        let drafts = std::mem::take(&mut self.drafts);
        for draft in &drafts {
            let mut entries = build_entries(draft, big);
            entries.sort_by_key(|e| e.tag);

            // Out-of-line payloads first, so each entry knows its offset.
            let value_field = if big { 8usize } else { 4 };
            for entry in &mut entries {
                if entry.payload.len() > value_field {
                    let offset = self.writer.stream_position()?;
                    self.writer.write_all(&entry.payload)?;
                    if self.writer.stream_position()? % 2 == 1 {
                        self.writer.write_all(&[0])?; // keep offsets word-aligned
                    }
                    entry.out_of_line = Some(offset);
                }
            }

            let ifd_offset = self.writer.stream_position()?;
            if big {
                endian.write_u64(&mut self.writer, entries.len() as u64)?;
            } else {
                endian.write_u16(&mut self.writer, entries.len() as u16)?;
            }
            for entry in &entries {
                entry.write(&mut self.writer, endian, big)?;
            }
            let next_field = self.writer.stream_position()?;
            if big {
                endian.write_u64(&mut self.writer, 0)?;
            } else {
                endian.write_u32(&mut self.writer, 0)?;
            }

            // Chain: patch the previous directory (or the header) to here.
            let end = self.writer.stream_position()?;
            match prev_next_field {
                Some(field) => {
                    self.writer.seek(SeekFrom::Start(field))?;
                    if big {
                        endian.write_u64(&mut self.writer, ifd_offset)?;
                    } else {
                        endian.write_u32(&mut self.writer, ifd_offset as u32)?;
                    }
                }
                None => {
                    self.header.first_ifd_offset = ifd_offset;
                    self.writer.seek(SeekFrom::Start(0))?;
                    self.header.write(&mut self.writer)?;
                }
            }
            self.writer.seek(SeekFrom::Start(end))?;
            prev_next_field = Some(next_field);
        }

        self.writer.flush()?;
        Ok(())
    }
}

fn encode_tile(
    tile: &[u8],
    tile_shape: (u32, u32),
    pixel_type: PixelType,
    compression: Compression,
) -> Result<Vec<u8>, WriteError> {
    match compression {
        Compression::Jpeg => {
            if pixel_type != PixelType::U8 {
                return Err(WriteError::UnsupportedCompression {
                    compression: compression.name(),
                    pixel_type,
                });
            }
            let mut out = Vec::new();
            let encoder = jpeg_encoder::Encoder::new(&mut out, JPEG_QUALITY);
            encoder
                .encode(
                    tile,
                    tile_shape.0 as u16,
                    tile_shape.1 as u16,
                    jpeg_encoder::ColorType::Luma,
                )
                .map_err(|e| CodecError::Compression { scheme: "jpeg", detail: e.to_string() })?;
            Ok(out)
        }
        other => Ok(get_codec(other.tag())?.encode(tile)?),
    }
}

// ── IFD entry assembly ───────────────────────────────────────────────────────

struct DraftEntry {
    tag: u16,
    field_type: u16,
    count: u64,
    /// Little-endian payload bytes (the writer always emits little-endian).
    payload: Vec<u8>,
    out_of_line: Option<u64>,
}

impl DraftEntry {
    fn write<W: Write>(&self, w: &mut W, endian: Endian, big: bool) -> io::Result<()> {
        endian.write_u16(w, self.tag)?;
        endian.write_u16(w, self.field_type)?;
        if big {
            endian.write_u64(w, self.count)?;
        } else {
            endian.write_u32(w, self.count as u32)?;
        }
        let field = if big { 8usize } else { 4 };
        match self.out_of_line {
            Some(offset) => {
                if big {
                    endian.write_u64(w, offset)?;
                } else {
                    endian.write_u32(w, offset as u32)?;
                }
            }
            None => {
                let mut inline = [0u8; 8];
                inline[..self.payload.len()].copy_from_slice(&self.payload);
                w.write_all(&inline[..field])?;
            }
        }
        Ok(())
    }
}

fn build_entries(draft: &PageDraft, big: bool) -> Vec<DraftEntry> {
    let mut entries = Vec::new();
    let shorts = |tag: u16, value: u64| DraftEntry {
        tag,
        field_type: TYPE_SHORT,
        count: 1,
        payload: (value as u16).to_le_bytes().to_vec(),
        out_of_line: None,
    };
    let longs = |tag: u16, value: u64| DraftEntry {
        tag,
        field_type: TYPE_LONG,
        count: 1,
        payload: (value as u32).to_le_bytes().to_vec(),
        out_of_line: None,
    };

    let (height, width) = draft.shape;
    entries.push(longs(TAG_IMAGE_WIDTH, u64::from(width)));
    entries.push(longs(TAG_IMAGE_LENGTH, u64::from(height)));
    entries.push(shorts(TAG_BITS_PER_SAMPLE, u64::from(draft.pixel_type.bits_per_sample())));
    entries.push(shorts(TAG_COMPRESSION, u64::from(draft.compression.tag().as_u16())));
    entries.push(shorts(TAG_PHOTOMETRIC, PHOTOMETRIC_MIN_IS_BLACK));
    entries.push(shorts(TAG_SAMPLES_PER_PIXEL, 1));
    entries.push(shorts(TAG_SAMPLE_FORMAT, u64::from(draft.pixel_type.sample_format())));
    entries.push(longs(TAG_TILE_WIDTH, u64::from(draft.tile_shape.0)));
    entries.push(longs(TAG_TILE_LENGTH, u64::from(draft.tile_shape.1)));

    if let Some(description) = &draft.description {
        let mut payload = description.as_bytes().to_vec();
        payload.push(0);
        entries.push(DraftEntry {
            tag: TAG_IMAGE_DESCRIPTION,
            field_type: TYPE_ASCII,
            count: payload.len() as u64,
            payload,
            out_of_line: None,
        });
    }

    let (offsets_type, offsets_payload) = if big {
        (TYPE_LONG8, encode_u64s(&draft.tile_offsets))
    } else {
        (TYPE_LONG, encode_u32s(&draft.tile_offsets))
    };
    entries.push(DraftEntry {
        tag: TAG_TILE_OFFSETS,
        field_type: offsets_type,
        count: draft.tile_offsets.len() as u64,
        payload: offsets_payload,
        out_of_line: None,
    });
    let (counts_type, counts_payload) = if big {
        (TYPE_LONG8, encode_u64s(&draft.tile_byte_counts))
    } else {
        (TYPE_LONG, encode_u32s(&draft.tile_byte_counts))
    };
    entries.push(DraftEntry {
        tag: TAG_TILE_BYTE_COUNTS,
        field_type: counts_type,
        count: draft.tile_byte_counts.len() as u64,
        payload: counts_payload,
        out_of_line: None,
    });

    entries
}

fn encode_u32s(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|&v| (v as u32).to_le_bytes()).collect()
}

fn encode_u64s(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|&v| v.to_le_bytes()).collect()
}
