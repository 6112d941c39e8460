//! Container Reader — opens a TIFF/BigTIFF container and walks its page
//! directory without touching pixel data.
//!
//! # Failure model
//! [`SourceImage::open`] fails only when the top-level header or the first
//! page directory cannot be parsed at all.  Anything wrong with an
//! individual page — a missing required tag, an implausible layout, a
//! truncated directory chain — degrades that page and never aborts
//! enumeration of the others: the page is recorded with whatever could be
//! parsed, and the problem surfaces as a [`CorruptPageError`] from the
//! first read that touches it.
//!
//! # Memory model
//! Pixel access decodes one segment (tile or strip) at a time.
//! [`read_strided`](PlaneSource::read_strided) visits only the segments
//! that intersect the sample lattice, so its resident set is one decoded
//! segment plus an output buffer of `O(shape / stride²)` — independent of
//! source resolution.  A full-plane buffer exists only when a caller
//! explicitly asks for the whole region, which the extraction pass does for
//! exactly one plane at a time.

use crate::codec::{get_codec, CodecError};
use crate::format::{
    ContainerHeader, CompressionTag, Endian, FormatError, IfdEntry, PixelType,
    TAG_BITS_PER_SAMPLE, TAG_COMPRESSION, TAG_IMAGE_DESCRIPTION, TAG_IMAGE_LENGTH,
    TAG_IMAGE_WIDTH, TAG_PREDICTOR, TAG_ROWS_PER_STRIP, TAG_SAMPLES_PER_PIXEL,
    TAG_SAMPLE_FORMAT, TAG_STRIP_BYTE_COUNTS, TAG_STRIP_OFFSETS, TAG_TILE_BYTE_COUNTS,
    TAG_TILE_LENGTH, TAG_TILE_OFFSETS, TAG_TILE_WIDTH,
};
use log::{debug, warn};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Walk guard: no real container carries more page directories than this.
const MAX_PAGES: u32 = 65_536;
/// Walk guard: per-directory entry count sanity limit.
const MAX_IFD_ENTRIES: u64 = 4_096;

const PREDICTOR_NONE: u64 = 1;
const PREDICTOR_HORIZONTAL: u64 = 2;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Fatal open failure: the container itself is unusable.
#[derive(Error, Debug)]
pub enum FileAccessError {
    #[error("cannot open container: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("first page directory unreadable: {0}")]
    BadFirstDirectory(io::Error),
    #[error("container has no page directory")]
    EmptyDirectory,
}

/// Per-page read failure.  Non-fatal during diagnosis (the page classifies
/// `Corrupt`), fatal during extraction.
#[derive(Error, Debug)]
pub enum CorruptPageError {
    #[error("page {0} does not exist")]
    NoSuchPage(u32),
    #[error("page {index}: {reason}")]
    Malformed { index: u32, reason: String },
    #[error("page {index}: segment {segment} truncated ({need} bytes at offset {offset})")]
    TruncatedSegment { index: u32, segment: usize, offset: u64, need: u64 },
    #[error("page {index}: {source}")]
    Codec { index: u32, source: CodecError },
    #[error("page {index}: IO error: {source}")]
    Io { index: u32, source: io::Error },
    #[error("page {index}: requested region exceeds page bounds")]
    RegionOutOfBounds { index: u32 },
}

// ── Page model ───────────────────────────────────────────────────────────────

/// Whether a page's data has been successfully decoded yet.  `Unknown`
/// until the first read attempt; pages whose directory entry was already
/// known-bad at walk time start at `No`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Openable {
    Unknown,
    Yes,
    No,
}

/// One physically stored plane, as described by its page directory.
/// Immutable; `openable` is a snapshot of the reader's lazily determined
/// access state at the time of the `page_info` call.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub index: u32,
    /// (height, width)
    pub shape: (u32, u32),
    pub pixel_type: PixelType,
    /// Offset of the page's first data segment.
    pub byte_offset: u64,
    /// (tile width, tile length); `None` means strip-organized.
    pub tiling: Option<(u32, u32)>,
    pub compression: CompressionTag,
    pub openable: Openable,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    offset: u64,
    byte_count: u64,
}

#[derive(Debug)]
struct PageRecord {
    shape: (u32, u32),
    pixel_type: PixelType,
    tiling: Option<(u32, u32)>,
    compression: CompressionTag,
    predictor: u64,
    rows_per_strip: u32,
    segments: Vec<Segment>,
    /// Set when the directory entry itself was unusable; reads report it.
    defect: Option<String>,
}

// ── Sample buffers ───────────────────────────────────────────────────────────

/// Element-typed pixel storage.  One variant per [`PixelType`] tag; all
/// statistics and re-encoding dispatch on this enum rather than inspecting
/// raw byte widths.
#[derive(Debug, Clone)]
pub enum SampleData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl SampleData {
    pub fn len(&self) -> usize {
        match self {
            SampleData::U8(v) => v.len(),
            SampleData::U16(v) => v.len(),
            SampleData::U32(v) => v.len(),
            SampleData::I8(v) => v.len(),
            SampleData::I16(v) => v.len(),
            SampleData::I32(v) => v.len(),
            SampleData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            SampleData::U8(_) => PixelType::U8,
            SampleData::U16(_) => PixelType::U16,
            SampleData::U32(_) => PixelType::U32,
            SampleData::I8(_) => PixelType::I8,
            SampleData::I16(_) => PixelType::I16,
            SampleData::I32(_) => PixelType::I32,
            SampleData::F32(_) => PixelType::F32,
        }
    }
}

/// A decoded 2-D window of one plane: either a strided sample lattice or a
/// contiguous region, depending on which read produced it.
#[derive(Debug, Clone)]
pub struct PlaneBuf {
    pub height: u32,
    pub width: u32,
    pub data: SampleData,
}

impl PlaneBuf {
    pub fn pixel_type(&self) -> PixelType {
        self.data.pixel_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw little-endian bytes, row-major.  Used by the extraction writer,
    /// which always emits little-endian output.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn pack<S: Sample>(v: &[S]) -> Vec<u8> {
            let mut out = Vec::with_capacity(v.len() * S::WIDTH);
            for s in v {
                s.push_le(&mut out);
            }
            out
        }
        match &self.data {
            SampleData::U8(v) => pack(v),
            SampleData::U16(v) => pack(v),
            SampleData::U32(v) => pack(v),
            SampleData::I8(v) => pack(v),
            SampleData::I16(v) => pack(v),
            SampleData::I32(v) => pack(v),
            SampleData::F32(v) => pack(v),
        }
    }
}

/// Internal element abstraction: fixed width, endian-aware decode, and the
/// wrapping add used to undo horizontal-differencing prediction.
pub(crate) trait Sample: Copy + Default + Send + 'static {
    const WIDTH: usize;
    fn from_bytes(endian: Endian, bytes: &[u8]) -> Self;
    fn delta_add(self, prev: Self) -> Self;
    fn push_le(&self, out: &mut Vec<u8>);
    fn wrap(v: Vec<Self>) -> SampleData;
}

macro_rules! impl_sample_int {
    ($ty:ty, $width:expr, $variant:ident) => {
        impl Sample for $ty {
            const WIDTH: usize = $width;
            fn from_bytes(endian: Endian, bytes: &[u8]) -> Self {
                let mut raw = [0u8; $width];
                raw.copy_from_slice(&bytes[..$width]);
                match endian {
                    Endian::Little => <$ty>::from_le_bytes(raw),
                    Endian::Big => <$ty>::from_be_bytes(raw),
                }
            }
            fn delta_add(self, prev: Self) -> Self {
                self.wrapping_add(prev)
            }
            fn push_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn wrap(v: Vec<Self>) -> SampleData {
                SampleData::$variant(v)
            }
        }
    };
}

impl_sample_int!(u8, 1, U8);
impl_sample_int!(u16, 2, U16);
impl_sample_int!(u32, 4, U32);
impl_sample_int!(i8, 1, I8);
impl_sample_int!(i16, 2, I16);
impl_sample_int!(i32, 4, I32);

impl Sample for f32 {
    const WIDTH: usize = 4;
    fn from_bytes(endian: Endian, bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        match endian {
            Endian::Little => f32::from_le_bytes(raw),
            Endian::Big => f32::from_be_bytes(raw),
        }
    }
    // Horizontal differencing is undefined for floats; pages declaring it
    // are rejected before this is ever reached.
    fn delta_add(self, _prev: Self) -> Self {
        self
    }
    fn push_le(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn wrap(v: Vec<Self>) -> SampleData {
        SampleData::F32(v)
    }
}

// ── PlaneSource seam ─────────────────────────────────────────────────────────

/// Read access to a multi-plane source.  This is the seam between the
/// container reader and the diagnostic/extraction stages, so that both can
/// be exercised against synthetic sources in tests.
pub trait PlaneSource: Sync {
    fn page_count(&self) -> u32;
    fn page_info(&self, index: u32) -> Option<SourcePage>;
    /// Read every `stride`-th row and column of a plane.  Memory is
    /// `O(shape / stride²)` regardless of source resolution.
    fn read_strided(&self, index: u32, stride: u32) -> Result<PlaneBuf, CorruptPageError>;
    /// Read a contiguous region at full resolution.
    fn read_region(
        &self,
        index: u32,
        origin: (u32, u32),
        size: (u32, u32),
    ) -> Result<PlaneBuf, CorruptPageError>;

    /// Full-resolution read of one whole plane.  Only the extraction pass
    /// calls this, one plane at a time.
    fn read_full(&self, index: u32) -> Result<PlaneBuf, CorruptPageError> {
        let page = self.page_info(index).ok_or(CorruptPageError::NoSuchPage(index))?;
        self.read_region(index, (0, 0), page.shape)
    }
}

// ── SourceImage ──────────────────────────────────────────────────────────────

pub struct SourceImage {
    path: PathBuf,
    header: ContainerHeader,
    pages: Vec<PageRecord>,
    /// Lazily determined per-page access state: 0 unknown, 1 yes, 2 no.
    openable: Vec<AtomicU8>,
    raw_sidecar: Option<String>,
}

impl SourceImage {
    /// Open a container and walk its page directory.
    ///
    /// Fatal only when the header or the first directory is unreadable;
    /// later directories that fail to parse end the walk with a warning,
    /// which is exactly the truncated-export shape the diagnostic engine
    /// then reports as missing trailing channels.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FileAccessError> {
        let path = path.as_ref().to_owned();
        let mut reader = BufReader::new(File::open(&path)?);
        let header = ContainerHeader::read(&mut reader)?;
        if header.first_ifd_offset == 0 {
            return Err(FileAccessError::EmptyDirectory);
        }

        let mut pages = Vec::new();
        let mut raw_sidecar = None;
        let mut visited = HashSet::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && (pages.len() as u32) < MAX_PAGES {
            if !visited.insert(offset) {
                warn!("page directory chain loops back to offset {offset}; stopping walk");
                break;
            }
            let index = pages.len() as u32;
            match parse_ifd(&mut reader, &header, offset, index, &mut raw_sidecar) {
                Ok((record, next)) => {
                    if let Some(reason) = &record.defect {
                        debug!("page {index} recorded with defect: {reason}");
                    }
                    pages.push(record);
                    offset = next;
                }
                Err(e) if index == 0 => return Err(FileAccessError::BadFirstDirectory(e)),
                Err(e) => {
                    warn!("page directory {index} unreadable ({e}); stopping walk at {} pages", pages.len());
                    break;
                }
            }
        }
        if pages.is_empty() {
            return Err(FileAccessError::EmptyDirectory);
        }

        let openable = pages
            .iter()
            .map(|p| AtomicU8::new(if p.defect.is_some() { 2 } else { 0 }))
            .collect();
        debug!("opened {} with {} page(s), big_tiff={}", path.display(), pages.len(), header.big_tiff);
        Ok(Self { path, header, pages, openable, raw_sidecar })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_big_tiff(&self) -> bool {
        self.header.big_tiff
    }

    pub fn endian(&self) -> Endian {
        self.header.endian
    }

    /// The embedded metadata sidecar (first page's ImageDescription), if any.
    pub fn sidecar_xml(&self) -> Option<&str> {
        self.raw_sidecar.as_deref()
    }

    fn record(&self, index: u32) -> Result<&PageRecord, CorruptPageError> {
        self.pages.get(index as usize).ok_or(CorruptPageError::NoSuchPage(index))
    }

    fn mark(&self, index: u32, ok: bool) {
        if let Some(cell) = self.openable.get(index as usize) {
            cell.store(if ok { 1 } else { 2 }, Ordering::Relaxed);
        }
    }

    fn openable_state(&self, index: u32) -> Openable {
        match self.openable.get(index as usize).map(|c| c.load(Ordering::Relaxed)) {
            Some(1) => Openable::Yes,
            Some(2) => Openable::No,
            _ => Openable::Unknown,
        }
    }

    /// Shared read path for both strided and region access: gather the
    /// lattice `origin + k·stride` within `size`, decoding only the
    /// segments that contain lattice points.
    fn read_window(
        &self,
        index: u32,
        origin: (u32, u32),
        size: (u32, u32),
        stride: u32,
    ) -> Result<PlaneBuf, CorruptPageError> {
        let result = self.read_window_inner(index, origin, size, stride.max(1));
        self.mark(index, result.is_ok());
        result
    }

    fn read_window_inner(
        &self,
        index: u32,
        origin: (u32, u32),
        size: (u32, u32),
        stride: u32,
    ) -> Result<PlaneBuf, CorruptPageError> {
        let record = self.record(index)?;
        if let Some(reason) = &record.defect {
            return Err(CorruptPageError::Malformed { index, reason: reason.clone() });
        }
        let (height, width) = record.shape;
        if origin.0.checked_add(size.0).map_or(true, |end| end > height)
            || origin.1.checked_add(size.1).map_or(true, |end| end > width)
            || size.0 == 0
            || size.1 == 0
        {
            return Err(CorruptPageError::RegionOutOfBounds { index });
        }

        let mut reader = BufReader::new(
            File::open(&self.path).map_err(|source| CorruptPageError::Io { index, source })?,
        );

        match record.pixel_type {
            PixelType::U8 => self.gather::<u8>(&mut reader, record, index, origin, size, stride),
            PixelType::U16 => self.gather::<u16>(&mut reader, record, index, origin, size, stride),
            PixelType::U32 => self.gather::<u32>(&mut reader, record, index, origin, size, stride),
            PixelType::I8 => self.gather::<i8>(&mut reader, record, index, origin, size, stride),
            PixelType::I16 => self.gather::<i16>(&mut reader, record, index, origin, size, stride),
            PixelType::I32 => self.gather::<i32>(&mut reader, record, index, origin, size, stride),
            PixelType::F32 => self.gather::<f32>(&mut reader, record, index, origin, size, stride),
        }
    }

    fn gather<S: Sample>(
        &self,
        reader: &mut BufReader<File>,
        record: &PageRecord,
        index: u32,
        origin: (u32, u32),
        size: (u32, u32),
        stride: u32,
    ) -> Result<PlaneBuf, CorruptPageError> {
        if record.predictor == PREDICTOR_HORIZONTAL && record.pixel_type == PixelType::F32 {
            return Err(CorruptPageError::Malformed {
                index,
                reason: "horizontal predictor on float samples".into(),
            });
        }
        if record.predictor != PREDICTOR_NONE && record.predictor != PREDICTOR_HORIZONTAL {
            return Err(CorruptPageError::Malformed {
                index,
                reason: format!("unsupported predictor {}", record.predictor),
            });
        }

        let out_h = size.0.div_ceil(stride) as usize;
        let out_w = size.1.div_ceil(stride) as usize;
        let mut out = vec![S::default(); out_h * out_w];

        let codec = get_codec(record.compression)
            .map_err(|source| CorruptPageError::Codec { index, source })?;

        for (seg_idx, span) in segment_spans(record).enumerate() {
            // Lattice rows k with origin.0 + k·stride inside [span.y0, span.y1).
            let k0 = lattice_start(origin.0, stride, span.y0);
            let j0 = lattice_start(origin.1, stride, span.x0);
            let row_end = span.y1.min(origin.0 + size.0);
            let col_end = span.x1.min(origin.1 + size.1);
            if k0 >= out_h || j0 >= out_w {
                continue;
            }
            if origin.0 + (k0 as u32) * stride >= row_end || origin.1 + (j0 as u32) * stride >= col_end {
                continue;
            }

            let segment = record.segments.get(seg_idx).copied().ok_or(
                CorruptPageError::Malformed {
                    index,
                    reason: format!("segment {seg_idx} has no directory entry"),
                },
            )?;
            let decoded = decode_segment::<S>(
                reader,
                self.header.endian,
                codec.as_ref(),
                record.predictor,
                segment,
                span.pitch as usize,
                span.rows as usize,
                index,
                seg_idx,
            )?;

            let mut k = k0;
            while k < out_h {
                let row = origin.0 + (k as u32) * stride;
                if row >= row_end {
                    break;
                }
                let seg_row = (row - span.y0) as usize;
                let mut j = j0;
                while j < out_w {
                    let col = origin.1 + (j as u32) * stride;
                    if col >= col_end {
                        break;
                    }
                    let seg_col = (col - span.x0) as usize;
                    out[k * out_w + j] = decoded[seg_row * span.pitch as usize + seg_col];
                    j += 1;
                }
                k += 1;
            }
        }

        Ok(PlaneBuf { height: out_h as u32, width: out_w as u32, data: S::wrap(out) })
    }
}

impl PlaneSource for SourceImage {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_info(&self, index: u32) -> Option<SourcePage> {
        let record = self.pages.get(index as usize)?;
        Some(SourcePage {
            index,
            shape: record.shape,
            pixel_type: record.pixel_type,
            byte_offset: record.segments.first().map_or(0, |s| s.offset),
            tiling: record.tiling,
            compression: record.compression,
            openable: self.openable_state(index),
        })
    }

    fn read_strided(&self, index: u32, stride: u32) -> Result<PlaneBuf, CorruptPageError> {
        let record = self.record(index)?;
        let shape = record.shape;
        self.read_window(index, (0, 0), shape, stride)
    }

    fn read_region(
        &self,
        index: u32,
        origin: (u32, u32),
        size: (u32, u32),
    ) -> Result<PlaneBuf, CorruptPageError> {
        self.read_window(index, origin, size, 1)
    }
}

// ── Segment geometry ─────────────────────────────────────────────────────────

/// One tile's or strip's place in the plane.  `pitch`/`rows` describe the
/// decoded buffer (tiles are padded to full tile size at the image edge;
/// strips are not).
#[derive(Debug, Clone, Copy)]
struct SegmentSpan {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    pitch: u32,
    rows: u32,
}

fn segment_spans(record: &PageRecord) -> Box<dyn Iterator<Item = SegmentSpan> + '_> {
    let (height, width) = record.shape;
    match record.tiling {
        Some((tw, th)) => {
            let across = width.div_ceil(tw);
            let down = height.div_ceil(th);
            Box::new((0..down).flat_map(move |ty| {
                (0..across).map(move |tx| {
                    let x0 = tx * tw;
                    let y0 = ty * th;
                    SegmentSpan {
                        x0,
                        y0,
                        x1: (x0 + tw).min(width),
                        y1: (y0 + th).min(height),
                        pitch: tw,
                        rows: th,
                    }
                })
            }))
        }
        None => {
            let rps = record.rows_per_strip.max(1);
            let strips = height.div_ceil(rps);
            Box::new((0..strips).map(move |s| {
                let y0 = s * rps;
                let y1 = (y0 + rps).min(height);
                SegmentSpan { x0: 0, y0, x1: width, y1, pitch: width, rows: y1 - y0 }
            }))
        }
    }
}

/// First lattice index `k` with `origin + k·stride >= bound`.
fn lattice_start(origin: u32, stride: u32, bound: u32) -> usize {
    if bound <= origin {
        0
    } else {
        ((bound - origin).div_ceil(stride)) as usize
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_segment<S: Sample>(
    reader: &mut BufReader<File>,
    endian: Endian,
    codec: &dyn crate::codec::Codec,
    predictor: u64,
    segment: Segment,
    pitch: usize,
    rows: usize,
    index: u32,
    seg_idx: usize,
) -> Result<Vec<S>, CorruptPageError> {
    // Corrupt directories can declare absurd counts; cap before allocating.
    if segment.byte_count > (1 << 31) {
        return Err(CorruptPageError::Malformed {
            index,
            reason: format!("segment {seg_idx} declares {} bytes", segment.byte_count),
        });
    }
    reader
        .seek(SeekFrom::Start(segment.offset))
        .map_err(|source| CorruptPageError::Io { index, source })?;
    let mut raw = vec![0u8; segment.byte_count as usize];
    reader.read_exact(&mut raw).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CorruptPageError::TruncatedSegment {
                index,
                segment: seg_idx,
                offset: segment.offset,
                need: segment.byte_count,
            }
        } else {
            CorruptPageError::Io { index, source: e }
        }
    })?;

    let expected = pitch * rows * S::WIDTH;
    let bytes = codec
        .decode(&raw, expected)
        .map_err(|source| CorruptPageError::Codec { index, source })?;

    let mut samples = Vec::with_capacity(pitch * rows);
    for chunk in bytes.chunks_exact(S::WIDTH) {
        samples.push(S::from_bytes(endian, chunk));
    }

    if predictor == PREDICTOR_HORIZONTAL {
        for row in samples.chunks_exact_mut(pitch) {
            for i in 1..row.len() {
                row[i] = row[i].delta_add(row[i - 1]);
            }
        }
    }
    Ok(samples)
}

// ── Directory parsing ────────────────────────────────────────────────────────

/// Parse one page directory.  Structural failures (seek, entry count)
/// propagate as `io::Error` and end the walk; tag-level problems are folded
/// into the record's `defect` so the walk continues.
fn parse_ifd<R: Read + Seek>(
    r: &mut R,
    header: &ContainerHeader,
    offset: u64,
    index: u32,
    raw_sidecar: &mut Option<String>,
) -> io::Result<(PageRecord, u64)> {
    let endian = header.endian;
    let big = header.big_tiff;
    r.seek(SeekFrom::Start(offset))?;
    let entry_count = if big {
        endian.read_u64(r)?
    } else {
        u64::from(endian.read_u16(r)?)
    };
    if entry_count == 0 || entry_count > MAX_IFD_ENTRIES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("implausible directory entry count {entry_count}"),
        ));
    }

    let mut width = None;
    let mut height = None;
    let mut bits = None;
    let mut sample_format = 1u64;
    let mut samples_per_pixel = 1u64;
    let mut compression = CompressionTag::None;
    let mut predictor = PREDICTOR_NONE;
    let mut rows_per_strip = None;
    let mut tile_width = None;
    let mut tile_length = None;
    let mut strip_offsets = None;
    let mut strip_counts = None;
    let mut tile_offsets = None;
    let mut tile_counts = None;
    let mut defect: Option<String> = None;

    for _ in 0..entry_count {
        let entry = IfdEntry::read(r, endian, big)?;
        let tag = entry.tag;
        let wanted = matches!(
            tag,
            TAG_IMAGE_WIDTH
                | TAG_IMAGE_LENGTH
                | TAG_BITS_PER_SAMPLE
                | TAG_COMPRESSION
                | TAG_SAMPLES_PER_PIXEL
                | TAG_ROWS_PER_STRIP
                | TAG_PREDICTOR
                | TAG_SAMPLE_FORMAT
                | TAG_STRIP_OFFSETS
                | TAG_STRIP_BYTE_COUNTS
                | TAG_TILE_WIDTH
                | TAG_TILE_LENGTH
                | TAG_TILE_OFFSETS
                | TAG_TILE_BYTE_COUNTS
        );
        if tag == TAG_IMAGE_DESCRIPTION && index == 0 && raw_sidecar.is_none() {
            match entry.value_ascii(r, endian) {
                Ok(text) if !text.is_empty() => *raw_sidecar = Some(text),
                Ok(_) => {}
                Err(e) => debug!("page 0: unreadable ImageDescription: {e}"),
            }
            continue;
        }
        if !wanted {
            continue;
        }
        let values = match entry.values_u64(r, endian) {
            Ok(v) => v,
            Err(e) => {
                defect.get_or_insert_with(|| format!("tag {tag}: {e}"));
                continue;
            }
        };
        let first = values.first().copied();
        match tag {
            TAG_IMAGE_WIDTH => width = first,
            TAG_IMAGE_LENGTH => height = first,
            TAG_BITS_PER_SAMPLE => {
                if values.windows(2).any(|w| w[0] != w[1]) {
                    defect.get_or_insert_with(|| "heterogeneous bits-per-sample".into());
                }
                bits = first;
            }
            TAG_COMPRESSION => {
                compression = CompressionTag::from_u16(first.unwrap_or(1) as u16);
            }
            TAG_SAMPLES_PER_PIXEL => samples_per_pixel = first.unwrap_or(1),
            TAG_ROWS_PER_STRIP => rows_per_strip = first,
            TAG_PREDICTOR => predictor = first.unwrap_or(PREDICTOR_NONE),
            TAG_SAMPLE_FORMAT => sample_format = first.unwrap_or(1),
            TAG_STRIP_OFFSETS => strip_offsets = Some(values),
            TAG_STRIP_BYTE_COUNTS => strip_counts = Some(values),
            TAG_TILE_WIDTH => tile_width = first,
            TAG_TILE_LENGTH => tile_length = first,
            TAG_TILE_OFFSETS => tile_offsets = Some(values),
            TAG_TILE_BYTE_COUNTS => tile_counts = Some(values),
            _ => {}
        }
    }
    let next_offset = endian.read_offset(r, big)?;

    // Assemble the record, folding anything unusable into `defect`.
    let shape = match (height, width) {
        (Some(h), Some(w)) if h > 0 && w > 0 && h <= u64::from(u32::MAX) && w <= u64::from(u32::MAX) => {
            (h as u32, w as u32)
        }
        _ => {
            defect.get_or_insert_with(|| "missing or implausible image dimensions".into());
            (0, 0)
        }
    };
    if samples_per_pixel != 1 {
        defect.get_or_insert_with(|| {
            format!("{samples_per_pixel} samples per pixel (planes must be single-sample)")
        });
    }
    let pixel_type = match PixelType::from_tags(bits.unwrap_or(1), sample_format) {
        Some(pt) => pt,
        None => {
            defect.get_or_insert_with(|| {
                format!(
                    "unsupported element kind ({} bits, sample format {})",
                    bits.unwrap_or(1),
                    sample_format
                )
            });
            PixelType::U8
        }
    };

    let (tiling, segments) = match (tile_offsets, tile_counts, tile_width, tile_length) {
        (Some(offsets), Some(counts), Some(tw), Some(th)) if tw > 0 && th > 0 => {
            let segs = zip_segments(&offsets, &counts, &mut defect);
            (Some((tw as u32, th as u32)), segs)
        }
        (Some(_), _, _, _) => {
            defect.get_or_insert_with(|| "tiled page missing tile geometry".into());
            (None, Vec::new())
        }
        _ => match (strip_offsets, strip_counts) {
            (Some(offsets), Some(counts)) => (None, zip_segments(&offsets, &counts, &mut defect)),
            _ => {
                defect.get_or_insert_with(|| "page has no data segments".into());
                (None, Vec::new())
            }
        },
    };
    let rows_per_strip = rows_per_strip
        .unwrap_or(u64::from(shape.0))
        .min(u64::from(u32::MAX)) as u32;

    Ok((
        PageRecord {
            shape,
            pixel_type,
            tiling,
            compression,
            predictor,
            rows_per_strip,
            segments,
            defect,
        },
        next_offset,
    ))
}

fn zip_segments(offsets: &[u64], counts: &[u64], defect: &mut Option<String>) -> Vec<Segment> {
    if offsets.len() != counts.len() {
        defect.get_or_insert_with(|| "segment offset/count lists disagree".into());
    }
    offsets
        .iter()
        .zip(counts.iter())
        .map(|(&offset, &byte_count)| Segment { offset, byte_count })
        .collect()
}
