//! TIFF/BigTIFF on-disk primitives: container header, IFD entries, tag and
//! type constants, and the closed pixel-type tag used everywhere else in the
//! crate.
//!
//! # Endianness
//! Unlike most container formats, TIFF declares its byte order in the first
//! two bytes (`II` = little, `MM` = big) and every multi-byte field after
//! that follows the declaration.  All field I/O in this crate goes through
//! [`Endian`] so the choice is made exactly once, at header parse time.
//! No runtime negotiation is ever performed after that.
//!
//! # Offset width
//! Classic TIFF (version 42) uses 32-bit file offsets and is therefore
//! limited to 4 GiB of addressable content.  BigTIFF (version 43) widens
//! offsets and value counts to 64 bits and changes the IFD entry layout
//! from 12 to 20 bytes.  Both variants are handled here; the writer decides
//! between them before the first byte is laid down (see `writer`).

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const BYTE_ORDER_LITTLE: [u8; 2] = *b"II";
pub const BYTE_ORDER_BIG: [u8; 2] = *b"MM";
pub const VERSION_CLASSIC: u16 = 42;
pub const VERSION_BIG: u16 = 43;

// ── Tag ids ──────────────────────────────────────────────────────────────────

pub const TAG_IMAGE_WIDTH: u16 = 256;
pub const TAG_IMAGE_LENGTH: u16 = 257;
pub const TAG_BITS_PER_SAMPLE: u16 = 258;
pub const TAG_COMPRESSION: u16 = 259;
pub const TAG_PHOTOMETRIC: u16 = 262;
pub const TAG_IMAGE_DESCRIPTION: u16 = 270;
pub const TAG_STRIP_OFFSETS: u16 = 273;
pub const TAG_SAMPLES_PER_PIXEL: u16 = 277;
pub const TAG_ROWS_PER_STRIP: u16 = 278;
pub const TAG_STRIP_BYTE_COUNTS: u16 = 279;
pub const TAG_PREDICTOR: u16 = 317;
pub const TAG_TILE_WIDTH: u16 = 322;
pub const TAG_TILE_LENGTH: u16 = 323;
pub const TAG_TILE_OFFSETS: u16 = 324;
pub const TAG_TILE_BYTE_COUNTS: u16 = 325;
pub const TAG_SAMPLE_FORMAT: u16 = 339;

// ── Field types ──────────────────────────────────────────────────────────────

pub const TYPE_BYTE: u16 = 1;
pub const TYPE_ASCII: u16 = 2;
pub const TYPE_SHORT: u16 = 3;
pub const TYPE_LONG: u16 = 4;
pub const TYPE_LONG8: u16 = 16;

/// Byte width of an IFD field type.  Unknown types report width 0 and are
/// skipped by the directory walk rather than rejected.
pub fn field_type_width(field_type: u16) -> usize {
    match field_type {
        1 | 2 | 6 | 7 => 1,          // BYTE, ASCII, SBYTE, UNDEFINED
        3 | 8 => 2,                  // SHORT, SSHORT
        4 | 9 | 11 | 13 => 4,        // LONG, SLONG, FLOAT, IFD
        5 | 10 | 12 | 16 | 17 | 18 => 8, // RATIONAL, SRATIONAL, DOUBLE, LONG8, SLONG8, IFD8
        _ => 0,
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("not a TIFF container: bad byte-order mark {0:02x?}")]
    InvalidByteOrder([u8; 2]),
    #[error("unsupported container version: {0}")]
    UnsupportedVersion(u16),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Endian ───────────────────────────────────────────────────────────────────

/// Declared byte order of the container, fixed at header parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u16<R: Read>(self, r: &mut R) -> io::Result<u16> {
        match self {
            Endian::Little => r.read_u16::<LittleEndian>(),
            Endian::Big => r.read_u16::<BigEndian>(),
        }
    }

    pub fn read_u32<R: Read>(self, r: &mut R) -> io::Result<u32> {
        match self {
            Endian::Little => r.read_u32::<LittleEndian>(),
            Endian::Big => r.read_u32::<BigEndian>(),
        }
    }

    pub fn read_u64<R: Read>(self, r: &mut R) -> io::Result<u64> {
        match self {
            Endian::Little => r.read_u64::<LittleEndian>(),
            Endian::Big => r.read_u64::<BigEndian>(),
        }
    }

    pub fn write_u16<W: Write>(self, w: &mut W, v: u16) -> io::Result<()> {
        match self {
            Endian::Little => w.write_u16::<LittleEndian>(v),
            Endian::Big => w.write_u16::<BigEndian>(v),
        }
    }

    pub fn write_u32<W: Write>(self, w: &mut W, v: u32) -> io::Result<()> {
        match self {
            Endian::Little => w.write_u32::<LittleEndian>(v),
            Endian::Big => w.write_u32::<BigEndian>(v),
        }
    }

    pub fn write_u64<W: Write>(self, w: &mut W, v: u64) -> io::Result<()> {
        match self {
            Endian::Little => w.write_u64::<LittleEndian>(v),
            Endian::Big => w.write_u64::<BigEndian>(v),
        }
    }

    /// Read one IFD-chain offset: 32-bit widened in classic files, native
    /// 64-bit in BigTIFF.
    pub fn read_offset<R: Read>(self, r: &mut R, big: bool) -> io::Result<u64> {
        if big {
            self.read_u64(r)
        } else {
            self.read_u32(r).map(u64::from)
        }
    }
}

// ── Container header ─────────────────────────────────────────────────────────

/// The fixed-size structure at offset 0: byte-order mark, version, and the
/// offset of the first page directory.
#[derive(Debug, Clone)]
pub struct ContainerHeader {
    pub endian: Endian,
    pub big_tiff: bool,
    pub first_ifd_offset: u64,
}

impl ContainerHeader {
    pub fn read<R: Read>(r: &mut R) -> Result<Self, FormatError> {
        let mut mark = [0u8; 2];
        r.read_exact(&mut mark)?;
        let endian = match mark {
            BYTE_ORDER_LITTLE => Endian::Little,
            BYTE_ORDER_BIG => Endian::Big,
            other => return Err(FormatError::InvalidByteOrder(other)),
        };
        let version = endian.read_u16(r)?;
        let big_tiff = match version {
            VERSION_CLASSIC => false,
            VERSION_BIG => true,
            other => return Err(FormatError::UnsupportedVersion(other)),
        };
        let first_ifd_offset = if big_tiff {
            // BigTIFF: offset byte size (always 8) and a reserved zero word
            // precede the directory offset.
            let offset_size = endian.read_u16(r)?;
            let reserved = endian.read_u16(r)?;
            if offset_size != 8 || reserved != 0 {
                return Err(FormatError::UnsupportedVersion(version));
            }
            endian.read_u64(r)?
        } else {
            u64::from(endian.read_u32(r)?)
        };
        Ok(Self { endian, big_tiff, first_ifd_offset })
    }

    /// Write the header with `first_ifd_offset` as currently set.  The writer
    /// reserves the header up front and patches the directory offset on
    /// finalize, so this is called twice per output file.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let e = self.endian;
        w.write_all(match e {
            Endian::Little => &BYTE_ORDER_LITTLE,
            Endian::Big => &BYTE_ORDER_BIG,
        })?;
        if self.big_tiff {
            e.write_u16(w, VERSION_BIG)?;
            e.write_u16(w, 8)?;
            e.write_u16(w, 0)?;
            e.write_u64(w, self.first_ifd_offset)?;
        } else {
            e.write_u16(w, VERSION_CLASSIC)?;
            e.write_u32(w, self.first_ifd_offset as u32)?;
        }
        Ok(())
    }

    /// Byte length of the header: 8 for classic, 16 for BigTIFF.
    pub fn byte_len(&self) -> u64 {
        if self.big_tiff { 16 } else { 8 }
    }
}

// ── IFD entries ──────────────────────────────────────────────────────────────

/// One raw directory entry.  `count` and the value/offset field are widened
/// to 64 bits so classic and BigTIFF entries share a representation.
#[derive(Debug, Clone)]
pub struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u64,
    /// The 4- or 8-byte value/offset field, as read.  Interpreted lazily:
    /// values that fit are inline, larger ones are a file offset.
    pub raw_value: [u8; 8],
    /// Width of the value/offset field in this container (4 or 8).
    pub value_field_len: usize,
}

impl IfdEntry {
    pub fn read<R: Read>(r: &mut R, endian: Endian, big: bool) -> io::Result<Self> {
        let tag = endian.read_u16(r)?;
        let field_type = endian.read_u16(r)?;
        let count = if big {
            endian.read_u64(r)?
        } else {
            u64::from(endian.read_u32(r)?)
        };
        let value_field_len = if big { 8 } else { 4 };
        let mut raw_value = [0u8; 8];
        r.read_exact(&mut raw_value[..value_field_len])?;
        Ok(Self { tag, field_type, count, raw_value, value_field_len })
    }

    fn payload_len(&self) -> Option<usize> {
        let width = field_type_width(self.field_type);
        if width == 0 {
            return None;
        }
        (self.count as usize).checked_mul(width)
    }

    fn value_offset(&self, endian: Endian) -> u64 {
        let mut cur = io::Cursor::new(&self.raw_value[..self.value_field_len]);
        if self.value_field_len == 8 {
            endian.read_u64(&mut cur).unwrap_or(0)
        } else {
            endian.read_u32(&mut cur).map(u64::from).unwrap_or(0)
        }
    }

    /// Fetch the entry's raw payload bytes, following the offset indirection
    /// when the payload does not fit in the value field.
    pub fn payload<R: Read + Seek>(&self, r: &mut R, endian: Endian) -> io::Result<Vec<u8>> {
        let len = self.payload_len().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tag {}: unknown field type {}", self.tag, self.field_type),
            )
        })?;
        if len <= self.value_field_len {
            return Ok(self.raw_value[..len].to_vec());
        }
        let offset = self.value_offset(endian);
        let saved = r.stream_position()?;
        r.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let result = r.read_exact(&mut buf);
        r.seek(SeekFrom::Start(saved))?;
        result?;
        Ok(buf)
    }

    /// Decode the payload as a list of unsigned integers, whatever the
    /// declared storage width.  This covers every tag the reader cares
    /// about except ImageDescription.
    pub fn values_u64<R: Read + Seek>(&self, r: &mut R, endian: Endian) -> io::Result<Vec<u64>> {
        let bytes = self.payload(r, endian)?;
        let width = field_type_width(self.field_type);
        let mut cur = io::Cursor::new(bytes);
        let mut out = Vec::with_capacity(self.count as usize);
        for _ in 0..self.count {
            let v = match width {
                1 => u64::from(cur.read_u8()?),
                2 => u64::from(endian.read_u16(&mut cur)?),
                4 => u64::from(endian.read_u32(&mut cur)?),
                8 => endian.read_u64(&mut cur)?,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("tag {}: non-integer field type {}", self.tag, self.field_type),
                    ))
                }
            };
            out.push(v);
        }
        Ok(out)
    }

    /// Decode the payload as ASCII text, dropping the trailing NUL.
    pub fn value_ascii<R: Read + Seek>(&self, r: &mut R, endian: Endian) -> io::Result<String> {
        let mut bytes = self.payload(r, endian)?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// ── Pixel type ───────────────────────────────────────────────────────────────

/// Closed tag over the numeric element kinds this engine supports.
///
/// Derived from the BitsPerSample × SampleFormat tag pair; combinations
/// outside this set mark the page unreadable rather than guessing from raw
/// byte widths.  Threshold and background-floor computations all dispatch
/// on this tag (see `diagnose`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
}

pub const SAMPLE_FORMAT_UINT: u64 = 1;
pub const SAMPLE_FORMAT_INT: u64 = 2;
pub const SAMPLE_FORMAT_FLOAT: u64 = 3;

impl PixelType {
    pub fn from_tags(bits_per_sample: u64, sample_format: u64) -> Option<Self> {
        match (bits_per_sample, sample_format) {
            (8, SAMPLE_FORMAT_UINT) => Some(PixelType::U8),
            (16, SAMPLE_FORMAT_UINT) => Some(PixelType::U16),
            (32, SAMPLE_FORMAT_UINT) => Some(PixelType::U32),
            (8, SAMPLE_FORMAT_INT) => Some(PixelType::I8),
            (16, SAMPLE_FORMAT_INT) => Some(PixelType::I16),
            (32, SAMPLE_FORMAT_INT) => Some(PixelType::I32),
            (32, SAMPLE_FORMAT_FLOAT) => Some(PixelType::F32),
            _ => None,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        match self {
            PixelType::U8 | PixelType::I8 => 8,
            PixelType::U16 | PixelType::I16 => 16,
            PixelType::U32 | PixelType::I32 | PixelType::F32 => 32,
        }
    }

    pub fn sample_format(self) -> u16 {
        match self {
            PixelType::U8 | PixelType::U16 | PixelType::U32 => SAMPLE_FORMAT_UINT as u16,
            PixelType::I8 | PixelType::I16 | PixelType::I32 => SAMPLE_FORMAT_INT as u16,
            PixelType::F32 => SAMPLE_FORMAT_FLOAT as u16,
        }
    }

    pub fn byte_width(self) -> usize {
        usize::from(self.bits_per_sample()) / 8
    }

    /// OME-XML `Pixels/@Type` spelling.
    pub fn ome_name(self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
            PixelType::U32 => "uint32",
            PixelType::I8 => "int8",
            PixelType::I16 => "int16",
            PixelType::I32 => "int32",
            PixelType::F32 => "float",
        }
    }

    pub fn from_ome_name(s: &str) -> Option<Self> {
        match s {
            "uint8" => Some(PixelType::U8),
            "uint16" => Some(PixelType::U16),
            "uint32" => Some(PixelType::U32),
            "int8" => Some(PixelType::I8),
            "int16" => Some(PixelType::I16),
            "int32" => Some(PixelType::I32),
            "float" => Some(PixelType::F32),
            _ => None,
        }
    }
}

// ── Compression tag ──────────────────────────────────────────────────────────

/// On-disk compression scheme discriminant (TIFF tag 259).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionTag {
    None,
    Lzw,
    Jpeg,
    Deflate,
    PackBits,
    Unknown(u16),
}

impl CompressionTag {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => CompressionTag::None,
            5 => CompressionTag::Lzw,
            7 => CompressionTag::Jpeg,
            // 8 is the registered Deflate value; 32946 is the earlier
            // unregistered one still produced by some writers.
            8 | 32946 => CompressionTag::Deflate,
            32773 => CompressionTag::PackBits,
            other => CompressionTag::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            CompressionTag::None => 1,
            CompressionTag::Lzw => 5,
            CompressionTag::Jpeg => 7,
            CompressionTag::Deflate => 8,
            CompressionTag::PackBits => 32773,
            CompressionTag::Unknown(v) => v,
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            CompressionTag::None => "none",
            CompressionTag::Lzw => "lzw",
            CompressionTag::Jpeg => "jpeg",
            CompressionTag::Deflate => "deflate",
            CompressionTag::PackBits => "packbits",
            CompressionTag::Unknown(_) => "unknown",
        }
    }
}
