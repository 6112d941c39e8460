//! Segment codec registry for the TIFF compression schemes this engine
//! reads and writes.
//!
//! # Identity rules
//! Codecs are identified by the on-disk compression tag (TIFF tag 259,
//! see [`CompressionTag`]).  A reader that encounters a tag with no codec
//! in this registry MUST fail that segment — there is no fallback and no
//! negotiation; decoding with the wrong scheme produces garbage that would
//! then be classified as pixel data.
//!
//! # Coverage
//! | Scheme   | Decode | Encode | Notes |
//! |----------|--------|--------|-------|
//! | None     | yes    | yes    | stored verbatim |
//! | LZW      | yes    | yes    | TIFF-variant LZW (MSB-first, early change) via `weezl` |
//! | Deflate  | yes    | yes    | zlib stream via `flate2`; accepts tag 8 and legacy 32946 |
//! | PackBits | yes    | no     | legacy inputs only; the writer never emits it |
//! | JPEG     | no     | writer-level | per-tile baseline JPEG, handled in `writer` because it needs tile geometry |

use crate::format::CompressionTag;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error ({scheme}): {detail}")]
    Compression { scheme: &'static str, detail: String },
    #[error("decompression error ({scheme}): {detail}")]
    Decompression { scheme: &'static str, detail: String },
    /// Emitted when a segment declares a scheme this registry cannot
    /// decode.  The segment MUST NOT be interpreted further.
    #[error("no codec available for compression tag {tag} ({name})")]
    UnavailableCodec { tag: u16, name: &'static str },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn tag(&self) -> CompressionTag;
    /// Decode one segment.  `expected_len` is the decoded byte count implied
    /// by the segment geometry; codecs use it to size buffers and to reject
    /// short output.
    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;

impl Codec for NoneCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::None
    }

    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        if data.len() < expected_len {
            return Err(CodecError::Decompression {
                scheme: "none",
                detail: format!("segment holds {} bytes, geometry needs {expected_len}", data.len()),
            });
        }
        Ok(data[..expected_len].to_vec())
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

/// TIFF-variant LZW: MSB-first bit order with the early code-size switch.
/// This is the variant `weezl` exposes specifically for TIFF; plain GIF-style
/// LZW decodes to garbage on these segments.
pub struct LzwCodec;

impl Codec for LzwCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::Lzw
    }

    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut decoder = weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
        let mut out = Vec::with_capacity(expected_len);
        decoder
            .into_stream(&mut out)
            .decode_all(data)
            .status
            .map_err(|e| CodecError::Decompression { scheme: "lzw", detail: e.to_string() })?;
        if out.len() < expected_len {
            return Err(CodecError::Decompression {
                scheme: "lzw",
                detail: format!("decoded {} bytes, geometry needs {expected_len}", out.len()),
            });
        }
        out.truncate(expected_len);
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
        let mut out = Vec::new();
        encoder
            .into_stream(&mut out)
            .encode_all(data)
            .status
            .map_err(|e| CodecError::Compression { scheme: "lzw", detail: e.to_string() })?;
        Ok(out)
    }
}

/// Deflate (zlib-wrapped), TIFF tags 8 and 32946.
pub struct DeflateCodec;

impl Codec for DeflateCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::Deflate
    }

    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression { scheme: "deflate", detail: e.to_string() })?;
        if out.len() < expected_len {
            return Err(CodecError::Decompression {
                scheme: "deflate",
                detail: format!("decoded {} bytes, geometry needs {expected_len}", out.len()),
            });
        }
        out.truncate(expected_len);
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| CodecError::Compression { scheme: "deflate", detail: e.to_string() })
    }
}

/// PackBits run-length coding.  Byte-oriented and trivial, so it is decoded
/// inline rather than through a crate; encode is unsupported because this
/// engine never writes it.
pub struct PackBitsCodec;

impl Codec for PackBitsCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::PackBits
    }

    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        let mut i = 0usize;
        while out.len() < expected_len && i < data.len() {
            let n = data[i] as i8;
            i += 1;
            if n >= 0 {
                let count = n as usize + 1;
                if i + count > data.len() {
                    return Err(CodecError::Decompression {
                        scheme: "packbits",
                        detail: "literal run exceeds segment".into(),
                    });
                }
                out.extend_from_slice(&data[i..i + count]);
                i += count;
            } else if n != -128 {
                let count = (-(n as i32)) as usize + 1;
                let Some(&byte) = data.get(i) else {
                    return Err(CodecError::Decompression {
                        scheme: "packbits",
                        detail: "replicate run exceeds segment".into(),
                    });
                };
                i += 1;
                out.extend(std::iter::repeat(byte).take(count));
            }
            // n == -128 is a no-op by specification.
        }
        if out.len() < expected_len {
            return Err(CodecError::Decompression {
                scheme: "packbits",
                detail: format!("decoded {} bytes, geometry needs {expected_len}", out.len()),
            });
        }
        out.truncate(expected_len);
        Ok(out)
    }

    fn encode(&self, _data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::UnavailableCodec { tag: CompressionTag::PackBits.as_u16(), name: "packbits" })
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a compression tag to a built-in codec.
///
/// Returns `Err(CodecError::UnavailableCodec)` for JPEG (decode side) and
/// for tags outside the registry.  The caller MUST NOT fall back to any
/// other codec — fail hard.
pub fn get_codec(tag: CompressionTag) -> Result<Box<dyn Codec>, CodecError> {
    match tag {
        CompressionTag::None => Ok(Box::new(NoneCodec)),
        CompressionTag::Lzw => Ok(Box::new(LzwCodec)),
        CompressionTag::Deflate => Ok(Box::new(DeflateCodec)),
        CompressionTag::PackBits => Ok(Box::new(PackBitsCodec)),
        CompressionTag::Jpeg | CompressionTag::Unknown(_) => {
            Err(CodecError::UnavailableCodec { tag: tag.as_u16(), name: tag.name() })
        }
    }
}
