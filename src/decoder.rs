//! Turns emitted codes back into text.
//!
//! The decoder blob stores one surface string per piece id:
//!
//! ```text
//! u32 version | u32 flags | i32 encoding_offset | i32 unknown_code
//! u32 n, (n + 1) x u32 end offsets into the pool, then the string pool
//! ```
use thiserror::Error;

use crate::config::SENTENCE_PIECE_VERSION;
use crate::frozen::{self, FrozenReader, FrozenWriter};
use crate::normalizer::SPACE_SYMBOL;

const FLAG_STRIP_DUMMY_PREFIX: u32 = 1;
const FLAG_UNESCAPE_WHITESPACES: u32 = 1 << 1;

/// Surface text of the unknown piece.
pub const UNKNOWN_SURFACE: &str = " \u{2047} ";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecoderConfigError {
    #[error("unsupported decoder version {0}")]
    UnsupportedVersion(u32),
    #[error("decoder blob truncated while reading {0}")]
    Truncated(&'static str),
    #[error("piece offsets are not monotonic")]
    BadOffsets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStatus {
    Success,
    WrongConfig,
    InvalidInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderResult {
    pub status: DecoderStatus,
    pub text: String,
}

#[derive(Clone, Copy)]
pub struct Decoder<'a> {
    encoding_offset: i32,
    unknown_code: i32,
    strip_dummy_prefix: bool,
    unescape_whitespaces: bool,
    count: usize,
    ends: &'a [u8],
    pool: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn from_bytes(blob: &'a [u8]) -> Result<Self, DecoderConfigError> {
        let mut r = FrozenReader::new(blob);
        let version = r.u32().ok_or(DecoderConfigError::Truncated("version"))?;
        if version != SENTENCE_PIECE_VERSION {
            return Err(DecoderConfigError::UnsupportedVersion(version));
        }
        let flags = r.u32().ok_or(DecoderConfigError::Truncated("flags"))?;
        let encoding_offset = r
            .i32()
            .ok_or(DecoderConfigError::Truncated("encoding_offset"))?;
        let unknown_code = r.i32().ok_or(DecoderConfigError::Truncated("unknown_code"))?;
        let count = r.u32().ok_or(DecoderConfigError::Truncated("pieces"))? as usize;
        let ends = count
            .checked_add(1)
            .and_then(|n| n.checked_mul(4))
            .and_then(|len| r.bytes(len))
            .ok_or(DecoderConfigError::Truncated("piece offsets"))?;
        let pool_len = frozen::read_u32(ends, count * 4).ok_or(DecoderConfigError::BadOffsets)?;
        let pool = r
            .bytes(pool_len as usize)
            .ok_or(DecoderConfigError::Truncated("piece pool"))?;

        let decoder = Decoder {
            encoding_offset,
            unknown_code,
            strip_dummy_prefix: flags & FLAG_STRIP_DUMMY_PREFIX != 0,
            unescape_whitespaces: flags & FLAG_UNESCAPE_WHITESPACES != 0,
            count,
            ends,
            pool,
        };
        let monotonic = (0..count).all(|i| {
            matches!((decoder.end(i), decoder.end(i + 1)), (Some(a), Some(b)) if a <= b)
        });
        if !monotonic {
            return Err(DecoderConfigError::BadOffsets);
        }
        Ok(decoder)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn end(&self, i: usize) -> Option<usize> {
        frozen::read_u32(self.ends, i * 4).map(|v| v as usize)
    }

    /// Surface bytes of piece `id` (before whitespace unescaping).
    pub fn piece(&self, id: usize) -> Option<&'a [u8]> {
        if id >= self.count {
            return None;
        }
        self.pool.get(self.end(id)?..self.end(id + 1)?)
    }

    pub fn decode(&self, codes: &[i32]) -> DecoderResult {
        let mut bytes = Vec::new();
        for &code in codes {
            if code == self.unknown_code && code >= 0 {
                bytes.extend_from_slice(UNKNOWN_SURFACE.as_bytes());
                continue;
            }
            let piece = usize::try_from(code.wrapping_sub(self.encoding_offset))
                .ok()
                .and_then(|id| self.piece(id));
            match piece {
                Some(p) => bytes.extend_from_slice(p),
                None => {
                    return DecoderResult {
                        status: DecoderStatus::InvalidInput,
                        text: String::new(),
                    }
                }
            }
        }

        if self.unescape_whitespaces {
            bytes = replace_all(&bytes, SPACE_SYMBOL, b" ");
        }
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if self.strip_dummy_prefix && text.starts_with(' ') {
            text.remove(0);
        }
        DecoderResult {
            status: DecoderStatus::Success,
            text,
        }
    }
}

fn replace_all(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(with);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Decodes `codes` with the decoder config in `config_blob`.
pub fn decode_string(codes: &[i32], config_blob: &[u8]) -> DecoderResult {
    match Decoder::from_bytes(config_blob) {
        Ok(decoder) => decoder.decode(codes),
        Err(e) => {
            tracing::warn!(error = %e, "decoder config rejected");
            DecoderResult {
                status: DecoderStatus::WrongConfig,
                text: String::new(),
            }
        }
    }
}

/// Assembles a decoder blob; piece ids follow insertion order.
#[derive(Debug, Clone, Default)]
pub struct DecoderConfigBuilder {
    pieces: Vec<Vec<u8>>,
    encoding_offset: i32,
    unknown_code: Option<i32>,
    strip_dummy_prefix: bool,
    unescape_whitespaces: bool,
}

impl DecoderConfigBuilder {
    pub fn new() -> Self {
        DecoderConfigBuilder::default()
    }

    pub fn piece(&mut self, surface: impl AsRef<[u8]>) -> i32 {
        self.pieces.push(surface.as_ref().to_vec());
        self.pieces.len() as i32 - 1
    }

    pub fn encoding_offset(&mut self, offset: i32) -> &mut Self {
        self.encoding_offset = offset;
        self
    }

    pub fn unknown_code(&mut self, code: i32) -> &mut Self {
        self.unknown_code = Some(code);
        self
    }

    pub fn strip_dummy_prefix(&mut self, on: bool) -> &mut Self {
        self.strip_dummy_prefix = on;
        self
    }

    pub fn unescape_whitespaces(&mut self, on: bool) -> &mut Self {
        self.unescape_whitespaces = on;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.strip_dummy_prefix {
            flags |= FLAG_STRIP_DUMMY_PREFIX;
        }
        if self.unescape_whitespaces {
            flags |= FLAG_UNESCAPE_WHITESPACES;
        }

        let mut ends = Vec::with_capacity(self.pieces.len() + 1);
        let mut pool = Vec::new();
        ends.push(0u32);
        for p in &self.pieces {
            pool.extend_from_slice(p);
            ends.push(pool.len() as u32);
        }

        let mut w = FrozenWriter::new();
        w.u32(SENTENCE_PIECE_VERSION)
            .u32(flags)
            .i32(self.encoding_offset)
            .i32(self.unknown_code.unwrap_or(-1))
            .u32(self.pieces.len() as u32);
        for &end in &ends {
            w.u32(end);
        }
        let mut blob = w.finish();
        blob.extend_from_slice(&pool);
        blob
    }
}
