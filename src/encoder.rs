use rayon::prelude::*;

use crate::config::{ConfigError, EncoderConfig};
use crate::normalizer::{Normalized, Normalizer};

// Code of the lattice origin; never equal to a non-negative unknown code.
const ORIGIN_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStatus {
    Success,
    WrongConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderResult {
    pub status: EncoderStatus,
    pub codes: Vec<i32>,
    /// Input byte offset where each code's span starts.
    pub offsets: Vec<usize>,
}

impl EncoderResult {
    fn wrong_config() -> Self {
        EncoderResult {
            status: EncoderStatus::WrongConfig,
            codes: Vec::new(),
            offsets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub add_bos: bool,
    pub add_eos: bool,
    /// Emit codes end-to-start.
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy)]
struct LatticeElement {
    score: f32,
    code: i32,
    prev_position: usize,
}

/// Segments already-normalized text with a forward Viterbi pass and a
/// backtrace from the end.
///
/// Proposals go in ascending position and, per position, unknown first then
/// ascending match length. A cell only takes a strictly better score, so the
/// earliest proposal wins ties.
pub fn encode_normalized(
    normalized: &Normalized,
    config: &EncoderConfig<'_>,
    options: EncodeOptions,
) -> EncoderResult {
    let text = &normalized.text;
    let n = text.len();
    let pieces = config.pieces();
    let unknown_code = config.unknown_code;

    let mut lattice: Vec<Option<LatticeElement>> = vec![None; n + 1];
    lattice[0] = Some(LatticeElement {
        score: 0.0,
        code: ORIGIN_CODE,
        prev_position: 0,
    });

    for i in 0..n {
        // Matches may only start where the lattice is connected.
        let Some(current) = lattice[i] else {
            continue;
        };

        if unknown_code >= 0 {
            let score = current.score + config.unknown_penalty;
            // Consecutive unknown bytes share one span.
            let prev_position = if current.code == unknown_code {
                current.prev_position
            } else {
                i
            };
            propose(&mut lattice[i + 1], score, unknown_code, prev_position);
        }

        for m in pieces.prefix_matches(&text[i..]) {
            let Some(piece_score) = config.piece_score(m.id) else {
                continue;
            };
            propose(
                &mut lattice[i + m.len],
                current.score + piece_score,
                m.id as i32,
                i,
            );
        }
    }

    let mut codes = Vec::new();
    let mut offsets = Vec::new();
    if options.add_eos {
        codes.push(config.end_code);
        offsets.push(n);
    }
    if lattice[n].is_some() {
        let mut pos = n;
        while pos > 0 {
            let Some(element) = lattice[pos] else {
                break;
            };
            let code = if element.code == unknown_code {
                element.code
            } else {
                element.code.wrapping_add(config.encoding_offset)
            };
            codes.push(code);
            pos = element.prev_position;
            offsets.push(normalized.offsets.get(pos).copied().unwrap_or(pos));
        }
    }
    if options.add_bos {
        codes.push(config.start_code);
        offsets.push(0);
    }
    if !options.reverse {
        codes.reverse();
        offsets.reverse();
    }

    EncoderResult {
        status: EncoderStatus::Success,
        codes,
        offsets,
    }
}

#[inline]
fn propose(cell: &mut Option<LatticeElement>, score: f32, code: i32, prev_position: usize) {
    if cell.map_or(true, |existing| existing.score < score) {
        *cell = Some(LatticeElement {
            score,
            code,
            prev_position,
        });
    }
}

/// Normalizes then segments `text` with the config in `config_blob`.
///
/// A blob with another version tag, or one that cannot be read, yields
/// [`EncoderStatus::WrongConfig`] without touching the input.
pub fn encode_string(text: &[u8], config_blob: &[u8], options: EncodeOptions) -> EncoderResult {
    match EncoderConfig::from_bytes(config_blob) {
        Ok(config) => Encoder::new(config).encode(text, options),
        Err(ConfigError::UnsupportedVersion(version)) => {
            tracing::warn!(version, "encoder config has an unsupported version");
            EncoderResult::wrong_config()
        }
        Err(e) => {
            tracing::warn!(error = %e, "encoder config could not be read");
            EncoderResult::wrong_config()
        }
    }
}

/// A parsed config ready for repeated encoding; shareable across threads.
#[derive(Clone, Copy)]
pub struct Encoder<'a> {
    config: EncoderConfig<'a>,
    normalizer: Normalizer<'a>,
}

impl<'a> Encoder<'a> {
    pub fn new(config: EncoderConfig<'a>) -> Self {
        Encoder {
            normalizer: Normalizer::new(&config),
            config,
        }
    }

    pub fn from_bytes(blob: &'a [u8]) -> Result<Self, ConfigError> {
        EncoderConfig::from_bytes(blob).map(Encoder::new)
    }

    pub fn config(&self) -> &EncoderConfig<'a> {
        &self.config
    }

    pub fn normalize(&self, text: &[u8]) -> Normalized {
        self.normalizer.normalize(text)
    }

    pub fn encode(&self, text: &[u8], options: EncodeOptions) -> EncoderResult {
        let normalized = self.normalizer.normalize(text);
        encode_normalized(&normalized, &self.config, options)
    }

    /// Encodes every input on the rayon pool; results keep input order.
    pub fn encode_batch<T>(&self, texts: &[T], options: EncodeOptions) -> Vec<EncoderResult>
    where
        T: AsRef<[u8]> + Sync,
    {
        texts
            .par_iter()
            .map(|t| self.encode(t.as_ref(), options))
            .collect()
    }
}
