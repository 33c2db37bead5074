//! Frozen encoder configuration.
//!
//! [`EncoderConfig`] is a zero-copy view over a blob produced by
//! [`EncoderConfigBuilder`] (or by the model converter). Layout, all
//! little-endian:
//!
//! ```text
//! u32 version | u32 flags | i32 start | i32 end | i32 unknown
//! f32 unknown_penalty | i32 encoding_offset
//! u32 n, n x u32   piece trie units
//! u32 n, n x f32   piece scores, indexed by piece id
//! u32 n, n x u32   normalization trie units
//! u32 n, n x u8    NUL-terminated replacement strings
//! ```
use thiserror::Error;

use crate::builder::{BuildError, DoubleArrayBuilder};
use crate::frozen::{self, FrozenReader, FrozenWriter};
use crate::trie::TrieMatcher;

pub const SENTENCE_PIECE_VERSION: u32 = 1;

const FLAG_ADD_DUMMY_PREFIX: u32 = 1;
const FLAG_REMOVE_EXTRA_WHITESPACES: u32 = 1 << 1;
const FLAG_ESCAPE_WHITESPACES: u32 = 1 << 2;

// Unknown bytes cost this much more than the least likely piece.
const UNKNOWN_PENALTY_MARGIN: f32 = 10.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("config blob truncated while reading {0}")]
    Truncated(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig<'a> {
    pub start_code: i32,
    pub end_code: i32,
    /// Negative when unknown bytes are not allowed.
    pub unknown_code: i32,
    pub unknown_penalty: f32,
    pub encoding_offset: i32,
    pub add_dummy_prefix: bool,
    pub remove_extra_whitespaces: bool,
    pub escape_whitespaces: bool,
    pieces: &'a [u8],
    scores: &'a [u8],
    normalized_prefixes: &'a [u8],
    normalized_replacements: &'a [u8],
}

/// Reads the version tag without parsing the rest of the blob.
pub fn blob_version(blob: &[u8]) -> Option<u32> {
    frozen::read_u32(blob, 0)
}

impl<'a> EncoderConfig<'a> {
    pub fn from_bytes(blob: &'a [u8]) -> Result<Self, ConfigError> {
        let mut r = FrozenReader::new(blob);
        let version = r.u32().ok_or(ConfigError::Truncated("version"))?;
        if version != SENTENCE_PIECE_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }
        let flags = r.u32().ok_or(ConfigError::Truncated("flags"))?;
        let start_code = r.i32().ok_or(ConfigError::Truncated("start_code"))?;
        let end_code = r.i32().ok_or(ConfigError::Truncated("end_code"))?;
        let unknown_code = r.i32().ok_or(ConfigError::Truncated("unknown_code"))?;
        let unknown_penalty = r.f32().ok_or(ConfigError::Truncated("unknown_penalty"))?;
        let encoding_offset = r.i32().ok_or(ConfigError::Truncated("encoding_offset"))?;
        let pieces = r.section(4).ok_or(ConfigError::Truncated("pieces"))?;
        let scores = r.section(4).ok_or(ConfigError::Truncated("pieces_scores"))?;
        let normalized_prefixes = r
            .section(4)
            .ok_or(ConfigError::Truncated("normalized_prefixes"))?;
        let normalized_replacements = r
            .section(1)
            .ok_or(ConfigError::Truncated("normalized_replacements"))?;

        Ok(EncoderConfig {
            start_code,
            end_code,
            unknown_code,
            unknown_penalty,
            encoding_offset,
            add_dummy_prefix: flags & FLAG_ADD_DUMMY_PREFIX != 0,
            remove_extra_whitespaces: flags & FLAG_REMOVE_EXTRA_WHITESPACES != 0,
            escape_whitespaces: flags & FLAG_ESCAPE_WHITESPACES != 0,
            pieces,
            scores,
            normalized_prefixes,
            normalized_replacements,
        })
    }

    pub fn pieces(&self) -> TrieMatcher<'a> {
        TrieMatcher::new(self.pieces)
    }

    pub fn piece_score(&self, id: u32) -> Option<f32> {
        frozen::read_f32(self.scores, (id as usize).checked_mul(4)?)
    }

    pub fn num_scores(&self) -> usize {
        self.scores.len() / 4
    }

    /// The normalization trie and its replacement blob, when both are present.
    pub fn normalization(&self) -> Option<(TrieMatcher<'a>, &'a [u8])> {
        if self.normalized_prefixes.is_empty() || self.normalized_replacements.is_empty() {
            return None;
        }
        Some((
            TrieMatcher::new(self.normalized_prefixes),
            self.normalized_replacements,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceKind {
    Normal,
    Control,
    Unknown,
}

#[derive(Debug, Clone)]
enum Normalization {
    None,
    Rules(Vec<(Vec<u8>, Vec<u8>)>),
    Precompiled { units: Vec<u32>, replacements: Vec<u8> },
}

/// Assembles an encoder blob. Piece ids are assigned in insertion order.
#[derive(Debug, Clone)]
pub struct EncoderConfigBuilder {
    pieces: Vec<(Vec<u8>, f32, PieceKind)>,
    start_code: i32,
    end_code: i32,
    unknown_penalty: Option<f32>,
    encoding_offset: i32,
    add_dummy_prefix: bool,
    remove_extra_whitespaces: bool,
    escape_whitespaces: bool,
    normalization: Normalization,
}

impl Default for EncoderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderConfigBuilder {
    pub fn new() -> Self {
        EncoderConfigBuilder {
            pieces: Vec::new(),
            start_code: -1,
            end_code: -1,
            unknown_penalty: None,
            encoding_offset: 0,
            add_dummy_prefix: false,
            remove_extra_whitespaces: false,
            escape_whitespaces: false,
            normalization: Normalization::None,
        }
    }

    /// Adds a matchable piece and returns its id.
    pub fn piece(&mut self, text: impl AsRef<[u8]>, score: f32) -> i32 {
        self.push_piece(text.as_ref(), score, PieceKind::Normal)
    }

    /// Reserves an id for a piece that never matches input text.
    pub fn control_piece(&mut self, text: impl AsRef<[u8]>) -> i32 {
        self.push_piece(text.as_ref(), 0.0, PieceKind::Control)
    }

    /// Reserves the id emitted for bytes no piece covers.
    pub fn unknown_piece(&mut self, text: impl AsRef<[u8]>) -> i32 {
        self.push_piece(text.as_ref(), 0.0, PieceKind::Unknown)
    }

    fn push_piece(&mut self, text: &[u8], score: f32, kind: PieceKind) -> i32 {
        self.pieces.push((text.to_vec(), score, kind));
        self.pieces.len() as i32 - 1
    }

    pub fn start_code(&mut self, code: i32) -> &mut Self {
        self.start_code = code;
        self
    }

    pub fn end_code(&mut self, code: i32) -> &mut Self {
        self.end_code = code;
        self
    }

    pub fn unknown_penalty(&mut self, penalty: f32) -> &mut Self {
        self.unknown_penalty = Some(penalty);
        self
    }

    pub fn encoding_offset(&mut self, offset: i32) -> &mut Self {
        self.encoding_offset = offset;
        self
    }

    pub fn add_dummy_prefix(&mut self, on: bool) -> &mut Self {
        self.add_dummy_prefix = on;
        self
    }

    pub fn remove_extra_whitespaces(&mut self, on: bool) -> &mut Self {
        self.remove_extra_whitespaces = on;
        self
    }

    pub fn escape_whitespaces(&mut self, on: bool) -> &mut Self {
        self.escape_whitespaces = on;
        self
    }

    /// Replaces `from` with `to` during normalization (longest match wins).
    pub fn normalization_rule(&mut self, from: impl AsRef<[u8]>, to: impl AsRef<[u8]>) -> &mut Self {
        let rule = (from.as_ref().to_vec(), to.as_ref().to_vec());
        match &mut self.normalization {
            Normalization::Rules(rules) => rules.push(rule),
            other => *other = Normalization::Rules(vec![rule]),
        }
        self
    }

    /// Uses an already built normalization trie whose values are offsets
    /// into `replacements`.
    pub fn precompiled_normalization(&mut self, units: Vec<u32>, replacements: Vec<u8>) -> &mut Self {
        self.normalization = Normalization::Precompiled {
            units,
            replacements,
        };
        self
    }

    fn unknown_code(&self) -> i32 {
        self.pieces
            .iter()
            .position(|(_, _, kind)| *kind == PieceKind::Unknown)
            .map_or(-1, |i| i as i32)
    }

    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut trie = DoubleArrayBuilder::new();
        let mut scores = Vec::with_capacity(self.pieces.len());
        let mut min_score = 0.0f32;
        for (id, (text, score, kind)) in self.pieces.iter().enumerate() {
            scores.push(*score);
            if *kind == PieceKind::Normal {
                trie.insert(text, id as u32)?;
                min_score = min_score.min(*score);
            }
        }
        let pieces = trie.build()?;

        let (norm_units, replacements) = match &self.normalization {
            Normalization::None => (Vec::new(), Vec::new()),
            Normalization::Rules(rules) => build_replacements(rules)?,
            Normalization::Precompiled {
                units,
                replacements,
            } => (units.clone(), replacements.clone()),
        };

        let mut flags = 0;
        if self.add_dummy_prefix {
            flags |= FLAG_ADD_DUMMY_PREFIX;
        }
        if self.remove_extra_whitespaces {
            flags |= FLAG_REMOVE_EXTRA_WHITESPACES;
        }
        if self.escape_whitespaces {
            flags |= FLAG_ESCAPE_WHITESPACES;
        }
        let unknown_penalty = self
            .unknown_penalty
            .unwrap_or(min_score - UNKNOWN_PENALTY_MARGIN);

        let mut w = FrozenWriter::new();
        w.u32(SENTENCE_PIECE_VERSION)
            .u32(flags)
            .i32(self.start_code)
            .i32(self.end_code)
            .i32(self.unknown_code())
            .f32(unknown_penalty)
            .i32(self.encoding_offset)
            .u32_section(&pieces)
            .f32_section(&scores)
            .u32_section(&norm_units)
            .byte_section(&replacements);
        Ok(w.finish())
    }
}

fn build_replacements(rules: &[(Vec<u8>, Vec<u8>)]) -> Result<(Vec<u32>, Vec<u8>), BuildError> {
    let mut trie = DoubleArrayBuilder::new();
    let mut blob = Vec::new();
    for (from, to) in rules {
        if to.contains(&0) {
            return Err(BuildError::NulByte(String::from_utf8_lossy(to).into_owned()));
        }
        trie.insert(from, blob.len() as u32)?;
        blob.extend_from_slice(to);
        blob.push(0);
    }
    Ok((trie.build()?, blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::Match;

    #[test]
    fn builder_round_trips_scalars_and_flags() {
        let mut b = EncoderConfigBuilder::new();
        b.unknown_piece("<unk>");
        let bos = b.control_piece("<s>");
        let eos = b.control_piece("</s>");
        b.piece("a", -1.5);
        b.start_code(bos)
            .end_code(eos)
            .encoding_offset(3)
            .add_dummy_prefix(true)
            .escape_whitespaces(true);
        let blob = b.build().unwrap();
        let config = EncoderConfig::from_bytes(&blob).unwrap();

        assert_eq!(config.start_code, 1);
        assert_eq!(config.end_code, 2);
        assert_eq!(config.unknown_code, 0);
        assert_eq!(config.encoding_offset, 3);
        assert_eq!(config.unknown_penalty, -11.5);
        assert!(config.add_dummy_prefix);
        assert!(!config.remove_extra_whitespaces);
        assert!(config.escape_whitespaces);
        assert_eq!(config.num_scores(), 4);
        assert_eq!(config.piece_score(3), Some(-1.5));
        assert_eq!(config.piece_score(4), None);
        assert!(config.normalization().is_none());
    }

    #[test]
    fn control_and_unknown_pieces_are_not_matchable() {
        let mut b = EncoderConfigBuilder::new();
        b.unknown_piece("<unk>");
        b.control_piece("<s>");
        b.piece("<", -2.0);
        let blob = b.build().unwrap();
        let config = EncoderConfig::from_bytes(&blob).unwrap();
        assert_eq!(
            config.pieces().longest_prefix_match(b"<s>"),
            Some(Match { id: 2, len: 1 })
        );
    }

    #[test]
    fn unknown_is_disabled_without_unknown_piece() {
        let mut b = EncoderConfigBuilder::new();
        b.piece("a", 0.0);
        let blob = b.build().unwrap();
        assert_eq!(EncoderConfig::from_bytes(&blob).unwrap().unknown_code, -1);
    }

    #[test]
    fn rejects_other_versions() {
        let mut blob = EncoderConfigBuilder::new().build().unwrap();
        blob[0] = 9;
        assert_eq!(
            EncoderConfig::from_bytes(&blob).unwrap_err(),
            ConfigError::UnsupportedVersion(9)
        );
        assert_eq!(blob_version(&blob), Some(9));
    }

    #[test]
    fn rejects_truncated_blobs() {
        let mut b = EncoderConfigBuilder::new();
        b.piece("abc", -1.0);
        let blob = b.build().unwrap();
        for cut in [0, 2, 10, 30, blob.len() - 1] {
            assert!(
                matches!(
                    EncoderConfig::from_bytes(&blob[..cut]),
                    Err(ConfigError::Truncated(_))
                ),
                "cut at {cut}"
            );
        }
        assert!(EncoderConfig::from_bytes(&blob).is_ok());
    }

    #[test]
    fn replacement_rules_point_into_blob() {
        let mut b = EncoderConfigBuilder::new();
        b.normalization_rule("AA", "A2").normalization_rule("A", "A1");
        let blob = b.build().unwrap();
        let config = EncoderConfig::from_bytes(&blob).unwrap();
        let (trie, replacements) = config.normalization().unwrap();
        assert_eq!(replacements, b"A2\0A1\0");
        assert_eq!(
            trie.longest_prefix_match(b"AAA"),
            Some(Match { id: 0, len: 2 })
        );
        assert_eq!(trie.longest_prefix_match(b"AB"), Some(Match { id: 3, len: 1 }));
    }

    #[test]
    fn replacement_with_nul_is_rejected() {
        let mut b = EncoderConfigBuilder::new();
        b.normalization_rule("x", "a\0b");
        assert!(matches!(b.build(), Err(BuildError::NulByte(_))));
    }
}
