use std::collections::HashSet;

use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::builder::BuildError;
use crate::config::EncoderConfigBuilder;
use crate::decoder::{DecoderConfigBuilder, UNKNOWN_SURFACE};
use crate::frozen::read_u32;

const SPACE_SYMBOL: &str = "\u{2581}";

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 in precompiled charsmap: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported model type {0:?}, expected Unigram")]
    UnsupportedModel(String),
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("malformed precompiled charsmap: {0}")]
    Charsmap(&'static str),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// Added to every emitted non-unknown id.
    pub encoding_offset: i32,
}

#[derive(Debug, Clone)]
pub struct ConvertedModel {
    pub encoder: Vec<u8>,
    pub decoder: Vec<u8>,
    pub vocab_size: usize,
}

#[derive(Debug, Default)]
struct NormalizerPlan {
    charsmap: Option<Vec<u8>>,
    nfkc: bool,
    add_dummy_prefix: bool,
    remove_extra_whitespaces: bool,
    escape_whitespaces: bool,
}

pub fn convert_tokenizer_json(json: &str, options: ConvertOptions) -> Result<ConvertedModel, ConvertError> {
    let root: Value = serde_json::from_str(json)?;
    let model = root.get("model").ok_or(ConvertError::Missing("model"))?;
    let ty = model.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if ty != "Unigram" {
        return Err(ConvertError::UnsupportedModel(ty.to_string()));
    }

    let vocab = model
        .get("vocab")
        .and_then(|v| v.as_array())
        .ok_or(ConvertError::Missing("model.vocab"))?;
    let unk_id = model.get("unk_id").and_then(|v| v.as_u64()).map(|v| v as usize);
    let special: HashSet<usize> = root
        .get("added_tokens")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|t| t.get("special").and_then(|s| s.as_bool()).unwrap_or(false))
                .filter_map(|t| t.get("id").and_then(|id| id.as_u64()))
                .map(|id| id as usize)
                .collect()
        })
        .unwrap_or_default();

    let mut pieces: Vec<(&str, f32)> = Vec::with_capacity(vocab.len());
    for entry in vocab {
        let piece = entry
            .get(0)
            .and_then(|p| p.as_str())
            .ok_or(ConvertError::Missing("model.vocab[][0]"))?;
        let score = entry.get(1).and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
        pieces.push((piece, score));
    }

    let mut plan = NormalizerPlan::default();
    walk_normalizer(root.get("normalizer"), &mut plan)?;
    walk_pre_tokenizer(root.get("pre_tokenizer"), &mut plan);

    let mut enc = EncoderConfigBuilder::new();
    let mut dec = DecoderConfigBuilder::new();
    for (id, &(piece, score)) in pieces.iter().enumerate() {
        if Some(id) == unk_id {
            enc.unknown_piece(piece);
            dec.piece(UNKNOWN_SURFACE);
        } else if special.contains(&id) || piece.is_empty() {
            enc.control_piece(piece);
            dec.piece("");
        } else {
            enc.piece(piece, score);
            dec.piece(piece);
        }
    }

    let find = |name: &str| pieces.iter().position(|&(p, _)| p == name).map(|i| i as i32);
    let (bos, eos) = template_special_ids(root.get("post_processor"));
    let start_code = bos.or_else(|| find("<s>")).unwrap_or(-1);
    let end_code = eos.or_else(|| find("</s>")).unwrap_or(-1);

    enc.start_code(start_code)
        .end_code(end_code)
        .encoding_offset(options.encoding_offset)
        .add_dummy_prefix(plan.add_dummy_prefix)
        .remove_extra_whitespaces(plan.remove_extra_whitespaces)
        .escape_whitespaces(plan.escape_whitespaces);

    let mut rule_count = 0;
    if let Some(charsmap) = &plan.charsmap {
        let (units, replacements) = decode_precompiled_charsmap(charsmap)?;
        rule_count = units.len();
        enc.precompiled_normalization(units, replacements);
    } else if plan.nfkc {
        for (from, to) in nfkc_rules() {
            enc.normalization_rule(from, to);
            rule_count += 1;
        }
    }

    dec.encoding_offset(options.encoding_offset)
        .strip_dummy_prefix(plan.add_dummy_prefix)
        .unescape_whitespaces(plan.escape_whitespaces);
    if let Some(unk) = unk_id {
        dec.unknown_code(unk as i32);
    }

    let encoder = enc.build()?;
    tracing::info!(
        pieces = pieces.len(),
        start_code,
        end_code,
        unknown_code = unk_id.map_or(-1, |u| u as i64),
        normalization = rule_count,
        "converted unigram model"
    );
    Ok(ConvertedModel {
        encoder,
        decoder: dec.build(),
        vocab_size: pieces.len(),
    })
}

fn walk_normalizer(val: Option<&Value>, plan: &mut NormalizerPlan) -> Result<(), ConvertError> {
    let val = match val {
        Some(v) if !v.is_null() => v,
        _ => return Ok(()),
    };
    let ty = val.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match ty {
        "Sequence" => {
            if let Some(arr) = val.get("normalizers").and_then(|v| v.as_array()) {
                for item in arr {
                    walk_normalizer(Some(item), plan)?;
                }
            }
        }
        "Precompiled" => {
            let encoded = val
                .get("precompiled_charsmap")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !encoded.is_empty() {
                let engine = base64::engine::general_purpose::STANDARD;
                plan.charsmap = Some(engine.decode(encoded)?);
            }
        }
        "Replace" => {
            let pattern = val.get("pattern");
            let regex = pattern.and_then(|p| p.get("Regex")).and_then(|s| s.as_str());
            let literal = pattern.and_then(|p| p.get("String")).and_then(|s| s.as_str());
            let content = val.get("content").and_then(|s| s.as_str()).unwrap_or("");
            match (regex, literal, content) {
                (Some(" {2,}"), _, " ") => plan.remove_extra_whitespaces = true,
                (_, Some(" "), SPACE_SYMBOL) => plan.escape_whitespaces = true,
                _ => tracing::warn!(?regex, ?literal, "unsupported Replace normalizer ignored"),
            }
        }
        "Prepend" => {
            if val.get("prepend").and_then(|s| s.as_str()) == Some(SPACE_SYMBOL) {
                plan.add_dummy_prefix = true;
            }
        }
        "NFKC" => plan.nfkc = true,
        other => tracing::warn!(normalizer = other, "unsupported normalizer ignored"),
    }
    Ok(())
}

fn walk_pre_tokenizer(val: Option<&Value>, plan: &mut NormalizerPlan) {
    let val = match val {
        Some(v) if !v.is_null() => v,
        _ => return,
    };
    let ty = val.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match ty {
        "Sequence" => {
            if let Some(arr) = val.get("pretokenizers").and_then(|v| v.as_array()) {
                for item in arr {
                    walk_pre_tokenizer(Some(item), plan);
                }
            }
        }
        "Metaspace" => {
            plan.escape_whitespaces = true;
            let add_prefix_space = val
                .get("add_prefix_space")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let scheme = val.get("prepend_scheme").and_then(|v| v.as_str());
            if add_prefix_space || matches!(scheme, Some("always") | Some("first")) {
                plan.add_dummy_prefix = true;
            }
        }
        other => tracing::debug!(pre_tokenizer = other, "pre-tokenizer has no encoder counterpart"),
    }
}

/// BOS/EOS ids from a `TemplateProcessing` post-processor: the first special
/// token before `$A` and the first one after it.
fn template_special_ids(val: Option<&Value>) -> (Option<i32>, Option<i32>) {
    let val = match val {
        Some(v) if !v.is_null() => v,
        _ => return (None, None),
    };
    let ty = val.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match ty {
        "TemplateProcessing" => {
            let lookup = |name: &str| {
                val.get("special_tokens")
                    .and_then(|t| t.get(name))
                    .and_then(|t| t.get("ids"))
                    .and_then(|ids| ids.get(0))
                    .and_then(|id| id.as_i64())
                    .map(|id| id as i32)
            };
            let mut bos = None;
            let mut eos = None;
            let mut seen_sequence = false;
            for item in val.get("single").and_then(|v| v.as_array()).into_iter().flatten() {
                if item.get("Sequence").is_some() {
                    seen_sequence = true;
                } else if let Some(name) = item
                    .get("SpecialToken")
                    .and_then(|t| t.get("id"))
                    .and_then(|id| id.as_str())
                {
                    let slot = if seen_sequence { &mut eos } else { &mut bos };
                    if slot.is_none() {
                        *slot = lookup(name);
                    }
                }
            }
            (bos, eos)
        }
        "Sequence" => val
            .get("processors")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .map(|p| template_special_ids(Some(p)))
            .fold((None, None), |(b, e), (pb, pe)| (b.or(pb), e.or(pe))),
        _ => (None, None),
    }
}

/// Splits a SentencePiece precompiled charsmap into its double-array units
/// and the NUL-separated replacement blob.
pub fn decode_precompiled_charsmap(bytes: &[u8]) -> Result<(Vec<u32>, Vec<u8>), ConvertError> {
    let trie_size = read_u32(bytes, 0).ok_or(ConvertError::Charsmap("missing trie size"))? as usize;
    if trie_size % 4 != 0 {
        return Err(ConvertError::Charsmap("trie size is not a multiple of 4"));
    }
    let trie = bytes
        .get(4..4 + trie_size)
        .ok_or(ConvertError::Charsmap("trie extends past the end"))?;
    let units = trie
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((units, bytes[4 + trie_size..].to_vec()))
}

/// One rule per character whose NFKC form differs from itself.
pub fn nfkc_rules() -> Vec<(String, String)> {
    (1u32..=0x10ffff)
        .filter_map(char::from_u32)
        .filter_map(|c| {
            let from = c.to_string();
            let to: String = from.nfkc().collect();
            (to != from && !to.contains('\0')).then_some((from, to))
        })
        .collect()
}
