use crate::config::EncoderConfig;
use crate::trie::TrieMatcher;

/// U+2581 LOWER ONE EIGHTH BLOCK, the escaped form of whitespace.
pub const SPACE_SYMBOL: &[u8] = "\u{2581}".as_bytes();

#[inline]
fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// Normalized bytes and, per byte, the input offset it originates from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub text: Vec<u8>,
    pub offsets: Vec<usize>,
}

impl Normalized {
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Clone, Copy)]
pub struct Normalizer<'a> {
    replacements: Option<(TrieMatcher<'a>, &'a [u8])>,
    pub add_dummy_prefix: bool,
    pub remove_extra_whitespaces: bool,
    pub escape_whitespaces: bool,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &EncoderConfig<'a>) -> Self {
        Normalizer {
            replacements: config.normalization(),
            add_dummy_prefix: config.add_dummy_prefix,
            remove_extra_whitespaces: config.remove_extra_whitespaces,
            escape_whitespaces: config.escape_whitespaces,
        }
    }

    pub fn normalize(&self, input: &[u8]) -> Normalized {
        if input.is_empty() {
            return Normalized::default();
        }
        let mut out = Normalized {
            text: input.to_vec(),
            offsets: (0..input.len()).collect(),
        };
        if self.add_dummy_prefix {
            out.text.insert(0, b' ');
            out.offsets.insert(0, 0);
        }
        if let Some((trie, replacements)) = &self.replacements {
            out = replace_prefixes(&out, trie, replacements);
        }
        if self.remove_extra_whitespaces {
            out = collapse_whitespaces(&out);
        }
        if self.escape_whitespaces {
            out = escape_whitespaces(&out);
        }
        out
    }
}

/// Greedy left-to-right replacement using the longest matching rule.
fn replace_prefixes(input: &Normalized, trie: &TrieMatcher<'_>, replacements: &[u8]) -> Normalized {
    let mut out = Normalized {
        text: Vec::with_capacity(input.len()),
        offsets: Vec::with_capacity(input.len()),
    };
    let mut i = 0;
    while i < input.len() {
        let found = trie
            .longest_prefix_match(&input.text[i..])
            .and_then(|m| Some((replacement_at(replacements, m.id as usize)?, m.len)));
        match found {
            Some((replacement, len)) => {
                out.text.extend_from_slice(replacement);
                out.offsets
                    .extend(std::iter::repeat(input.offsets[i]).take(replacement.len()));
                i += len;
            }
            None => {
                out.text.push(input.text[i]);
                out.offsets.push(input.offsets[i]);
                i += 1;
            }
        }
    }
    out
}

/// NUL-terminated string starting at `start`; unterminated strings run to
/// the end of the blob.
fn replacement_at(blob: &[u8], start: usize) -> Option<&[u8]> {
    let tail = blob.get(start..)?;
    if tail.is_empty() {
        return None;
    }
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Some(&tail[..end])
}

fn collapse_whitespaces(input: &Normalized) -> Normalized {
    let mut out = Normalized {
        text: Vec::with_capacity(input.len()),
        offsets: Vec::with_capacity(input.len()),
    };
    let mut i = 0;
    while i < input.len() {
        let b = input.text[i];
        if is_whitespace(b) {
            let run = input.text[i..]
                .iter()
                .take_while(|&&c| is_whitespace(c))
                .count();
            out.text.push(if run > 1 { b' ' } else { b });
            out.offsets.push(input.offsets[i]);
            i += run;
        } else {
            out.text.push(b);
            out.offsets.push(input.offsets[i]);
            i += 1;
        }
    }
    if out.text.last().copied().is_some_and(is_whitespace) {
        out.text.pop();
        out.offsets.pop();
    }
    out
}

fn escape_whitespaces(input: &Normalized) -> Normalized {
    let mut out = Normalized {
        text: Vec::with_capacity(input.len() + input.len() / 2),
        offsets: Vec::with_capacity(input.len() + input.len() / 2),
    };
    for (&b, &off) in input.text.iter().zip(&input.offsets) {
        if is_whitespace(b) {
            out.text.extend_from_slice(SPACE_SYMBOL);
            out.offsets.extend([off; 3]);
        } else {
            out.text.push(b);
            out.offsets.push(off);
        }
    }
    out
}
