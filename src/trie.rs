use crate::frozen::read_u32;

const HAS_LEAF_BIT: u32 = 1 << 8;
const LABEL_MASK: u32 = 0x8000_00ff;
const VALUE_MASK: u32 = 0x7fff_ffff;

#[inline(always)]
pub fn has_leaf(unit: u32) -> bool {
    unit & HAS_LEAF_BIT != 0
}

#[inline(always)]
pub fn value(unit: u32) -> u32 {
    unit & VALUE_MASK
}

#[inline(always)]
pub fn label(unit: u32) -> u32 {
    unit & LABEL_MASK
}

#[inline(always)]
pub fn offset(unit: u32) -> usize {
    ((unit >> 10) << ((unit & (1 << 9)) >> 6)) as usize
}

/// A key found in the trie: its stored value and the number of input bytes
/// it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub id: u32,
    pub len: usize,
}

/// Darts-style double array. A transition on byte `b` from `p` lands at
/// `p ^ b` and is valid when that unit's label is `b`; leaf values sit at the
/// child base with label bit 31 set.
#[derive(Clone, Copy)]
pub struct TrieMatcher<'a> {
    units: &'a [u8],
}

impl<'a> TrieMatcher<'a> {
    /// Wraps little-endian units. A trailing partial word is ignored.
    pub fn new(units: &'a [u8]) -> Self {
        TrieMatcher {
            units: &units[..units.len() - units.len() % 4],
        }
    }

    pub fn len(&self) -> usize {
        self.units.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[inline(always)]
    fn unit(&self, pos: usize) -> Option<u32> {
        read_u32(self.units, pos.checked_mul(4)?)
    }

    /// All keys that are prefixes of `input`, shortest first.
    pub fn prefix_matches<'b>(&self, input: &'b [u8]) -> PrefixMatches<'a, 'b> {
        let pos = self.unit(0).map(offset);
        PrefixMatches {
            trie: *self,
            input,
            consumed: 0,
            pos,
        }
    }

    /// The longest key that is a prefix of `input`.
    pub fn longest_prefix_match(&self, input: &[u8]) -> Option<Match> {
        self.prefix_matches(input).last()
    }
}

/// Lazy prefix search; restart by cloning or by calling
/// [`TrieMatcher::prefix_matches`] again.
#[derive(Clone)]
pub struct PrefixMatches<'a, 'b> {
    trie: TrieMatcher<'a>,
    input: &'b [u8],
    consumed: usize,
    // `None` once a transition fails.
    pos: Option<usize>,
}

impl Iterator for PrefixMatches<'_, '_> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        while let Some(pos) = self.pos {
            let Some(&b) = self.input.get(self.consumed) else {
                self.pos = None;
                break;
            };
            let next = pos ^ b as usize;
            let unit = match self.trie.unit(next) {
                Some(u) if label(u) == b as u32 => u,
                _ => {
                    self.pos = None;
                    break;
                }
            };
            let child = next ^ offset(unit);
            self.pos = Some(child);
            self.consumed += 1;

            if has_leaf(unit) {
                match self.trie.unit(child) {
                    Some(leaf) => {
                        return Some(Match {
                            id: value(leaf),
                            len: self.consumed,
                        })
                    }
                    None => self.pos = None,
                }
            }
        }
        None
    }
}
