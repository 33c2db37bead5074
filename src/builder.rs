use std::collections::VecDeque;

use thiserror::Error;

const LEAF_BIT: u32 = 0x8000_0000;
const HAS_LEAF_BIT: u32 = 1 << 8;
const EXTENDED_OFFSET_BIT: u32 = 1 << 9;
const MAX_VALUE: u32 = 0x7fff_ffff;
const MAX_UNITS: usize = 1 << 29;

// Label bit 31 keeps unused slots from matching any input byte, NUL included.
const UNUSED_UNIT: u32 = LEAF_BIT;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("empty key")]
    EmptyKey,
    #[error("key {0:?} contains a NUL byte")]
    NulByte(String),
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),
    #[error("value {0} does not fit in 31 bits")]
    ValueOutOfRange(u32),
    #[error("double array exceeds the addressable offset range")]
    TooLarge,
}

#[derive(Default)]
struct Node {
    children: Vec<(u8, usize)>,
    value: Option<u32>,
}

pub struct DoubleArrayBuilder {
    nodes: Vec<Node>,
    keys: usize,
}

impl Default for DoubleArrayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleArrayBuilder {
    pub fn new() -> Self {
        DoubleArrayBuilder {
            nodes: vec![Node::default()],
            keys: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }

    pub fn insert(&mut self, key: &[u8], value: u32) -> Result<(), BuildError> {
        if key.is_empty() {
            return Err(BuildError::EmptyKey);
        }
        if key.contains(&0) {
            return Err(BuildError::NulByte(String::from_utf8_lossy(key).into_owned()));
        }
        if value > MAX_VALUE {
            return Err(BuildError::ValueOutOfRange(value));
        }

        let mut cur = 0;
        for &byte in key {
            let existing = self.nodes[cur]
                .children
                .iter()
                .find(|(k, _)| *k == byte)
                .map(|&(_, idx)| idx);
            cur = match existing {
                Some(idx) => idx,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[cur].children.push((byte, idx));
                    idx
                }
            };
        }
        if self.nodes[cur].value.is_some() {
            return Err(BuildError::DuplicateKey(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        self.nodes[cur].value = Some(value);
        self.keys += 1;
        Ok(())
    }

    pub fn build(&self) -> Result<Vec<u32>, BuildError> {
        if self.keys == 0 {
            return Ok(Vec::new());
        }

        let mut units = vec![UNUSED_UNIT; 256];
        let mut layout = Layout::default();
        units[0] = 0;
        layout.occupy(0);

        let mut queue = VecDeque::new();
        queue.push_back((0usize, 0usize));

        while let Some((node_idx, s)) = queue.pop_front() {
            let node = &self.nodes[node_idx];
            let mut children = node.children.clone();
            children.sort_by_key(|(k, _)| *k);

            let mut labels = Vec::with_capacity(children.len() + 1);
            if node.value.is_some() {
                labels.push(0u8);
            }
            labels.extend(children.iter().map(|&(k, _)| k));
            if labels.is_empty() {
                continue;
            }

            let base = layout.find_base(&labels, s)?;
            layout.claim_base(base);
            let needed = (base | 0xff) + 1;
            if units.len() < needed {
                units.resize(needed, UNUSED_UNIT);
            }

            let encoded = encode_offset(s ^ base).ok_or(BuildError::TooLarge)?;
            units[s] = (units[s] & (LEAF_BIT | HAS_LEAF_BIT | 0xff)) | encoded;

            if let Some(v) = node.value {
                units[base] = v | LEAF_BIT;
                units[s] |= HAS_LEAF_BIT;
                layout.occupy(base);
            }
            for &(byte, child) in &children {
                let t = base ^ byte as usize;
                units[t] = byte as u32;
                layout.occupy(t);
                queue.push_back((child, t));
            }
        }

        let used = layout.occupied.iter().rposition(|&o| o).map_or(0, |i| i + 1);
        units.truncate(used);
        tracing::debug!(keys = self.keys, units = units.len(), "built double array");
        Ok(units)
    }
}

/// Packs an offset into unit bits 10..31; offsets of 2^21 and above must be
/// multiples of 256 and are stored shifted, flagged by bit 9.
pub fn encode_offset(offset: usize) -> Option<u32> {
    if offset < 1 << 21 {
        Some((offset as u32) << 10)
    } else if offset < MAX_UNITS && offset & 0xff == 0 {
        Some(((offset as u32) << 2) | EXTENDED_OFFSET_BIT)
    } else {
        None
    }
}

pub fn units_to_bytes(units: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 4);
    for &u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

// Slots further than this behind the end of the array are no longer
// searched; they are nearly full by then.
const SEARCH_WINDOW: usize = 16 * 256;

#[derive(Default)]
struct Layout {
    occupied: Vec<bool>,
    used_bases: Vec<bool>,
    // `skip[i] == i` for free slots; occupied slots point further right, so
    // runs of occupied slots are jumped over (with path compression).
    skip: Vec<usize>,
}

impl Layout {
    fn is_free(&self, pos: usize) -> bool {
        !self.occupied.get(pos).copied().unwrap_or(false)
    }

    fn occupy(&mut self, pos: usize) {
        if pos >= self.occupied.len() {
            let len = self.occupied.len();
            self.occupied.resize(pos + 1, false);
            self.skip.extend(len..pos + 1);
        }
        self.occupied[pos] = true;
        self.skip[pos] = pos + 1;
    }

    fn claim_base(&mut self, base: usize) {
        if base >= self.used_bases.len() {
            self.used_bases.resize(base + 1, false);
        }
        self.used_bases[base] = true;
    }

    /// First free slot at or after `pos`.
    fn free_from(&mut self, pos: usize) -> usize {
        let mut root = pos;
        while root < self.skip.len() && self.skip[root] != root {
            root = self.skip[root];
        }
        let mut cur = pos;
        while cur < self.skip.len() && self.skip[cur] != cur {
            let next = self.skip[cur];
            self.skip[cur] = root;
            cur = next;
        }
        root
    }

    fn find_base(&mut self, labels: &[u8], s: usize) -> Result<usize, BuildError> {
        let first = labels[0] as usize;
        let mut pos = self.free_from(self.occupied.len().saturating_sub(SEARCH_WINDOW));
        loop {
            if pos >= MAX_UNITS {
                return Err(BuildError::TooLarge);
            }
            let base = pos ^ first;
            // Base 0 would make the root reachable as a child slot.
            let usable = base != 0
                && !self.used_bases.get(base).copied().unwrap_or(false)
                && encode_offset(s ^ base).is_some()
                && labels[1..].iter().all(|&l| self.is_free(base ^ l as usize));
            if usable {
                return Ok(base);
            }
            pos = self.free_from(pos + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::{self, Match, TrieMatcher};

    #[test]
    fn rejects_invalid_keys() {
        let mut b = DoubleArrayBuilder::new();
        assert_eq!(b.insert(b"", 0), Err(BuildError::EmptyKey));
        assert!(matches!(b.insert(b"a\0b", 0), Err(BuildError::NulByte(_))));
        assert_eq!(
            b.insert(b"a", 1 << 31),
            Err(BuildError::ValueOutOfRange(1 << 31))
        );
        b.insert(b"a", 1).unwrap();
        assert_eq!(
            b.insert(b"a", 2),
            Err(BuildError::DuplicateKey("a".to_string()))
        );
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn empty_builder_yields_empty_array() {
        assert!(DoubleArrayBuilder::new().build().unwrap().is_empty());
    }

    #[test]
    fn offsets_round_trip_through_unit_bits() {
        for off in [0usize, 1, 255, (1 << 21) - 1, 1 << 21, 0x1234_5600] {
            let unit = encode_offset(off).unwrap();
            assert_eq!(trie::offset(unit), off);
        }
        assert_eq!(encode_offset((1 << 21) + 1), None);
        assert_eq!(encode_offset(MAX_UNITS), None);
    }

    #[test]
    fn every_inserted_key_is_found() {
        let mut b = DoubleArrayBuilder::new();
        let keys: Vec<String> = (0..600).map(|i| format!("k{}x{}", i % 37, i)).collect();
        for (i, k) in keys.iter().enumerate() {
            b.insert(k.as_bytes(), i as u32 * 3).unwrap();
        }
        let bytes = units_to_bytes(&b.build().unwrap());
        let trie = TrieMatcher::new(&bytes);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(
                trie.longest_prefix_match(k.as_bytes()),
                Some(Match {
                    id: i as u32 * 3,
                    len: k.len()
                }),
                "key {k}"
            );
        }
        assert_eq!(trie.longest_prefix_match(b"k1"), None);
    }

    #[test]
    fn multibyte_keys_and_high_bytes() {
        let mut b = DoubleArrayBuilder::new();
        b.insert("\u{2581}".as_bytes(), 4).unwrap();
        b.insert("\u{2581}the".as_bytes(), 5).unwrap();
        b.insert(&[0xff, 0x01], 6).unwrap();
        let bytes = units_to_bytes(&b.build().unwrap());
        let trie = TrieMatcher::new(&bytes);
        let found: Vec<_> = trie.prefix_matches("\u{2581}then".as_bytes()).collect();
        assert_eq!(
            found,
            vec![Match { id: 4, len: 3 }, Match { id: 5, len: 6 }]
        );
        assert_eq!(
            trie.longest_prefix_match(&[0xff, 0x01, 0x02]),
            Some(Match { id: 6, len: 2 })
        );
    }

    #[test]
    fn build_is_deterministic() {
        let mut a = DoubleArrayBuilder::new();
        let mut b = DoubleArrayBuilder::new();
        for (i, k) in ["b", "a", "ab", "ba", "abc"].iter().enumerate() {
            a.insert(k.as_bytes(), i as u32).unwrap();
        }
        for (i, k) in ["b", "a", "ab", "ba", "abc"].iter().enumerate() {
            b.insert(k.as_bytes(), i as u32).unwrap();
        }
        assert_eq!(a.build().unwrap(), b.build().unwrap());
    }

    #[test]
    fn large_random_vocabulary_matches_brute_force() {
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        let mut expected = std::collections::HashMap::new();
        while expected.len() < 20_000 {
            let len = 1 + (next() % 8) as usize;
            // Mostly ASCII with some high bytes; never NUL.
            let key: Vec<u8> = (0..len)
                .map(|_| match next() % 4 {
                    0 => 0x80 | (next() % 0x80) as u8,
                    _ => b'a' + (next() % 26) as u8,
                })
                .collect();
            let id = expected.len() as u32;
            expected.entry(key).or_insert(id);
        }

        let mut b = DoubleArrayBuilder::new();
        for (k, &v) in &expected {
            b.insert(k, v).unwrap();
        }
        let units = b.build().unwrap();
        let bytes = units_to_bytes(&units);
        let trie = TrieMatcher::new(&bytes);
        for (k, &v) in &expected {
            assert_eq!(
                trie.longest_prefix_match(k),
                Some(Match { id: v, len: k.len() }),
                "key {k:?}"
            );
        }
        for _ in 0..2_000 {
            let query: Vec<u8> = (0..3).map(|_| b'a' + (next() % 26) as u8).collect();
            let brute = (1..=query.len())
                .rev()
                .find_map(|n| expected.get(&query[..n]).map(|&id| Match { id, len: n }));
            assert_eq!(trie.longest_prefix_match(&query), brute);
        }
    }
}
