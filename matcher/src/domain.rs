// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Domain name matching: a full matcher, a label-suffix trie, a keyword matcher, a
//! regex matcher, and `MixMatcher` composing all four.

use crate::Append;
use hashbrown::HashMap;
use regex::Regex;
use std::sync::Arc;

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

// Three fixed-size byte buckets, smallest that fits the normalized name.
const BUCKET_16: usize = 16;
const BUCKET_32: usize = 32;
const BUCKET_256: usize = 256;

fn pack<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    buf
}

/// Exact FQDN-equality matcher. Entries are bucketed by normalized name length into
/// one of three fixed-size byte-array maps to avoid hashing variable-length strings.
#[derive(Debug, Clone, Default)]
pub struct FullMatcher<T> {
    b16: HashMap<[u8; BUCKET_16], T>,
    b32: HashMap<[u8; BUCKET_32], T>,
    b256: HashMap<[u8; BUCKET_256], T>,
    // Names longer than 256 bytes (rare; a FQDN is capped at 255 wire octets in
    // practice) fall back to a plain string map rather than being rejected.
    overflow: HashMap<Box<str>, T>,
}

impl<T: Clone + Append> FullMatcher<T> {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `domain` with an associated value. Colliding inserts are merged via
    /// [`Append`].
    pub fn insert(&mut self, domain: &str, value: T) {
        let key = normalize(domain);
        match key.len() {
            n if n <= BUCKET_16 => insert_bucket(&mut self.b16, pack(&key), value),
            n if n <= BUCKET_32 => insert_bucket(&mut self.b32, pack(&key), value),
            n if n <= BUCKET_256 => insert_bucket(&mut self.b256, pack(&key), value),
            _ => insert_bucket(&mut self.overflow, key.into_boxed_str(), value),
        }
    }

    /// Look up an exact match.
    pub fn get(&self, domain: &str) -> Option<&T> {
        let key = normalize(domain);
        match key.len() {
            n if n <= BUCKET_16 => self.b16.get(&pack::<BUCKET_16>(&key)),
            n if n <= BUCKET_32 => self.b32.get(&pack::<BUCKET_32>(&key)),
            n if n <= BUCKET_256 => self.b256.get(&pack::<BUCKET_256>(&key)),
            _ => self.overflow.get(key.as_str()),
        }
    }
}

fn insert_bucket<K: std::hash::Hash + Eq, T: Append>(map: &mut HashMap<K, T>, key: K, value: T) {
    match map.get_mut(&key) {
        Some(existing) => existing.append(value),
        None => {
            map.insert(key, value);
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
struct LevelNode<T> {
    dst: Option<T>,
    next_lvs: HashMap<Arc<str>, LevelNode<T>>,
}

impl<T> LevelNode<T> {
    fn new() -> Self {
        Self {
            dst: None,
            next_lvs: HashMap::new(),
        }
    }
}

/// Label-aligned suffix matcher, backed by a trie walked from the TLD inward.
/// If `apple.com` is inserted, `www.apple.com` and `store.www.apple.com` match
/// while `apple.cn` does not.
#[derive(Debug, Clone)]
pub struct SuffixTrie<T> {
    root: LevelNode<T>,
}

impl<T> Default for SuffixTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Append> SuffixTrie<T> {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self {
            root: LevelNode::new(),
        }
    }

    #[cfg(test)]
    fn get_root(&self) -> &LevelNode<T> {
        &self.root
    }

    /// Insert `domain` with an associated value, appending on collision.
    pub fn insert(&mut self, domain: &str, value: T) {
        let key = normalize(domain);
        let lvs: Vec<&str> = key.split('.').filter(|lv| !lv.is_empty()).rev().collect();
        let mut ptr = &mut self.root;
        for lv in lvs {
            ptr = ptr
                .next_lvs
                .entry(Arc::from(lv))
                .or_insert_with(LevelNode::new);
        }
        match &mut ptr.dst {
            Some(existing) => existing.append(value),
            None => ptr.dst = Some(value),
        }
    }

    /// Pass in a string containing `\n` and insert every non-empty line.
    pub fn insert_multi(&mut self, domains: &str, value: T)
    where
        T: Clone,
    {
        for line in domains.split('\n').filter(|l| !l.is_empty()) {
            self.insert(line, value.clone());
        }
    }

    /// Match `domain` against every inserted suffix rule, returning the deepest
    /// one that applies.
    pub fn get(&self, domain: &str) -> Option<&T> {
        let key = normalize(domain);
        let lvs: Vec<&str> = key.split('.').filter(|lv| !lv.is_empty()).rev().collect();
        let mut ptr = &self.root;
        let mut best = ptr.dst.as_ref();
        for lv in lvs {
            ptr = match ptr.next_lvs.get(lv) {
                Some(v) => v,
                None => break,
            };
            if ptr.dst.is_some() {
                best = ptr.dst.as_ref();
            }
        }
        best
    }

    /// Whether any inserted rule matches `domain`.
    pub fn matches(&self, domain: &str) -> bool {
        self.get(domain).is_some()
    }
}

/// Linear substring matcher, suitable for small keyword sets.
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher<T> {
    entries: Vec<(String, T)>,
}

impl<T: Append> KeywordMatcher<T> {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert a keyword with an associated value.
    pub fn insert(&mut self, keyword: &str, value: T) {
        let keyword = normalize(keyword);
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == keyword) {
            existing.append(value);
        } else {
            self.entries.push((keyword, value));
        }
    }

    /// Find the first keyword contained in `domain`.
    pub fn get(&self, domain: &str) -> Option<&T> {
        let key = normalize(domain);
        self.entries
            .iter()
            .find(|(k, _)| key.contains(k.as_str()))
            .map(|(_, v)| v)
    }
}

/// Linear precompiled-regex matcher.
#[derive(Debug, Clone, Default)]
pub struct RegexMatcher<T> {
    entries: Vec<(Regex, T)>,
}

impl<T> RegexMatcher<T> {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Compile `pattern` and insert it with an associated value.
    pub fn insert(&mut self, pattern: &str, value: T) -> Result<(), regex::Error> {
        self.entries.push((Regex::new(pattern)?, value));
        Ok(())
    }

    /// Find the first pattern matching `domain`.
    pub fn get(&self, domain: &str) -> Option<&T> {
        let key = normalize(domain);
        self.entries
            .iter()
            .find(|(re, _)| re.is_match(&key))
            .map(|(_, v)| v)
    }
}

/// A domain matcher composing full, suffix, regex and keyword sub-matchers.
/// Evaluation order is full → suffix → regex → keyword; the first sub-matcher
/// with a hit wins. Each sub-matcher is optional so an unused one costs nothing.
#[derive(Debug, Clone, Default)]
pub struct MixMatcher<T> {
    full: Option<FullMatcher<T>>,
    suffix: Option<SuffixTrie<T>>,
    regex: Option<RegexMatcher<T>>,
    keyword: Option<KeywordMatcher<T>>,
}

impl<T: Clone + Append> MixMatcher<T> {
    /// Create an empty matcher with no sub-matchers enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `full`-matched entry, enabling the full sub-matcher on first use.
    pub fn insert_full(&mut self, domain: &str, value: T) {
        self.full.get_or_insert_with(FullMatcher::new).insert(domain, value);
    }

    /// Insert a `suffix`-matched entry, enabling the suffix sub-matcher on first use.
    pub fn insert_suffix(&mut self, domain: &str, value: T) {
        self.suffix
            .get_or_insert_with(SuffixTrie::new)
            .insert(domain, value);
    }

    /// Insert a `regex`-matched entry, enabling the regex sub-matcher on first use.
    pub fn insert_regex(&mut self, pattern: &str, value: T) -> Result<(), regex::Error> {
        self.regex.get_or_insert_with(RegexMatcher::new).insert(pattern, value)
    }

    /// Insert a `keyword`-matched entry, enabling the keyword sub-matcher on first use.
    pub fn insert_keyword(&mut self, keyword: &str, value: T) {
        self.keyword
            .get_or_insert_with(KeywordMatcher::new)
            .insert(keyword, value);
    }

    /// Evaluate `domain` against every enabled sub-matcher in spec order, returning
    /// the first hit.
    pub fn get(&self, domain: &str) -> Option<&T> {
        self.full
            .as_ref()
            .and_then(|m| m.get(domain))
            .or_else(|| self.suffix.as_ref().and_then(|m| m.get(domain)))
            .or_else(|| self.regex.as_ref().and_then(|m| m.get(domain)))
            .or_else(|| self.keyword.as_ref().and_then(|m| m.get(domain)))
    }

    /// Whether any sub-matcher matches `domain`.
    pub fn matches(&self, domain: &str) -> bool {
        self.get(domain).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(Vec<u32>);
    impl Append for Tag {
        fn append(&mut self, other: Self) {
            self.0.extend(other.0);
        }
    }

    #[test]
    fn suffix_matches() {
        let mut matcher = SuffixTrie::new();
        matcher.insert("apple.com", Tag(vec![1]));
        matcher.insert("apple.cn", Tag(vec![2]));
        assert!(matcher.matches("store.apple.com"));
        assert!(matcher.matches("store.apple.com."));
        assert!(!matcher.matches("baidu.com"));
        assert_eq!(matcher.get("www.apple.cn"), Some(&Tag(vec![2])));
    }

    #[test]
    fn suffix_collision_appends() {
        let mut matcher = SuffixTrie::new();
        matcher.insert("apple.com", Tag(vec![1]));
        matcher.insert("apple.com", Tag(vec![2]));
        assert_eq!(matcher.get("apple.com"), Some(&Tag(vec![1, 2])));
    }

    #[test]
    fn full_matches_exact_only() {
        let mut matcher = FullMatcher::new();
        matcher.insert("apple.com", Tag(vec![1]));
        assert_eq!(matcher.get("apple.com"), Some(&Tag(vec![1])));
        assert_eq!(matcher.get("www.apple.com"), None);
    }

    #[test]
    fn full_matches_oversized_names() {
        let mut matcher = FullMatcher::new();
        let long = format!("{}.com", "a".repeat(300));
        matcher.insert(&long, Tag(vec![9]));
        assert_eq!(matcher.get(&long), Some(&Tag(vec![9])));
    }

    #[test]
    fn keyword_matches_substring() {
        let mut matcher = KeywordMatcher::new();
        matcher.insert("ads", Tag(vec![1]));
        assert!(matcher.get("ads.example.com").is_some());
        assert!(matcher.get("example.com").is_none());
    }

    #[test]
    fn regex_matches_pattern() {
        let mut matcher = RegexMatcher::new();
        matcher.insert(r"^\d+\.tracker\.example\.com$", Tag(vec![1])).unwrap();
        assert!(matcher.get("123.tracker.example.com").is_some());
        assert!(matcher.get("tracker.example.com").is_none());
    }

    #[test]
    fn mix_matcher_order_full_beats_suffix() {
        let mut matcher = MixMatcher::new();
        matcher.insert_suffix("example.com", Tag(vec![100]));
        matcher.insert_full("blocked.example.com", Tag(vec![1]));
        assert_eq!(matcher.get("blocked.example.com"), Some(&Tag(vec![1])));
        assert_eq!(matcher.get("other.example.com"), Some(&Tag(vec![100])));
    }

    #[test]
    fn mix_matcher_falls_through_to_keyword() {
        let mut matcher: MixMatcher<Tag> = MixMatcher::new();
        matcher.insert_keyword("ads", Tag(vec![7]));
        assert_eq!(matcher.get("ads.cdn.example.net"), Some(&Tag(vec![7])));
        assert_eq!(matcher.get("example.net"), None);
    }
}
