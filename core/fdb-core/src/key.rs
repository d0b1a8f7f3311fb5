//! Ordered keyword/value keys.
//!
//! A `Key` identifies a database (level 0), an index (level 1) or a datum
//! (level 2). Insertion order is significant: it is the order the schema
//! visited the keywords in, and it drives both the fingerprint and the
//! directory names derived from a key.

use crate::error::{FdbError, FdbResult};
use crate::request::Request;
use crate::schema::SchemaId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Separator used by `values_to_string` and `fingerprint`.
pub const VALUE_SEPARATOR: char = ':';
const ESCAPE: char = '\\';

/// Splits a fingerprint on unescaped separators. `None` on a dangling escape.
fn split_fingerprint(fingerprint: &str) -> Option<Vec<String>> {
    let mut values = vec![String::new()];
    let mut chars = fingerprint.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => values.last_mut()?.push(chars.next()?),
            VALUE_SEPARATOR => values.push(String::new()),
            c => values.last_mut()?.push(c),
        }
    }
    Some(values)
}

/// Which schema rule produced a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleRef {
    pub schema: SchemaId,
    /// Position of the top-level rule inside the schema
    pub rule: usize,
}

/// Ordered mapping keyword → value.
///
/// Equality, ordering and hashing look at the pairs only; the owning rule is
/// metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Key {
    entries: SmallVec<[(String, String); 8]>,
    #[serde(skip)]
    rule: Option<RuleRef>,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a key from pairs, keeping their order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut key = Key::new();
        for (k, v) in pairs {
            key.set(k, v);
        }
        key
    }

    /// Parses `a=1,b=2`. Surrounding braces and whitespace are tolerated so
    /// the `Display` form parses back.
    ///
    /// # Example
    /// ```rust
    /// use fdb_core::Key;
    /// let key = Key::parse("{class=od,expver=0001}").unwrap();
    /// assert_eq!(key.get("expver"), Some("0001"));
    /// ```
    pub fn parse(text: &str) -> FdbResult<Self> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(trimmed);

        let mut key = Key::new();
        for part in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| FdbError::invalid_op("malformed key", text.to_string()))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(FdbError::invalid_op("empty keyword in key", text.to_string()));
            }
            key.set(k, v.trim());
        }
        Ok(key)
    }

    /// Appends a pair. Used by schema expansion together with `pop`.
    pub fn push(&mut self, keyword: impl Into<String>, value: impl Into<String>) {
        self.entries.push((keyword.into(), value.into()));
    }

    /// Removes the most recently pushed pair.
    pub fn pop(&mut self, keyword: &str) {
        debug_assert!(
            self.entries.last().is_some_and(|(k, _)| k == keyword),
            "pop of '{keyword}' out of stack order"
        );
        self.entries.pop();
    }

    /// Replaces the value of an existing keyword in place, or appends it.
    pub fn set(&mut self, keyword: impl Into<String>, value: impl Into<String>) {
        let keyword = keyword.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == keyword) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((keyword, value)),
        }
    }

    pub fn unset(&mut self, keyword: &str) {
        self.entries.retain(|(k, _)| k != keyword);
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.get(keyword).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(_, v)| v.as_str())
    }

    /// Values joined with `:`; used for database directory and file names.
    pub fn values_to_string(&self) -> String {
        let mut out = String::new();
        for (i, (_, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(VALUE_SEPARATOR);
            }
            out.push_str(v);
        }
        out
    }

    /// Canonical datum string stored in indexes.
    ///
    /// Values are joined with `:` like `values_to_string`, with `\` and `:`
    /// inside a value escaped by a backslash, so distinct keys never share a
    /// fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        for (i, (_, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(VALUE_SEPARATOR);
            }
            for c in v.chars() {
                if c == VALUE_SEPARATOR || c == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        out
    }

    /// Rebuilds a key from keywords and a fingerprint. Returns `None` when the
    /// value count does not line up.
    pub fn from_fingerprint<'a, I>(keywords: I, fingerprint: &str) -> Option<Key>
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: ExactSizeIterator,
    {
        let keywords = keywords.into_iter();
        let expected = keywords.len();
        let values = if expected == 0 {
            Vec::new()
        } else {
            split_fingerprint(fingerprint)?
        };
        if values.len() != expected {
            return None;
        }
        Some(Key::from_pairs(keywords.zip(values)))
    }

    /// True when every pair of `query` is present with an equal value.
    pub fn partial_match(&self, query: &Key) -> bool {
        query.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// True when every keyword of this key holds a value the request allows.
    /// A keyword the request does not mention is a wildcard.
    pub fn match_request(&self, request: &Request) -> bool {
        self.iter().all(|(k, v)| request.allows(k, v))
    }

    /// Pairs of `self` whose value differs in `other` (or is missing there).
    pub fn differences(&self, other: &Key) -> Key {
        Key::from_pairs(self.iter().filter(|(k, v)| other.get(k) != Some(*v)))
    }

    /// Concatenation of `self` and `other`; `other` wins on shared keywords.
    pub fn merged(&self, other: &Key) -> Key {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.set(k, v);
        }
        out
    }

    pub fn rule(&self) -> Option<RuleRef> {
        self.rule
    }

    pub fn set_rule(&mut self, rule: Option<RuleRef>) {
        self.rule = rule;
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entries.hash(state);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entries.iter().cmp(other.entries.iter())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

impl FromStr for Key {
    type Err = FdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::parse(s)
    }
}
