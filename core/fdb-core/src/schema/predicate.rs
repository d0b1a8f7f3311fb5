//! Rule predicates: a keyword plus a matcher.

use super::types::TypeRegistry;
use crate::key::Key;
use std::fmt;

/// How a predicate accepts the value of its keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// `keyword`: any value, but the keyword must be present
    Any,
    /// `keyword=a/b`: one of the listed values (canonicalised at load)
    Values(Vec<String>),
    /// `keyword?default`: absent keywords take the default
    Optional(String),
    /// `-keyword`: matches only when absent
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    keyword: String,
    matcher: Matcher,
}

impl Predicate {
    pub fn new(keyword: impl Into<String>, matcher: Matcher) -> Self {
        Self {
            keyword: keyword.into(),
            matcher,
        }
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn is_optional(&self) -> bool {
        matches!(self.matcher, Matcher::Optional(_))
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self.matcher, Matcher::Hidden)
    }

    pub fn default_value(&self) -> Option<&str> {
        match &self.matcher {
            Matcher::Optional(default) => Some(default),
            _ => None,
        }
    }

    /// Whether the value the key holds for this keyword is acceptable.
    /// Matching is done on canonical values; the key is not mutated.
    pub fn matches(&self, key: &Key, types: &TypeRegistry) -> bool {
        let value = key.get(&self.keyword);
        match (&self.matcher, value) {
            (Matcher::Hidden, value) => value.is_none(),
            (Matcher::Optional(_), _) => true,
            (Matcher::Any, value) => value.is_some(),
            (Matcher::Values(_), None) => false,
            (Matcher::Values(values), Some(v)) => self.accepts(v, values, types),
        }
    }

    /// Whether a single value passes this predicate.
    pub fn matches_value(&self, value: &str, types: &TypeRegistry) -> bool {
        match &self.matcher {
            Matcher::Hidden => false,
            Matcher::Any | Matcher::Optional(_) => true,
            Matcher::Values(values) => self.accepts(value, values, types),
        }
    }

    fn accepts(&self, value: &str, values: &[String], types: &TypeRegistry) -> bool {
        let canonical = types.canonical(&self.keyword, value);
        values.iter().any(|v| *v == canonical)
    }

    /// Rewrites listed values into their canonical form.
    pub(crate) fn canonicalise(&mut self, types: &TypeRegistry) {
        if let Matcher::Values(values) = &mut self.matcher {
            for value in values.iter_mut() {
                let canonical = types.canonical(&self.keyword, value.as_str()).into_owned();
                *value = canonical;
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::Any => f.write_str(&self.keyword),
            Matcher::Values(values) => write!(f, "{}={}", self.keyword, values.join("/")),
            Matcher::Optional(default) if default.is_empty() => write!(f, "{}?", self.keyword),
            Matcher::Optional(default) => write!(f, "{}?{default}", self.keyword),
            Matcher::Hidden => write!(f, "-{}", self.keyword),
        }
    }
}
