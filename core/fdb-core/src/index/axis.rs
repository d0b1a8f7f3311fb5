//! Per-index axes: for each datum keyword, the set of values seen.

use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAxis {
    axes: BTreeMap<String, BTreeSet<String>>,
}

impl IndexAxis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every pair of a datum key.
    pub fn insert(&mut self, datum: &Key) {
        for (k, v) in datum.iter() {
            self.axes.entry(k.to_string()).or_default().insert(v.to_string());
        }
    }

    pub fn has(&self, keyword: &str) -> bool {
        self.axes.contains_key(keyword)
    }

    pub fn values(&self, keyword: &str) -> Option<&BTreeSet<String>> {
        self.axes.get(keyword)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> + '_ {
        self.axes.keys().map(String::as_str)
    }

    /// Cheap pre-check: true iff every pair of `datum` is present on the
    /// axes. False positives are possible, false negatives are not.
    pub fn may_contain(&self, datum: &Key) -> bool {
        datum
            .iter()
            .all(|(k, v)| self.axes.get(k).is_some_and(|values| values.contains(v)))
    }

    pub fn merge(&mut self, other: &IndexAxis) {
        for (k, values) in &other.axes {
            self.axes
                .entry(k.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn clear(&mut self) {
        self.axes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn may_contain_is_conservative() {
        let mut axis = IndexAxis::new();
        axis.insert(&Key::from_pairs([("step", "0"), ("param", "t")]));
        axis.insert(&Key::from_pairs([("step", "6"), ("param", "u")]));

        assert!(axis.may_contain(&Key::from_pairs([("step", "0"), ("param", "t")])));
        // cross product of seen values passes even if never archived
        assert!(axis.may_contain(&Key::from_pairs([("step", "6"), ("param", "t")])));
        assert!(!axis.may_contain(&Key::from_pairs([("step", "12"), ("param", "t")])));
        assert!(!axis.may_contain(&Key::from_pairs([("levelist", "1")])));
    }

    #[test]
    fn merge_unions_values() {
        let mut a = IndexAxis::new();
        a.insert(&Key::from_pairs([("step", "0")]));
        let mut b = IndexAxis::new();
        b.insert(&Key::from_pairs([("step", "6"), ("param", "t")]));
        a.merge(&b);
        assert_eq!(a.values("step").unwrap().len(), 2);
        assert!(a.has("param"));
        assert_eq!(a.keywords().collect::<Vec<_>>(), ["param", "step"]);
    }
}
