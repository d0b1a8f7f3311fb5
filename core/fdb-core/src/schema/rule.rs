//! Rule tree and the two expansion walks.
//!
//! A schema holds top-level rules three levels deep: database, index,
//! datum. Expansion walks the predicates of one level, pushing one value at
//! a time onto the level key and the full key, recursing into the next
//! predicate when the value matches, and popping afterwards. When a level's
//! predicates are exhausted the visitor is asked whether to descend.

use super::predicate::Predicate;
use super::types::TypeRegistry;
use super::visitor::{ReadVisitor, WriteVisitor};
use crate::error::{FdbError, FdbResult};
use crate::key::Key;
use crate::request::Request;
use std::fmt::Write as _;

/// Number of key levels: database, index, datum.
pub const LEVELS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    predicates: Vec<Predicate>,
    rules: Vec<Rule>,
    line: usize,
}

/// Mutable walk state of a read expansion.
pub(crate) struct ReadState<'a> {
    pub request: &'a Request,
    pub types: &'a TypeRegistry,
    pub keys: [Key; LEVELS],
    pub full: Key,
}

/// Level 0/1 keys selected by the previous write expansion.
///
/// Reusing one `WriteExpansion` across `Schema::expand_key_with` calls means
/// `select_database` and `select_index` only fire when the key at that level
/// changes.
#[derive(Debug, Clone, Default)]
pub struct WriteExpansion {
    prev: [Option<Key>; 2],
}

impl WriteExpansion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the memo; the next expansion selects again.
    pub fn reset(&mut self) {
        self.prev = [None, None];
    }

    pub fn database(&self) -> Option<&Key> {
        self.prev[0].as_ref()
    }

    pub fn index(&self) -> Option<&Key> {
        self.prev[1].as_ref()
    }
}

/// Why a write expansion did not reach a datum.
#[derive(Debug, Default)]
pub(crate) struct WriteOutcome {
    pub archived: bool,
    pub missing: Option<String>,
    pub unused: Option<String>,
}

/// Mutable walk state of a write expansion.
pub(crate) struct WriteState<'a> {
    pub field: &'a Key,
    pub types: &'a TypeRegistry,
    pub keys: [Key; LEVELS],
    pub full: Key,
    pub memo: &'a mut WriteExpansion,
    pub outcome: WriteOutcome,
}

impl Rule {
    pub fn new(predicates: Vec<Predicate>, rules: Vec<Rule>, line: usize) -> Self {
        Self {
            predicates,
            rules,
            line,
        }
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Source line of the opening bracket.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Levels below and including this rule.
    pub fn depth(&self) -> usize {
        1 + self.rules.iter().map(Rule::depth).max().unwrap_or(0)
    }

    /// True when every branch below this rule is exactly `levels` deep.
    pub fn is_balanced(&self, levels: usize) -> bool {
        match levels {
            0 => false,
            1 => self.rules.is_empty(),
            n => !self.rules.is_empty() && self.rules.iter().all(|r| r.is_balanced(n - 1)),
        }
    }

    /// Keywords this rule contributes to a key, in order.
    pub fn keywords<'a>(&'a self, types: &'a TypeRegistry) -> impl Iterator<Item = &'a str> + 'a {
        self.predicates
            .iter()
            .filter(move |p| !p.is_hidden() && types.lookup(p.keyword()).is_identity())
            .map(Predicate::keyword)
    }

    /// True when `key` holds exactly this rule's keywords and every predicate
    /// accepts it.
    pub fn matches(&self, key: &Key, types: &TypeRegistry) -> bool {
        self.keywords(types).eq(key.keywords())
            && self
                .predicates
                .iter()
                .filter(|p| types.lookup(p.keyword()).is_identity())
                .all(|p| p.matches(key, types))
    }

    pub(crate) fn canonicalise(&mut self, types: &TypeRegistry) {
        for predicate in &mut self.predicates {
            predicate.canonicalise(types);
        }
        for rule in &mut self.rules {
            rule.canonicalise(types);
        }
    }

    fn skips_identity(&self, predicate: &Predicate, types: &TypeRegistry) -> bool {
        predicate.is_hidden() || !types.lookup(predicate.keyword()).is_identity()
    }

    // ════════════════════════════════════════════
    // Read expansion
    // ════════════════════════════════════════════

    pub(crate) fn expand_read(
        &self,
        state: &mut ReadState<'_>,
        visitor: &mut dyn ReadVisitor,
        depth: usize,
    ) -> FdbResult<()> {
        self.expand_read_from(0, state, visitor, depth)
    }

    fn expand_read_from(
        &self,
        pos: usize,
        state: &mut ReadState<'_>,
        visitor: &mut dyn ReadVisitor,
        depth: usize,
    ) -> FdbResult<()> {
        if depth >= LEVELS {
            debug_assert!(false, "expansion below the datum level");
            return Err(too_deep(self.line));
        }

        let Some(predicate) = self.predicates.get(pos) else {
            return self.read_level_complete(state, visitor, depth);
        };
        let keyword = predicate.keyword();

        if self.skips_identity(predicate, state.types) {
            if predicate.is_hidden() && state.request.has(keyword) {
                return Ok(());
            }
            return self.expand_read_from(pos + 1, state, visitor, depth);
        }

        let values = visitor.values(state.request, predicate, state.types, depth);
        for value in values {
            state.keys[depth].push(keyword, value.as_str());
            state.full.push(keyword, value);

            let result = if predicate.matches(&state.keys[depth], state.types) {
                self.expand_read_from(pos + 1, state, visitor, depth)
            } else {
                Ok(())
            };

            state.full.pop(keyword);
            state.keys[depth].pop(keyword);
            result?;
        }
        Ok(())
    }

    fn read_level_complete(
        &self,
        state: &mut ReadState<'_>,
        visitor: &mut dyn ReadVisitor,
        depth: usize,
    ) -> FdbResult<()> {
        if self.rules.is_empty() {
            if depth != LEVELS - 1 {
                return Err(too_shallow(self.line));
            }
            visitor.select_datum(&state.keys[depth], &state.full)?;
            return Ok(());
        }

        let explore = match depth {
            0 => visitor.select_database(&state.keys[0], &state.full)?,
            1 => visitor.select_index(&state.keys[1], &state.full)?,
            _ => return Err(too_deep(self.line)),
        };
        if !explore {
            return Ok(());
        }

        for rule in &self.rules {
            rule.expand_read(state, visitor, depth + 1)?;
        }
        Ok(())
    }

    // ════════════════════════════════════════════
    // Write expansion
    // ════════════════════════════════════════════

    pub(crate) fn expand_write(
        &self,
        state: &mut WriteState<'_>,
        visitor: &mut dyn WriteVisitor,
        depth: usize,
    ) -> FdbResult<()> {
        self.expand_write_from(0, state, visitor, depth)
    }

    fn expand_write_from(
        &self,
        pos: usize,
        state: &mut WriteState<'_>,
        visitor: &mut dyn WriteVisitor,
        depth: usize,
    ) -> FdbResult<()> {
        if depth >= LEVELS {
            debug_assert!(false, "expansion below the datum level");
            return Err(too_deep(self.line));
        }
        if state.outcome.archived {
            return Ok(());
        }

        let Some(predicate) = self.predicates.get(pos) else {
            return self.write_level_complete(state, visitor, depth);
        };
        let keyword = predicate.keyword();
        let field = state.field;

        if self.skips_identity(predicate, state.types) {
            if predicate.is_hidden() && field.contains(keyword) {
                return Ok(());
            }
            return self.expand_write_from(pos + 1, state, visitor, depth);
        }

        let raw = match field.get(keyword).or(predicate.default_value()) {
            Some(raw) => raw,
            None => {
                state.outcome.missing.get_or_insert_with(|| keyword.to_string());
                return Ok(());
            }
        };
        let value = state.types.canonical(keyword, raw).into_owned();

        state.keys[depth].push(keyword, value.as_str());
        state.full.push(keyword, value);

        let result = if predicate.matches(&state.keys[depth], state.types) {
            self.expand_write_from(pos + 1, state, visitor, depth)
        } else {
            Ok(())
        };

        state.full.pop(keyword);
        state.keys[depth].pop(keyword);
        result
    }

    fn write_level_complete(
        &self,
        state: &mut WriteState<'_>,
        visitor: &mut dyn WriteVisitor,
        depth: usize,
    ) -> FdbResult<()> {
        if self.rules.is_empty() {
            if depth != LEVELS - 1 {
                return Err(too_shallow(self.line));
            }
            let types = state.types;
            let full = &state.full;
            if let Some(extra) = state
                .field
                .keywords()
                .find(|k| types.lookup(k).is_identity() && !full.contains(k))
            {
                state.outcome.unused.get_or_insert_with(|| extra.to_string());
                return Ok(());
            }
            if visitor.select_datum(&state.keys[depth], &state.full)? {
                state.outcome.archived = true;
            }
            return Ok(());
        }

        if depth > 1 {
            return Err(too_deep(self.line));
        }
        if state.memo.prev[depth].as_ref() != Some(&state.keys[depth]) {
            let selected = if depth == 0 {
                visitor.select_database(&state.keys[0], &state.full)?
            } else {
                visitor.select_index(&state.keys[1], &state.full)?
            };
            if !selected {
                return Ok(());
            }
            state.memo.prev[depth] = Some(state.keys[depth].clone());
            if depth == 0 {
                // a new database needs its own index selection
                state.memo.prev[1] = None;
            }
        }

        for rule in &self.rules {
            rule.expand_write(state, visitor, depth + 1)?;
            if state.outcome.archived {
                break;
            }
        }
        Ok(())
    }

    // ════════════════════════════════════════════
    // Dump
    // ════════════════════════════════════════════

    pub(crate) fn dump(&self, out: &mut String, indent: usize) {
        let pad = "   ".repeat(indent);
        let _ = write!(out, "{pad}[ ");
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{predicate}");
        }
        if self.rules.is_empty() {
            out.push_str(" ]\n");
            return;
        }
        out.push('\n');
        for rule in &self.rules {
            rule.dump(out, indent + 1);
        }
        let _ = writeln!(out, "{pad}]");
    }
}

fn too_deep(line: usize) -> FdbError {
    FdbError::invalid_op(
        "schema expansion went below the datum level",
        format!("rule at line {line}"),
    )
}

fn too_shallow(line: usize) -> FdbError {
    FdbError::invalid_op(
        "schema rule ended before the datum level",
        format!("rule at line {line}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::predicate::Matcher;
    use crate::schema::types::KeywordType;

    fn leaf(keywords: &[&str]) -> Rule {
        Rule::new(
            keywords.iter().map(|k| Predicate::new(*k, Matcher::Any)).collect(),
            Vec::new(),
            1,
        )
    }

    #[test]
    fn depth_counts_levels() {
        let rule = Rule::new(
            vec![Predicate::new("class", Matcher::Any)],
            vec![Rule::new(
                vec![Predicate::new("type", Matcher::Any)],
                vec![leaf(&["step"])],
                1,
            )],
            1,
        );
        assert_eq!(rule.depth(), 3);
        assert_eq!(leaf(&["a"]).depth(), 1);
    }

    #[test]
    fn matches_requires_exact_keywords() {
        let mut types = TypeRegistry::new();
        types.insert("junk", KeywordType::Ignore);
        let rule = Rule::new(
            vec![
                Predicate::new("step", Matcher::Any),
                Predicate::new("junk", Matcher::Any),
                Predicate::new("param", Matcher::Any),
            ],
            Vec::new(),
            1,
        );
        let key = Key::from_pairs([("step", "6"), ("param", "t")]);
        assert!(rule.matches(&key, &types));
        let reordered = Key::from_pairs([("param", "t"), ("step", "6")]);
        assert!(!rule.matches(&reordered, &types));
    }

    #[test]
    fn dump_nests_levels() {
        let rule = Rule::new(
            vec![Predicate::new("class", Matcher::Values(vec!["od".into()]))],
            vec![Rule::new(
                vec![Predicate::new("type", Matcher::Any)],
                vec![leaf(&["step", "param"])],
                2,
            )],
            1,
        );
        let mut out = String::new();
        rule.dump(&mut out, 0);
        assert_eq!(out, "[ class=od\n   [ type\n      [ step, param ]\n   ]\n]\n");
    }
}
