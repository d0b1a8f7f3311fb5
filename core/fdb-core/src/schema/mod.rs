//! Schema: typed keywords and the three-level rule tree.
//!
//! The schema decides how a user key splits into database, index and datum
//! keys. Expansion walks the rule tree and reports each level to a visitor:
//! - Read side (`expand`): a `Request` may carry several values per keyword
//!   and the walk enumerates every combination, pruning early.
//! - Write side (`expand_key`): a single `Key` drives the walk, and the
//!   visitor's `select_database`/`select_index` only fire when the level key
//!   changes from the previous call.

pub mod parser;
pub mod predicate;
pub mod registry;
pub mod rule;
pub mod types;
pub mod visitor;

pub use predicate::{Matcher, Predicate};
pub use registry::SchemaRegistry;
pub use rule::{LEVELS, Rule, WriteExpansion};
pub use types::{KeywordType, TypeRegistry};
pub use visitor::{ReadVisitor, WriteVisitor, request_values};

use crate::error::{FdbError, FdbResult};
use crate::key::{Key, RuleRef};
use crate::request::Request;
use rule::{ReadState, WriteOutcome, WriteState};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Identity of a schema text: the first 8 bytes of its SHA-256, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId(pub u64);

impl SchemaId {
    pub fn of_text(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        SchemaId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    rules: Vec<Rule>,
    types: TypeRegistry,
    id: SchemaId,
    text: String,
    path: Option<PathBuf>,
}

impl Schema {
    /// Parses schema text. Every top-level rule must be exactly three
    /// levels deep.
    pub fn parse(text: &str) -> FdbResult<Self> {
        let (mut rules, types) = parser::parse(text)?;
        if rules.is_empty() {
            return Err(FdbError::SchemaParse {
                line: 1,
                message: "schema defines no rules".to_string(),
            });
        }
        for rule in &mut rules {
            if !rule.is_balanced(LEVELS) {
                return Err(FdbError::SchemaParse {
                    line: rule.line(),
                    message: format!("rules must nest exactly {LEVELS} levels deep"),
                });
            }
            rule.canonicalise(&types);
        }
        Ok(Self {
            rules,
            types,
            id: SchemaId::of_text(text),
            text: text.to_string(),
            path: None,
        })
    }

    /// Loads and parses a schema file.
    pub fn load(path: &Path) -> FdbResult<Self> {
        let text = fs::read_to_string(path)?;
        let mut schema = Self::parse(&text)?;
        schema.path = Some(path.to_path_buf());
        debug!(path = %path.display(), id = %schema.id, "schema loaded");
        Ok(schema)
    }

    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Same text, hence same identity.
    pub fn compare_to(&self, other: &Schema) -> bool {
        self.id == other.id
    }

    fn rule_ref(&self, index: usize) -> Option<RuleRef> {
        Some(RuleRef {
            schema: self.id,
            rule: index,
        })
    }

    /// Read-side expansion of a multi-valued request.
    pub fn expand(&self, request: &Request, visitor: &mut dyn ReadVisitor) -> FdbResult<()> {
        let mut state = ReadState {
            request,
            types: &self.types,
            keys: Default::default(),
            full: Key::new(),
        };
        for (i, rule) in self.rules.iter().enumerate() {
            state.keys[0].set_rule(self.rule_ref(i));
            state.full.set_rule(self.rule_ref(i));
            rule.expand_read(&mut state, visitor, 0)?;
        }
        Ok(())
    }

    /// Write-side expansion of one key with a fresh memo.
    pub fn expand_key(&self, key: &Key, visitor: &mut dyn WriteVisitor) -> FdbResult<()> {
        let mut memo = WriteExpansion::new();
        self.expand_key_with(key, visitor, &mut memo)
    }

    /// Write-side expansion reusing `memo` from earlier calls.
    ///
    /// The first rule that reaches a datum wins. When none does, the error
    /// names the missing or unused keyword that stopped the walk.
    pub fn expand_key_with(
        &self,
        key: &Key,
        visitor: &mut dyn WriteVisitor,
        memo: &mut WriteExpansion,
    ) -> FdbResult<()> {
        let mut state = WriteState {
            field: key,
            types: &self.types,
            keys: Default::default(),
            full: Key::new(),
            memo,
            outcome: WriteOutcome::default(),
        };
        for (i, rule) in self.rules.iter().enumerate() {
            state.keys[0].set_rule(self.rule_ref(i));
            state.full.set_rule(self.rule_ref(i));
            rule.expand_write(&mut state, visitor, 0)?;
            if state.outcome.archived {
                return Ok(());
            }
        }

        let outcome = state.outcome;
        let reason = if let Some(keyword) = outcome.missing {
            format!("no value for keyword '{keyword}' in key {key}")
        } else if let Some(keyword) = outcome.unused {
            format!("keyword '{keyword}' of key {key} is not used by any rule")
        } else {
            format!("no rule matches key {key}")
        };
        Err(FdbError::SchemaLookup(reason))
    }

    /// First top-level rule whose database level matches `key`.
    pub fn match_first(&self, key: &Key) -> Option<(usize, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(key, &self.types))
    }

    /// Rule reference for a database key built outside the schema.
    pub fn matching_database_rule(&self, key: &Key) -> Option<RuleRef> {
        self.match_first(key).and_then(|(i, _)| self.rule_ref(i))
    }

    /// Rebuilds a datum key from an index entry fingerprint.
    ///
    /// The datum rule is found under the rules matching `db_key` and
    /// `index_key`; its keywords are zipped with the fingerprint values.
    pub fn datum_key(&self, db_key: &Key, index_key: &Key, fingerprint: &str) -> Option<Key> {
        let types = &self.types;
        self.rules
            .iter()
            .filter(|top| top.matches(db_key, types))
            .flat_map(|top| top.rules().iter())
            .filter(|index_rule| index_rule.matches(index_key, types))
            .flat_map(|index_rule| index_rule.rules().iter())
            .find_map(|datum_rule| {
                let keywords: Vec<&str> = datum_rule.keywords(types).collect();
                let key = Key::from_fingerprint(keywords, fingerprint)?;
                datum_rule.matches(&key, types).then_some(key)
            })
    }

    /// Canonical text form: declarations, then rules.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (keyword, ty) in self.types.declarations() {
            out.push_str(&format!("{keyword}: {};\n", ty.name()));
        }
        for rule in &self.rules {
            rule.dump(&mut out, 0);
        }
        out
    }
}
