//! Catalogues: one database's key, schema, log and indexes.
//!
//! A catalogue is opened per session either as a [`CatalogueWriter`]
//! (append) or a [`CatalogueReader`] (replay). Both implement
//! [`Catalogue`]; what each variant may do is fixed by [`Capabilities`] and
//! checked before any work is done.

pub mod reader;
pub mod root;
pub mod stats;
pub mod visitor;
pub mod writer;

pub use reader::CatalogueReader;
pub use root::{DatabaseLocation, RootManager};
pub use stats::{DbStats, StatsVisitor};
pub use visitor::{EntryVisitor, ListElement, ListVisitor};
pub use writer::CatalogueWriter;

use crate::config::EngineKind;
use crate::error::{FdbError, FdbResult};
use crate::index::{Field, FieldLocation};
use crate::key::Key;
use crate::schema::{Schema, SchemaRegistry};
use crate::toc::TocHandler;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogueMode {
    Reader,
    Writer,
}

impl CatalogueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogueMode::Reader => "reader",
            CatalogueMode::Writer => "writer",
        }
    }
}

impl fmt::Display for CatalogueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations gated by the catalogue mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Archive,
    Flush,
    MaskIndex,
    Retrieve,
    Axis,
    VisitEntries,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Archive => "archive",
            Operation::Flush => "flush",
            Operation::MaskIndex => "mask index",
            Operation::Retrieve => "retrieve",
            Operation::Axis => "axis",
            Operation::VisitEntries => "visit entries",
        }
    }
}

/// What a catalogue variant supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    mode: CatalogueMode,
}

impl Capabilities {
    pub fn of(mode: CatalogueMode) -> Self {
        Self { mode }
    }

    pub fn allows(&self, op: Operation) -> bool {
        use Operation::*;
        match self.mode {
            CatalogueMode::Writer => matches!(op, Archive | Flush | MaskIndex),
            CatalogueMode::Reader => matches!(op, Retrieve | Axis | VisitEntries | Flush),
        }
    }

    pub fn check(&self, op: Operation) -> FdbResult<()> {
        if self.allows(op) {
            Ok(())
        } else {
            Err(unsupported(self.mode, op))
        }
    }
}

pub fn unsupported(mode: CatalogueMode, op: Operation) -> FdbError {
    FdbError::NotImplemented(format!("{} on a catalogue {mode}", op.as_str()))
}

/// Catalogue interface shared by readers and writers.
///
/// Operations a variant does not support return `NotImplemented` without
/// touching any state.
pub trait Catalogue {
    fn key(&self) -> &Key;

    fn schema(&self) -> &Schema;

    fn mode(&self) -> CatalogueMode;

    fn engine(&self) -> EngineKind;

    fn directory(&self) -> &Path;

    fn capabilities(&self) -> Capabilities {
        Capabilities::of(self.mode())
    }

    fn exists(&self) -> bool;

    /// Makes `key` the current index. Returns `false` when a reader holds no
    /// segment for it.
    fn select_index(&mut self, key: &Key) -> FdbResult<bool>;

    fn deselect_index(&mut self);

    fn archive(&mut self, datum: &Key, location: FieldLocation) -> FdbResult<()> {
        let _ = (datum, location);
        Err(unsupported(self.mode(), Operation::Archive))
    }

    fn retrieve(&mut self, datum: &Key) -> FdbResult<Option<Field>> {
        let _ = datum;
        Err(unsupported(self.mode(), Operation::Retrieve))
    }

    fn axis(&self, keyword: &str) -> FdbResult<Option<BTreeSet<String>>> {
        let _ = keyword;
        Err(unsupported(self.mode(), Operation::Axis))
    }

    fn visit_entries(&mut self, visitor: &mut dyn EntryVisitor) -> FdbResult<()> {
        let _ = visitor;
        Err(unsupported(self.mode(), Operation::VisitEntries))
    }

    fn flush(&mut self) -> FdbResult<()>;

    fn close(&mut self) -> FdbResult<()>;

    fn metadata_paths(&self) -> FdbResult<Vec<PathBuf>>;
}

/// Loads the database's own schema and checks the key against it.
///
/// Writers also require the key to come from that very schema: a key built
/// from a different schema text is a mismatch even when its keywords fit.
pub(crate) fn load_schema(
    toc: &TocHandler,
    key: &Key,
    schemas: &SchemaRegistry,
    mode: CatalogueMode,
) -> FdbResult<Arc<Schema>> {
    let schema = schemas.get(toc.schema_path())?;
    let mismatch = || FdbError::SchemaMismatch {
        key: key.to_string(),
        database: toc.directory().display().to_string(),
    };

    if schema.matching_database_rule(key).is_none() {
        return Err(mismatch());
    }
    if mode == CatalogueMode::Writer
        && let Some(rule) = key.rule()
        && rule.schema != schema.id()
    {
        return Err(mismatch());
    }
    Ok(schema)
}
