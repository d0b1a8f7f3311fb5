//! Process-wide cache of parsed schemas, keyed by file path.
//!
//! Every database directory carries its own copy of the schema it was created
//! with. Readers and writers of the same database share one parsed `Schema`
//! through this cache.

use super::Schema;
use crate::error::FdbResult;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<PathBuf, Arc<Schema>>,
}

static GLOBAL: OnceLock<Arc<SchemaRegistry>> = OnceLock::new();

impl SchemaRegistry {
    /// Private registry, mostly for tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily created process-wide registry.
    pub fn global() -> Arc<SchemaRegistry> {
        GLOBAL.get_or_init(|| Arc::new(SchemaRegistry::new())).clone()
    }

    /// Cached schema for `path`, parsing the file on first use.
    pub fn get(&self, path: &Path) -> FdbResult<Arc<Schema>> {
        if let Some(schema) = self.schemas.get(path) {
            return Ok(schema.clone());
        }
        let schema = Arc::new(Schema::load(path)?);
        debug!(path = %path.display(), "schema cached");
        // a concurrent loader may have won; keep whichever landed first
        let entry = self
            .schemas
            .entry(path.to_path_buf())
            .or_insert(schema);
        Ok(entry.value().clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.schemas.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Drops every cached schema.
    pub fn clear(&self) {
        self.schemas.clear();
    }
}
