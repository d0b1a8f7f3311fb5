//! Engine: the archive/retrieve front end over catalogues and stores.
//!
//! # Architecture
//!
//! - **Archiver**: write expansion of each key, one writer session per
//!   database
//! - **Retriever**: read expansion of a request, one reader per database,
//!   failures collected per database
//! - **Fdb**: the facade that owns both, plus listing, statistics and the
//!   enumeration of database files

pub mod archiver;
pub mod constructors;
pub mod fdb;
pub mod retriever;
pub mod stats;

pub use archiver::Archiver;
pub use fdb::Fdb;
pub use retriever::{RetrieveFailure, RetrieveResult, RetrievedField, Retriever};
pub use stats::FdbStats;

use crate::catalogue::{CatalogueReader, CatalogueWriter, RootManager};
use crate::config::FdbConfig;
use crate::error::FdbResult;
use crate::index::KvRegistry;
use crate::key::Key;
use crate::schema::{Schema, SchemaRegistry};
use std::path::Path;
use std::sync::Arc;

/// Everything a session needs to open a catalogue, shared by the archiver,
/// the retriever and the facade.
pub(crate) struct EngineContext {
    pub config: FdbConfig,
    /// Master schema
    pub schema: Arc<Schema>,
    pub schemas: Arc<SchemaRegistry>,
    pub kv: Arc<KvRegistry>,
    pub roots: RootManager,
}

impl EngineContext {
    pub fn new(
        config: FdbConfig,
        schemas: Arc<SchemaRegistry>,
        kv: Arc<KvRegistry>,
    ) -> FdbResult<Self> {
        config.validate()?;
        let schema_path = config.expand_path(&config.schema_path.to_string_lossy());
        let schema = schemas.get(&schema_path)?;
        let roots = RootManager::new(&config);
        Ok(Self {
            config,
            schema,
            schemas,
            kv,
            roots,
        })
    }

    pub fn open_writer(&self, directory: &Path, key: &Key) -> FdbResult<CatalogueWriter> {
        CatalogueWriter::open(
            directory,
            key,
            &self.schema,
            &self.config,
            &self.schemas,
            self.kv.clone(),
        )
    }

    pub fn open_reader(&self, directory: &Path, key: &Key) -> FdbResult<Option<CatalogueReader>> {
        CatalogueReader::open(directory, key, &self.config, &self.schemas, self.kv.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RootConfig;
    use std::fs;

    pub(crate) const SCHEMA: &str = "[ class, expver [ type, levtype [ step, param ]]]";

    /// Context rooted at `<dir>/root` with the test schema at `<dir>/schema`.
    pub(crate) fn context(dir: &Path, config: FdbConfig) -> Arc<EngineContext> {
        let schema_path = dir.join("schema");
        fs::write(&schema_path, SCHEMA).unwrap();
        let config = FdbConfig {
            roots: vec![RootConfig::new(dir.join("root"))],
            schema_path,
            ..config
        };
        Arc::new(
            EngineContext::new(config, Arc::new(SchemaRegistry::new()), Arc::new(KvRegistry::new()))
                .unwrap(),
        )
    }

    #[test]
    fn missing_master_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = FdbConfig::with_root(dir.path(), dir.path().join("nope"));
        let result = EngineContext::new(
            config,
            Arc::new(SchemaRegistry::new()),
            Arc::new(KvRegistry::new()),
        );
        assert!(result.is_err());
    }
}
