//! Archiver: routes archived fields to per-database writer sessions.
//!
//! Each incoming key is expanded against the master schema. The expansion
//! memo means a run of keys for the same database and index key opens and
//! selects only once.

use super::EngineContext;
use crate::catalogue::{Catalogue, CatalogueWriter};
use crate::error::{FdbError, FdbResult};
use crate::key::Key;
use crate::schema::{WriteExpansion, WriteVisitor};
use crate::store::{FileStore, Store};
use ahash::AHashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// One open database: its writer catalogue and its data store.
struct Session {
    catalogue: CatalogueWriter,
    store: FileStore,
}

impl Session {
    fn flush(&mut self) -> FdbResult<()> {
        // data first: an INDEX record must never point at unsynced bytes
        self.store.flush()?;
        self.catalogue.flush()
    }

    fn close(&mut self) -> FdbResult<()> {
        self.flush()?;
        self.store.close()?;
        self.catalogue.close()
    }
}

pub struct Archiver {
    context: Arc<EngineContext>,
    sessions: AHashMap<Key, Session>,
    current: Option<Key>,
    memo: WriteExpansion,
    closed_data: Vec<PathBuf>,
}

impl Archiver {
    pub(crate) fn new(context: Arc<EngineContext>) -> Self {
        Self {
            context,
            sessions: AHashMap::new(),
            current: None,
            memo: WriteExpansion::new(),
            closed_data: Vec::new(),
        }
    }

    /// Stores `data` under `key`.
    ///
    /// The overwrite policy is applied before any byte is written, so an
    /// ignored or rejected duplicate leaves nothing behind in the store.
    #[instrument(skip(self, data), fields(key = %key, len = data.len()))]
    pub fn archive(&mut self, key: &Key, data: &[u8]) -> FdbResult<()> {
        let context = &*self.context;
        let mut visitor = ArchiveVisitor {
            context,
            sessions: &mut self.sessions,
            current: self.current.take(),
            data,
        };
        let result = context.schema.expand_key_with(key, &mut visitor, &mut self.memo);
        self.current = visitor.current;
        result
    }

    /// Makes everything archived so far durable and visible to readers.
    pub fn flush(&mut self) -> FdbResult<()> {
        for session in self.sessions.values_mut() {
            session.flush()?;
        }
        Ok(())
    }

    /// Flushes and closes every session.
    pub fn close(&mut self) -> FdbResult<()> {
        let mut first_error = None;
        for (key, mut session) in self.sessions.drain() {
            if let Err(e) = session.close() {
                error!(db = %key, error = %e, "session close failed");
                first_error.get_or_insert(e);
            }
            self.closed_data.extend(session.store.data_paths());
        }
        self.current = None;
        self.memo.reset();
        first_error.map_or(Ok(()), Err)
    }

    /// Masks the segments of `index_key` in the database `db_key`.
    ///
    /// An open session is flushed first so its own segments are masked too.
    pub fn mask_index(&mut self, db_key: &Key, index_key: &Key) -> FdbResult<usize> {
        if let Some(session) = self.sessions.get_mut(db_key) {
            session.flush()?;
            return session.catalogue.mask_index(index_key);
        }
        let directory = self
            .context
            .roots
            .existing_database(db_key)?
            .ok_or_else(|| FdbError::invalid_op("database not found", db_key.to_string()))?;
        let mut writer = self.context.open_writer(&directory, db_key)?;
        let masked = writer.mask_index(index_key)?;
        writer.close()?;
        Ok(masked)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Database key of the session the last archive went to.
    pub fn current_database(&self) -> Option<&Key> {
        self.current.as_ref()
    }

    /// Data files written through this archiver, open or closed.
    pub fn data_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .sessions
            .values()
            .flat_map(|s| s.store.data_paths())
            .chain(self.closed_data.iter().cloned())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

impl Drop for Archiver {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "archiver close failed");
        }
    }
}

/// Write visitor of one archive call.
struct ArchiveVisitor<'a> {
    context: &'a EngineContext,
    sessions: &'a mut AHashMap<Key, Session>,
    current: Option<Key>,
    data: &'a [u8],
}

impl ArchiveVisitor<'_> {
    fn session(&mut self) -> FdbResult<&mut Session> {
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| FdbError::invalid_op("no database selected", "archive"))?;
        self.sessions
            .get_mut(current)
            .ok_or_else(|| FdbError::invalid_op("database session is not open", current.to_string()))
    }
}

impl WriteVisitor for ArchiveVisitor<'_> {
    fn select_database(&mut self, key: &Key, _full: &Key) -> FdbResult<bool> {
        if !self.sessions.contains_key(key) {
            let directory = self.context.roots.directory(key)?;
            let catalogue = self.context.open_writer(&directory, key)?;
            let store = FileStore::new(&directory, self.context.config.data_block_size);
            debug!(db = %key, dir = %directory.display(), "archive session opened");
            self.sessions.insert(key.clone(), Session { catalogue, store });
        }
        self.current = Some(key.clone());
        Ok(true)
    }

    fn select_index(&mut self, key: &Key, _full: &Key) -> FdbResult<bool> {
        self.session()?.catalogue.select_index(key)
    }

    fn select_datum(&mut self, key: &Key, _full: &Key) -> FdbResult<bool> {
        let data = self.data;
        let session = self.session()?;
        if !session.catalogue.check_overwrite(key)? {
            return Ok(true);
        }
        let index_key = session
            .catalogue
            .current_index()
            .cloned()
            .ok_or_else(|| FdbError::invalid_op("no index selected", key.to_string()))?;
        let location = session.store.archive(&index_key, data)?;
        session.catalogue.insert(key, location)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FdbConfig;
    use crate::engine::tests::context;
    use tempfile::tempdir;

    fn key(expver: &str, step: &str) -> Key {
        Key::from_pairs([
            ("class", "od"),
            ("expver", expver),
            ("type", "fc"),
            ("levtype", "sfc"),
            ("step", step),
            ("param", "t"),
        ])
    }

    #[test]
    fn one_session_per_database() {
        let dir = tempdir().unwrap();
        let mut archiver = Archiver::new(context(dir.path(), FdbConfig::default()));
        archiver.archive(&key("0001", "0"), b"a").unwrap();
        archiver.archive(&key("0001", "6"), b"b").unwrap();
        archiver.archive(&key("0002", "0"), b"c").unwrap();
        assert_eq!(archiver.session_count(), 2);
        assert_eq!(archiver.data_paths().len(), 2);

        archiver.close().unwrap();
        assert_eq!(archiver.session_count(), 0);
        assert!(dir.path().join("root/od:0001/toc").is_file());
        assert!(dir.path().join("root/od:0002/toc").is_file());
    }

    #[test]
    fn incomplete_key_names_missing_keyword() {
        let dir = tempdir().unwrap();
        let mut archiver = Archiver::new(context(dir.path(), FdbConfig::default()));
        let mut incomplete = key("0001", "0");
        incomplete.unset("param");
        let err = archiver.archive(&incomplete, b"x").unwrap_err();
        match err {
            FdbError::SchemaLookup(msg) => assert!(msg.contains("param")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ignored_duplicate_writes_no_bytes() {
        let dir = tempdir().unwrap();
        let config = FdbConfig {
            overwrite_policy: crate::config::OverwritePolicy::Ignore,
            ..FdbConfig::default()
        };
        let mut archiver = Archiver::new(context(dir.path(), config));
        archiver.archive(&key("0001", "0"), b"first").unwrap();
        archiver.archive(&key("0001", "0"), b"second").unwrap();
        archiver.flush().unwrap();
        let paths = archiver.data_paths();
        assert_eq!(std::fs::metadata(&paths[0]).unwrap().len(), 5);
    }
}
