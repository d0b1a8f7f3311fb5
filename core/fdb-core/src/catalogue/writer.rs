//! CatalogueWriter: the append side of one database.
//!
//! State machine per session:
//!
//! 1. `open` writes INIT when the database is new.
//! 2. `select_index` creates (once) and locks an index for the index key.
//! 3. `archive` puts into the current index and marks the session dirty.
//! 4. `flush` persists every dirty index, announces it with an INDEX record
//!    and reopens it, so each flush cycle leaves one immutable segment.
//! 5. `close` flushes, closes every index and, with sub-logs, appends the
//!    session's full indexes plus a CLEAR of its sub-log to the master log.

use super::{Catalogue, CatalogueMode, load_schema};
use crate::config::{EngineKind, FdbConfig, OverwritePolicy};
use crate::error::{FdbError, FdbResult};
use crate::index::{Field, FieldLocation, Index, IndexBackendKind, IndexContext, KvRegistry};
use crate::key::Key;
use crate::schema::{Schema, SchemaRegistry};
use crate::toc::{ClearTarget, TocHandler, TocOptions, TocPayload};
use ahash::{AHashMap, AHashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Indexes of one index key within a session.
struct IndexSlot {
    /// Current segment; reopened after each flush
    index: Index,
    /// Everything archived this session, announced at close when sub-logs
    /// are in use
    full: Option<Index>,
    /// Fingerprints archived this session
    archived: AHashSet<String>,
}

pub struct CatalogueWriter {
    key: Key,
    schema: Arc<Schema>,
    toc: TocHandler,
    context: IndexContext,
    engine: EngineKind,
    policy: OverwritePolicy,
    indexes: AHashMap<Key, IndexSlot>,
    current: Option<Key>,
    dirty: bool,
    closed: bool,
}

impl CatalogueWriter {
    /// 데이터베이스를 쓰기 모드로 엽니다.
    ///
    /// 새 데이터베이스이면 디렉토리와 INIT 레코드를 만들고 마스터 스키마를
    /// 복사합니다. 소유자가 아니면 아무것도 바꾸기 전에 거부합니다.
    #[instrument(skip(master, config, schemas, kv), fields(key = %key))]
    pub fn open(
        directory: &Path,
        key: &Key,
        master: &Schema,
        config: &FdbConfig,
        schemas: &SchemaRegistry,
        kv: Arc<KvRegistry>,
    ) -> FdbResult<Self> {
        let toc = TocHandler::new(directory, key, TocOptions::from_config(config));
        toc.check_uid()?;
        if !toc.exists() {
            toc.write_init_record(master)?;
        }
        let schema = load_schema(&toc, key, schemas, CatalogueMode::Writer)?;
        info!(db = %directory.display(), "catalogue writer opened");

        Ok(Self {
            key: key.clone(),
            schema,
            toc,
            context: IndexContext::new(directory, kv),
            engine: config.engine,
            policy: config.overwrite_policy,
            indexes: AHashMap::new(),
            current: None,
            dirty: false,
            closed: false,
        })
    }

    pub fn toc(&self) -> &TocHandler {
        &self.toc
    }

    pub fn policy(&self) -> OverwritePolicy {
        self.policy
    }

    /// Index key currently selected.
    pub fn current_index(&self) -> Option<&Key> {
        self.current.as_ref()
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    fn backend(&self) -> IndexBackendKind {
        IndexBackendKind::for_engine(self.engine)
    }

    fn create_index(&self, key: &Key) -> FdbResult<Index> {
        let mut index = Index::create(&self.context, self.backend(), key)?;
        index.flock()?;
        Ok(index)
    }

    fn current_slot(&mut self, datum: &Key) -> FdbResult<&mut IndexSlot> {
        let current = self.current.as_ref().ok_or_else(|| {
            FdbError::invalid_op("archive without a selected index", datum.to_string())
        })?;
        self.indexes
            .get_mut(current)
            .ok_or_else(|| FdbError::invalid_op("selected index is not open", current.to_string()))
    }

    /// Applies the overwrite policy to `datum` in the current index.
    ///
    /// Returns `false` when the write must be skipped (`ignore`), and
    /// `DuplicateEntry` under `fail`. Runs before any bytes are stored.
    pub fn check_overwrite(&self, datum: &Key) -> FdbResult<bool> {
        let Some(slot) = self.current.as_ref().and_then(|k| self.indexes.get(k)) else {
            return Ok(true);
        };
        let fingerprint = datum.fingerprint();
        if !slot.archived.contains(&fingerprint) && !slot.index.exists(datum)? {
            return Ok(true);
        }

        match self.policy {
            OverwritePolicy::Ignore => {
                debug!(datum = %datum, "duplicate ignored");
                Ok(false)
            }
            OverwritePolicy::Warn => {
                warn!(db = %self.key, datum = %datum, "overwriting existing field");
                Ok(true)
            }
            OverwritePolicy::Fail => Err(FdbError::DuplicateEntry {
                key: format!("{}{}", self.key, datum),
            }),
        }
    }

    /// Puts a field into the current index without consulting the policy.
    pub(crate) fn insert(&mut self, datum: &Key, location: FieldLocation) -> FdbResult<()> {
        let field = Field::new(location);
        let slot = self.current_slot(datum)?;
        slot.index.put(datum, &field)?;
        if let Some(full) = &mut slot.full {
            full.put(datum, &field)?;
        }
        slot.archived.insert(datum.fingerprint());
        self.dirty = true;
        Ok(())
    }

    /// Masks every live segment of `index_key`. Returns how many.
    pub fn mask_index(&mut self, index_key: &Key) -> FdbResult<usize> {
        let entries = self.toc.load_indexes()?;
        let mut masked = 0;
        for entry in entries.iter().filter(|e| e.key() == index_key) {
            self.toc.write_clear_record(entry.clear_target())?;
            masked += 1;
        }
        info!(db = %self.key, index = %index_key, masked, "index masked");
        Ok(masked)
    }

    /// Flushes the full indexes and builds the block that replaces this
    /// session's sub-log in the master log.
    fn compaction_block(&mut self) -> FdbResult<Vec<TocPayload>> {
        let Some(sub_toc) = self.toc.sub_toc().map(Path::to_path_buf) else {
            return Ok(Vec::new());
        };
        let mut block = Vec::new();
        for slot in self.indexes.values_mut() {
            if let Some(full) = &mut slot.full
                && let Some(descriptor) = full.flush(&self.context)?
            {
                block.push(TocPayload::Index(descriptor));
            }
        }
        block.push(TocPayload::Clear(ClearTarget::SubToc { path: sub_toc }));
        Ok(block)
    }
}

impl Catalogue for CatalogueWriter {
    fn key(&self) -> &Key {
        &self.key
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn mode(&self) -> CatalogueMode {
        CatalogueMode::Writer
    }

    fn engine(&self) -> EngineKind {
        self.engine
    }

    fn directory(&self) -> &Path {
        self.context.directory()
    }

    fn exists(&self) -> bool {
        self.toc.exists()
    }

    fn select_index(&mut self, key: &Key) -> FdbResult<bool> {
        if !self.indexes.contains_key(key) {
            let index = self.create_index(key)?;
            let full = if self.toc.options().use_sub_toc {
                Some(self.create_index(key)?)
            } else {
                None
            };
            debug!(index = %key, location = %index.location(), "index created");
            self.indexes.insert(
                key.clone(),
                IndexSlot {
                    index,
                    full,
                    archived: AHashSet::new(),
                },
            );
        }
        self.current = Some(key.clone());
        Ok(true)
    }

    fn deselect_index(&mut self) {
        self.current = None;
    }

    fn archive(&mut self, datum: &Key, location: FieldLocation) -> FdbResult<()> {
        if self.closed {
            return Err(FdbError::invalid_op("archive after close", self.key.to_string()));
        }
        if self.check_overwrite(datum)? {
            self.insert(datum, location)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> FdbResult<()> {
        if !self.dirty {
            return Ok(());
        }
        for slot in self.indexes.values_mut() {
            if let Some(descriptor) = slot.index.flush(&self.context)? {
                self.toc.write_index_record(descriptor)?;
                slot.index.reopen()?;
            }
        }
        self.dirty = false;
        debug!(db = %self.key, "catalogue flushed");
        Ok(())
    }

    fn close(&mut self) -> FdbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        Catalogue::flush(self)?;
        let block = self.compaction_block()?;

        for slot in self.indexes.values_mut() {
            slot.index.close()?;
            if let Some(full) = &mut slot.full {
                full.close()?;
            }
        }
        self.indexes.clear();
        self.current = None;

        if !block.is_empty() {
            self.toc.append_block(block)?;
        }
        info!(db = %self.key, "catalogue writer closed");
        Ok(())
    }

    fn metadata_paths(&self) -> FdbResult<Vec<PathBuf>> {
        self.toc.metadata_paths()
    }
}

impl Drop for CatalogueWriter {
    fn drop(&mut self) {
        if let Err(e) = Catalogue::close(self) {
            error!(db = %self.key, error = %e, "catalogue writer close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Operation;
    use crate::schema::{WriteExpansion, WriteVisitor};
    use tempfile::tempdir;

    const SCHEMA: &str = "[ class, expver [ type, levtype [ step, param ]]]";

    fn db_key() -> Key {
        Key::from_pairs([("class", "od"), ("expver", "0001")])
    }

    fn index_key() -> Key {
        Key::from_pairs([("type", "fc"), ("levtype", "sfc")])
    }

    fn datum(step: &str) -> Key {
        Key::from_pairs([("step", step), ("param", "t")])
    }

    fn open(dir: &Path, config: &FdbConfig) -> CatalogueWriter {
        let master = Schema::parse(SCHEMA).unwrap();
        CatalogueWriter::open(
            dir,
            &db_key(),
            &master,
            config,
            &SchemaRegistry::new(),
            Arc::new(KvRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn flush_announces_one_segment_per_cycle() {
        let dir = tempdir().unwrap();
        let config = FdbConfig::default();
        let mut writer = open(dir.path(), &config);

        writer.select_index(&index_key()).unwrap();
        writer.archive(&datum("0"), FieldLocation::file("/d", 0, 1)).unwrap();
        writer.flush().unwrap();
        writer.flush().unwrap();
        writer.archive(&datum("6"), FieldLocation::file("/d", 1, 1)).unwrap();
        writer.close().unwrap();

        let entries = writer.toc().load_indexes().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.key() == &index_key()));
    }

    #[test]
    fn archive_requires_selected_index() {
        let dir = tempdir().unwrap();
        let mut writer = open(dir.path(), &FdbConfig::default());
        let err = writer
            .archive(&datum("0"), FieldLocation::file("/d", 0, 1))
            .unwrap_err();
        assert!(matches!(err, FdbError::InvalidOperation { .. }));
    }

    #[test]
    fn reader_operations_are_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = open(dir.path(), &FdbConfig::default());
        assert!(matches!(
            writer.retrieve(&datum("0")),
            Err(FdbError::NotImplemented(_))
        ));
        assert!(writer.axis("step").is_err());
        assert!(writer.capabilities().check(Operation::Archive).is_ok());
    }

    #[test]
    fn overwrite_policies() {
        let dir = tempdir().unwrap();

        let mut config = FdbConfig::default();
        config.overwrite_policy = OverwritePolicy::Fail;
        let mut writer = open(&dir.path().join("fail"), &config);
        writer.select_index(&index_key()).unwrap();
        writer.archive(&datum("0"), FieldLocation::file("/d", 0, 1)).unwrap();
        let err = writer
            .archive(&datum("0"), FieldLocation::file("/d", 1, 1))
            .unwrap_err();
        assert!(matches!(err, FdbError::DuplicateEntry { .. }));
        // the session survives the rejected call
        writer.archive(&datum("6"), FieldLocation::file("/d", 2, 1)).unwrap();

        config.overwrite_policy = OverwritePolicy::Ignore;
        let mut writer = open(&dir.path().join("ignore"), &config);
        writer.select_index(&index_key()).unwrap();
        writer.archive(&datum("0"), FieldLocation::file("/d", 0, 1)).unwrap();
        assert!(!writer.check_overwrite(&datum("0")).unwrap());

        config.overwrite_policy = OverwritePolicy::Warn;
        let mut writer = open(&dir.path().join("warn"), &config);
        writer.select_index(&index_key()).unwrap();
        writer.archive(&datum("0"), FieldLocation::file("/d", 0, 1)).unwrap();
        writer.flush().unwrap();
        // still detected after the segment was flushed and reopened
        assert!(writer.check_overwrite(&datum("0")).unwrap());
    }

    #[test]
    fn sub_toc_is_compacted_at_close() {
        let dir = tempdir().unwrap();
        let mut config = FdbConfig::default();
        config.use_sub_toc = true;
        let mut writer = open(dir.path(), &config);

        writer.select_index(&index_key()).unwrap();
        writer.archive(&datum("0"), FieldLocation::file("/d", 0, 1)).unwrap();
        writer.flush().unwrap();
        writer.archive(&datum("6"), FieldLocation::file("/d", 1, 1)).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.toc().load_indexes().unwrap().len(), 2);
        writer.close().unwrap();

        // one full index in the master log replaces the two sub-log segments
        let entries = writer.toc().load_indexes().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].in_sub_toc);
        assert_eq!(entries[0].descriptor.axes.values("step").unwrap().len(), 2);

        let master = writer.toc().records(writer.toc().toc_path()).unwrap();
        assert!(matches!(
            master.last().unwrap().payload,
            TocPayload::Clear(ClearTarget::SubToc { .. })
        ));
    }

    #[test]
    fn mask_index_hides_segments() {
        let dir = tempdir().unwrap();
        let mut writer = open(dir.path(), &FdbConfig::default());
        writer.select_index(&index_key()).unwrap();
        writer.archive(&datum("0"), FieldLocation::file("/d", 0, 1)).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.mask_index(&index_key()).unwrap(), 1);
        assert!(writer.toc().load_indexes().unwrap().is_empty());
    }

    struct DatabaseOnly(Option<Key>);

    impl WriteVisitor for DatabaseOnly {
        fn select_database(&mut self, key: &Key, _full: &Key) -> FdbResult<bool> {
            self.0 = Some(key.clone());
            Ok(false)
        }
        fn select_index(&mut self, _key: &Key, _full: &Key) -> FdbResult<bool> {
            Ok(false)
        }
        fn select_datum(&mut self, _key: &Key, _full: &Key) -> FdbResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn key_from_another_schema_is_a_mismatch() {
        let dir = tempdir().unwrap();
        drop(open(dir.path(), &FdbConfig::default()));

        // same keywords, different schema text
        let other = Schema::parse("[ class, expver [ type, levtype [ step, param, levelist? ]]]").unwrap();
        let mut capture = DatabaseOnly(None);
        let full = Key::from_pairs([
            ("class", "od"),
            ("expver", "0001"),
            ("type", "fc"),
            ("levtype", "sfc"),
            ("step", "0"),
            ("param", "t"),
        ]);
        let _ = other.expand_key_with(&full, &mut capture, &mut WriteExpansion::new());
        let key = capture.0.unwrap();

        let err = CatalogueWriter::open(
            dir.path(),
            &key,
            &other,
            &FdbConfig::default(),
            &SchemaRegistry::new(),
            Arc::new(KvRegistry::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, FdbError::SchemaMismatch { .. }));
    }
}
