//! CatalogueReader: the replay side of one database.
//!
//! Opening replays the log once. Index segments are materialised lazily,
//! after the axes pre-check passed, and kept in a bounded LRU cache.

use super::stats::{DbStats, StatsVisitor};
use super::visitor::EntryVisitor;
use super::{Catalogue, CatalogueMode, load_schema};
use crate::config::{EngineKind, FdbConfig};
use crate::error::{FdbError, FdbResult};
use crate::index::{Field, Index, IndexContext, KvRegistry};
use crate::key::Key;
use crate::schema::{Schema, SchemaRegistry};
use crate::toc::{IndexEntry, TocHandler, TocOptions};
use lru::LruCache;
use std::collections::BTreeSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub struct CatalogueReader {
    key: Key,
    schema: Arc<Schema>,
    toc: TocHandler,
    context: IndexContext,
    engine: EngineKind,
    /// Live segments, newest first
    entries: Vec<IndexEntry>,
    /// Positions in `entries` matching the current index key
    selected: Vec<usize>,
    current: Option<Key>,
    /// Materialised segments by position in `entries`
    cache: LruCache<usize, Index>,
    hits: u64,
    misses: u64,
}

impl CatalogueReader {
    /// 기존 데이터베이스를 읽기 모드로 엽니다.
    ///
    /// 로그 전체를 한 번 재생해 살아있는 인덱스 세그먼트 목록을 만듭니다.
    /// 데이터베이스가 없으면 `Ok(None)`을 돌려줍니다.
    #[instrument(skip(config, schemas, kv), fields(key = %key))]
    pub fn open(
        directory: &Path,
        key: &Key,
        config: &FdbConfig,
        schemas: &SchemaRegistry,
        kv: Arc<KvRegistry>,
    ) -> FdbResult<Option<Self>> {
        let toc = TocHandler::new(directory, key, TocOptions::from_config(config));
        if !toc.exists() {
            return Ok(None);
        }
        let schema = load_schema(&toc, key, schemas, CatalogueMode::Reader)?;
        let entries = toc.load_indexes()?;
        let capacity = NonZeroUsize::new(config.reader_open_index_limit).unwrap_or(NonZeroUsize::MIN);
        debug!(db = %directory.display(), indexes = entries.len(), "catalogue reader opened");

        Ok(Some(Self {
            key: key.clone(),
            schema,
            toc,
            context: IndexContext::new(directory, kv),
            engine: config.engine,
            entries,
            selected: Vec::new(),
            current: None,
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }))
    }

    pub fn toc(&self) -> &TocHandler {
        &self.toc
    }

    /// Live segments, newest first.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Segments matching the current index key, newest first.
    pub fn selected(&self) -> impl Iterator<Item = &IndexEntry> + '_ {
        self.selected.iter().map(|pos| &self.entries[*pos])
    }

    /// Distinct index keys of the live segments.
    pub fn index_keys(&self) -> BTreeSet<Key> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// (hits, misses) of the segment cache.
    pub fn cache_counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn materialise(&mut self, pos: usize) -> FdbResult<&Index> {
        if self.cache.contains(&pos) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let index = Index::open(&self.context, &self.entries[pos].descriptor)?;
            self.cache.put(pos, index);
        }
        self.cache
            .get(&pos)
            .ok_or_else(|| FdbError::invalid_op("index segment evicted while in use", pos.to_string()))
    }

    /// Values of `keyword` across index keys and axes.
    ///
    /// With `selected_only`, only the segments of the current index key are
    /// consulted; otherwise every live segment is.
    pub fn axis_values(&self, keyword: &str, selected_only: bool) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        if let Some(v) = self.key.get(keyword) {
            values.insert(v.to_string());
            return values;
        }

        let mut add = |entry: &IndexEntry| {
            if let Some(v) = entry.key().get(keyword) {
                values.insert(v.to_string());
            } else if let Some(seen) = entry.descriptor.axes.values(keyword) {
                values.extend(seen.iter().cloned());
            }
        };
        if selected_only {
            self.selected.iter().for_each(|pos| add(&self.entries[*pos]));
        } else {
            self.entries.iter().for_each(&mut add);
        }
        values
    }

    /// Counts records, segments and fields of the database.
    pub fn stats(&mut self) -> FdbResult<DbStats> {
        let mut visitor = StatsVisitor::new();
        self.visit_entries(&mut visitor)?;
        let mut stats = visitor.into_stats();

        stats.toc_records = self.toc.number_of_records()?;
        stats.toc_size = file_size(self.toc.toc_path());
        stats.schema_size = file_size(self.toc.schema_path());
        stats.sub_tocs = self
            .toc
            .metadata_paths()?
            .iter()
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(crate::toc::SUB_TOC_PREFIX))
            })
            .count();
        Ok(stats)
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remapped(field: Field, remap_key: &Key) -> Field {
    if remap_key.is_empty() {
        return field;
    }
    Field {
        location: field.location.with_remap_key(remap_key),
        timestamp: field.timestamp,
    }
}

impl Catalogue for CatalogueReader {
    fn key(&self) -> &Key {
        &self.key
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn mode(&self) -> CatalogueMode {
        CatalogueMode::Reader
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
        if self.current.as_ref() == Some(key) {
            return Ok(!self.selected.is_empty());
        }
        self.selected = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.key() == key)
            .map(|(pos, _)| pos)
            .collect();
        self.current = Some(key.clone());
        debug!(index = %key, matches = self.selected.len(), "indexes selected");
        Ok(!self.selected.is_empty())
    }

    fn deselect_index(&mut self) {
        self.current = None;
        self.selected.clear();
    }

    /// Newest matching segment wins. Segments whose axes cannot hold the
    /// datum are never opened.
    fn retrieve(&mut self, datum: &Key) -> FdbResult<Option<Field>> {
        for i in 0..self.selected.len() {
            let pos = self.selected[i];
            if !self.entries[pos].descriptor.axes.may_contain(datum) {
                continue;
            }
            let found = self.materialise(pos)?.get(datum)?;
            if let Some(field) = found {
                return Ok(Some(remapped(field, &self.entries[pos].remap_key)));
            }
        }
        Ok(None)
    }

    fn axis(&self, keyword: &str) -> FdbResult<Option<BTreeSet<String>>> {
        let values = self.axis_values(keyword, self.current.is_some());
        Ok((!values.is_empty()).then_some(values))
    }

    fn visit_entries(&mut self, visitor: &mut dyn EntryVisitor) -> FdbResult<()> {
        if !visitor.visit_database(&self.key, self.context.directory()) {
            return Ok(());
        }
        for entry in &self.entries {
            if !visitor.visit_index(entry) {
                continue;
            }
            let index = Index::open(&self.context, &entry.descriptor)?;
            let schema = &self.schema;
            let db_key = &self.key;
            index.visit(&mut |fingerprint, field| {
                match schema.datum_key(db_key, entry.key(), fingerprint) {
                    Some(datum) => visitor.visit_datum(&datum, &remapped(field.clone(), &entry.remap_key)),
                    None => warn!(index = %entry.key(), fingerprint, "entry does not fit the schema"),
                }
                true
            })?;
        }
        visitor.catalogue_complete();
        Ok(())
    }

    fn flush(&mut self) -> FdbResult<()> {
        Ok(())
    }

    fn close(&mut self) -> FdbResult<()> {
        self.deselect_index();
        self.cache.clear();
        Ok(())
    }

    fn metadata_paths(&self) -> FdbResult<Vec<PathBuf>> {
        self.toc.metadata_paths()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::CatalogueWriter;
    use crate::catalogue::visitor::ListVisitor;
    use crate::config::OverwritePolicy;
    use crate::index::FieldLocation;
    use crate::request::Request;
    use tempfile::tempdir;

    const SCHEMA: &str = "[ class, expver [ type, levtype [ step, param ]]]";

    fn db_key() -> Key {
        Key::from_pairs([("class", "od"), ("expver", "0001")])
    }

    fn index_key(levtype: &str) -> Key {
        Key::from_pairs([("type", "fc"), ("levtype", levtype)])
    }

    fn datum(step: &str) -> Key {
        Key::from_pairs([("step", step), ("param", "t")])
    }

    fn write(dir: &Path, config: &FdbConfig, kv: &Arc<KvRegistry>, items: &[(&str, &str, u64)]) {
        let master = Schema::parse(SCHEMA).unwrap();
        let mut writer =
            CatalogueWriter::open(dir, &db_key(), &master, config, &SchemaRegistry::new(), kv.clone())
                .unwrap();
        for (levtype, step, offset) in items {
            writer.select_index(&index_key(levtype)).unwrap();
            writer
                .archive(&datum(step), FieldLocation::file("/d", *offset, 1))
                .unwrap();
        }
        writer.close().unwrap();
    }

    fn read(dir: &Path, config: &FdbConfig, kv: &Arc<KvRegistry>) -> CatalogueReader {
        CatalogueReader::open(dir, &db_key(), config, &SchemaRegistry::new(), kv.clone())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn missing_database_opens_as_none() {
        let dir = tempdir().unwrap();
        let reader = CatalogueReader::open(
            dir.path(),
            &db_key(),
            &FdbConfig::default(),
            &SchemaRegistry::new(),
            Arc::new(KvRegistry::new()),
        )
        .unwrap();
        assert!(reader.is_none());
    }

    #[test]
    fn retrieve_prefers_newest_segment() {
        let dir = tempdir().unwrap();
        let config = FdbConfig::default();
        let kv = Arc::new(KvRegistry::new());
        write(dir.path(), &config, &kv, &[("sfc", "0", 0), ("sfc", "6", 1)]);
        write(dir.path(), &config, &kv, &[("sfc", "0", 99)]);

        let mut reader = read(dir.path(), &config, &kv);
        assert_eq!(reader.entries().len(), 2);
        assert!(reader.select_index(&index_key("sfc")).unwrap());
        let field = reader.retrieve(&datum("0")).unwrap().unwrap();
        assert_eq!(field.location.offset(), 99);
        assert_eq!(reader.retrieve(&datum("6")).unwrap().unwrap().location.offset(), 1);
        assert!(reader.retrieve(&datum("12")).unwrap().is_none());
        // the axes pre-check keeps the segment holding only step 0 closed
        assert_eq!(reader.cache_counters().1, 2);
    }

    #[test]
    fn selection_is_exact_and_axis_spans_index_keys() {
        let dir = tempdir().unwrap();
        let config = FdbConfig::default();
        let kv = Arc::new(KvRegistry::new());
        write(dir.path(), &config, &kv, &[("sfc", "0", 0), ("pl", "6", 1)]);

        let mut reader = read(dir.path(), &config, &kv);
        let levtypes = reader.axis("levtype").unwrap().unwrap();
        assert_eq!(levtypes.into_iter().collect::<Vec<_>>(), ["pl", "sfc"]);

        assert!(reader.select_index(&index_key("sfc")).unwrap());
        assert_eq!(reader.selected().count(), 1);
        let steps = reader.axis("step").unwrap().unwrap();
        assert_eq!(steps.into_iter().collect::<Vec<_>>(), ["0"]);
        assert!(!reader.select_index(&index_key("ml")).unwrap());
        assert!(reader.axis("param").unwrap().is_none());
    }

    #[test]
    fn reopening_yields_same_view() {
        let dir = tempdir().unwrap();
        let config = FdbConfig {
            engine: EngineKind::Kv,
            overwrite_policy: OverwritePolicy::Warn,
            ..FdbConfig::default()
        };
        let kv = Arc::new(KvRegistry::new());
        write(dir.path(), &config, &kv, &[("sfc", "0", 0), ("sfc", "6", 1)]);

        let list = |reader: &mut CatalogueReader| {
            let mut visitor = ListVisitor::new(Request::new());
            reader.visit_entries(&mut visitor).unwrap();
            visitor
                .into_elements()
                .into_iter()
                .map(|e| e.full_key().to_string())
                .collect::<Vec<_>>()
        };
        let first = list(&mut read(dir.path(), &config, &kv));
        let second = list(&mut read(dir.path(), &config, &kv));
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn archive_is_rejected_by_readers() {
        let dir = tempdir().unwrap();
        let config = FdbConfig::default();
        let kv = Arc::new(KvRegistry::new());
        write(dir.path(), &config, &kv, &[("sfc", "0", 0)]);
        let mut reader = read(dir.path(), &config, &kv);
        let err = reader
            .archive(&datum("6"), FieldLocation::file("/d", 0, 1))
            .unwrap_err();
        assert!(matches!(err, FdbError::NotImplemented(_)));
    }

    #[test]
    fn stats_count_fields_and_duplicates() {
        let dir = tempdir().unwrap();
        let config = FdbConfig::default();
        let kv = Arc::new(KvRegistry::new());
        write(dir.path(), &config, &kv, &[("sfc", "0", 0), ("sfc", "6", 1)]);
        write(dir.path(), &config, &kv, &[("sfc", "0", 2)]);

        let stats = read(dir.path(), &config, &kv).stats().unwrap();
        assert_eq!(stats.index_count, 2);
        assert_eq!(stats.field_count, 2);
        assert_eq!(stats.duplicate_count, 1);
        assert_eq!(stats.toc_records, 3);
        assert!(stats.toc_size > 0);
    }
}
