//! Fdb facade: archive, retrieve, list and inspect databases.

use super::retriever::{RetrieveResult, RetrievedField, Retriever};
use super::stats::FdbStats;
use super::{Archiver, EngineContext};
use crate::catalogue::{Catalogue, CatalogueReader, DbStats, ListElement, ListVisitor, StatsVisitor};
use crate::config::FdbConfig;
use crate::error::{FdbError, FdbResult};
use crate::key::Key;
use crate::request::Request;
use crate::schema::Schema;
use crate::store::read_field;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

/// FDB 카탈로그 핸들
///
/// 스키마에 따라 키를 데이터베이스/인덱스/데이텀 세 단계로 나누고, 필드 바이트는
/// 스토어에, 위치는 카탈로그에 기록합니다.
///
/// # 데이터 흐름
///
/// - **archive**: 쓰기 세션의 인덱스에 먼저 기록 (아직 보이지 않음)
/// - **flush**: 데이터 동기화 후 INDEX 레코드 추가 (이 시점부터 리더에 보임)
/// - **retrieve**: 요청을 확장해 데이터베이스별 리더에서 조회
/// - **list**: 보이는 모든 데이텀을 요청으로 걸러 나열
///
/// # 예제
///
/// ```rust,no_run
/// use fdb_core::{Fdb, FdbConfig, Key, Request};
///
/// # fn main() -> fdb_core::FdbResult<()> {
/// let fdb = Fdb::new(FdbConfig::with_root("./fdb_root", "./schema"))?;
/// let key: Key = "class=od,expver=0001,type=fc,levtype=sfc,step=0,param=t".parse()?;
/// fdb.archive(&key, b"GRIB...7777")?;
/// fdb.flush()?;
///
/// let result = fdb.retrieve(&Request::from(&key))?;
/// let bytes = fdb.read(&result.fields[0])?;
/// assert_eq!(bytes, b"GRIB...7777");
/// # Ok(())
/// # }
/// ```
pub struct Fdb {
    pub(crate) context: Arc<EngineContext>,
    pub(crate) archiver: Mutex<Archiver>,
    pub(crate) retriever: Retriever,
    pub(crate) stats: Mutex<FdbStats>,
}

impl Fdb {
    pub fn config(&self) -> &FdbConfig {
        &self.context.config
    }

    /// Master schema.
    pub fn schema(&self) -> &Schema {
        &self.context.schema
    }

    /// Counters of this handle so far.
    pub fn op_stats(&self) -> FdbStats {
        self.stats.lock().clone()
    }

    // ════════════════════════════════════════════
    // Write side
    // ════════════════════════════════════════════

    /// Stores `data` under `key`. Visible to readers after the next `flush`.
    pub fn archive(&self, key: &Key, data: &[u8]) -> FdbResult<()> {
        let start = Instant::now();
        self.archiver.lock().archive(key, data)?;
        self.stats.lock().record_archive(data.len() as u64, start.elapsed());
        Ok(())
    }

    pub fn flush(&self) -> FdbResult<()> {
        let start = Instant::now();
        self.archiver.lock().flush()?;
        self.stats.lock().record_flush(start.elapsed());
        Ok(())
    }

    /// Flushes and closes every open writer session.
    pub fn close(&self) -> FdbResult<()> {
        self.archiver.lock().close()
    }

    /// Masks every segment of `index_key` in the database `db_key`.
    #[instrument(skip(self), fields(db = %db_key, index = %index_key))]
    pub fn mask_index(&self, db_key: &Key, index_key: &Key) -> FdbResult<usize> {
        let db_key = self.database_key(db_key)?;
        self.archiver.lock().mask_index(&db_key, index_key)
    }

    // ════════════════════════════════════════════
    // Read side
    // ════════════════════════════════════════════

    pub fn retrieve(&self, request: &Request) -> FdbResult<RetrieveResult> {
        let start = Instant::now();
        let result = self.retriever.retrieve(request)?;
        self.stats.lock().record_retrieve(
            result.fields.len() as u64,
            result.failures.len() as u64,
            start.elapsed(),
        );
        Ok(result)
    }

    /// Bytes of a retrieved field.
    pub fn read(&self, field: &RetrievedField) -> FdbResult<Vec<u8>> {
        read_field(field.field.location())
    }

    /// Visible data matching `request`, in database then log order.
    ///
    /// Databases that fail to open are logged and skipped.
    pub fn list(&self, request: &Request) -> FdbResult<Vec<ListElement>> {
        let request = self.context.schema.types().canonical_request(request);
        let mut visitor = ListVisitor::new(request.clone());
        for location in self.context.roots.visitable_databases(&request) {
            let listed = self
                .context
                .open_reader(&location.path, &location.key)
                .and_then(|reader| match reader {
                    Some(mut reader) => reader.visit_entries(&mut visitor),
                    None => Ok(()),
                });
            if let Err(e) = listed {
                error!(db = %location.path.display(), error = %e, "listing failed");
            }
        }
        Ok(visitor.into_elements())
    }

    /// Values `keyword` takes across the data matching `request`.
    pub fn axis(&self, request: &Request, keyword: &str) -> FdbResult<BTreeSet<String>> {
        Ok(self
            .list(request)?
            .iter()
            .filter_map(|e| e.full_key().get(keyword).map(str::to_string))
            .collect())
    }

    // ════════════════════════════════════════════
    // Inspection
    // ════════════════════════════════════════════

    /// Database part of `key`, which may also carry index and datum keywords.
    pub fn database_key(&self, key: &Key) -> FdbResult<Key> {
        let schema = &self.context.schema;
        let types = schema.types();
        for rule in schema.rules() {
            let mut db_key = Key::new();
            let complete = rule.predicates().iter().filter(|p| !p.is_hidden()).all(|p| {
                let keyword = p.keyword();
                if !types.lookup(keyword).is_identity() {
                    return true;
                }
                match key.get(keyword).or(p.default_value()) {
                    Some(value) => {
                        db_key.push(keyword, types.canonical(keyword, value).into_owned());
                        true
                    }
                    None => false,
                }
            });
            if complete && rule.matches(&db_key, types) {
                return Ok(db_key);
            }
        }
        Err(FdbError::SchemaLookup(format!("no database rule matches key {key}")))
    }

    fn reader(&self, key: &Key) -> FdbResult<CatalogueReader> {
        let db_key = self.database_key(key)?;
        let not_found = || FdbError::invalid_op("database not found", db_key.to_string());
        let directory = self.context.roots.existing_database(&db_key)?.ok_or_else(not_found)?;
        self.context.open_reader(&directory, &db_key)?.ok_or_else(not_found)
    }

    pub fn stats(&self, key: &Key) -> FdbResult<DbStats> {
        self.reader(key)?.stats()
    }

    /// Every file the database owns: logs, schema copy, index files and the
    /// data files its visible fields point to.
    pub fn metadata_paths(&self, key: &Key) -> FdbResult<Vec<PathBuf>> {
        let mut reader = self.reader(key)?;
        let mut visitor = StatsVisitor::new();
        reader.visit_entries(&mut visitor)?;

        let mut paths: BTreeSet<PathBuf> = reader.metadata_paths()?.into_iter().collect();
        paths.extend(visitor.into_stats().data_files);
        info!(db = %reader.key(), files = paths.len(), "database files enumerated");
        Ok(paths.into_iter().collect())
    }

    /// Human-readable dump of the database log.
    pub fn dump(&self, key: &Key) -> FdbResult<String> {
        self.reader(key)?.toc().dump()
    }
}
