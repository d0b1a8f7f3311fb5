//! TocHandler: the append-only table of contents of one database directory.
//!
//! Directory layout:
//!
//! ```text
//! <db>/toc            master log, starts with INIT
//! <db>/schema         copy of the schema the database was created with
//! <db>/toc.<unique>   sub-logs, one per writer session when enabled
//! <db>/*.index        index files (segment engine)
//! <db>/index.kv/      shared store (kv engine)
//! ```
//!
//! Appends hold an exclusive `flock` on the log being written. Replay takes
//! no lock: logs only grow, and a torn trailing record is ignored. The next
//! append cuts such a tail back to the last record boundary first.

use super::record::{self, ClearTarget, TocPayload, TocRecord};
use crate::config::FdbConfig;
use crate::error::{FdbError, FdbResult};
use crate::index::{IndexBackendKind, IndexDescriptor, IndexLocation};
use crate::key::Key;
use crate::schema::Schema;
use crate::sys::{self, FileLock};
use ahash::AHashSet;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TOC_FILE: &str = "toc";
pub const SCHEMA_FILE: &str = "schema";
pub const SUB_TOC_PREFIX: &str = "toc.";

/// Per-database switches taken from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TocOptions {
    pub use_sub_toc: bool,
    pub only_creator_can_write: bool,
    pub super_users: Vec<String>,
}

impl TocOptions {
    pub fn from_config(config: &FdbConfig) -> Self {
        Self {
            use_sub_toc: config.use_sub_toc,
            only_creator_can_write: config.only_creator_can_write,
            super_users: config.super_users.clone(),
        }
    }
}

/// One index segment that survived replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub descriptor: IndexDescriptor,
    /// Database-key pairs where the current key differs from the INIT key of
    /// the log that announced this segment. Empty when they agree.
    pub remap_key: Key,
    pub in_sub_toc: bool,
}

impl IndexEntry {
    pub fn key(&self) -> &Key {
        &self.descriptor.key
    }

    pub fn location(&self) -> &IndexLocation {
        &self.descriptor.location
    }

    /// CLEAR target that retracts this segment.
    pub fn clear_target(&self) -> ClearTarget {
        ClearTarget::Index {
            path: self.descriptor.location.path.clone(),
            offset: self.descriptor.location.offset,
        }
    }
}

struct Announced {
    descriptor: IndexDescriptor,
    init_key: Key,
    in_sub_toc: bool,
}

#[derive(Debug)]
pub struct TocHandler {
    directory: PathBuf,
    toc_path: PathBuf,
    schema_path: PathBuf,
    key: Key,
    options: TocOptions,
    /// This session's sub-log, relative to the directory
    sub_toc: Option<PathBuf>,
}

impl TocHandler {
    pub fn new(directory: impl Into<PathBuf>, key: &Key, options: TocOptions) -> Self {
        let directory = directory.into();
        Self {
            toc_path: directory.join(TOC_FILE),
            schema_path: directory.join(SCHEMA_FILE),
            directory,
            key: key.clone(),
            options,
            sub_toc: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn toc_path(&self) -> &Path {
        &self.toc_path
    }

    pub fn schema_path(&self) -> &Path {
        &self.schema_path
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn options(&self) -> &TocOptions {
        &self.options
    }

    /// This session's sub-log, once the first INDEX record created it.
    pub fn sub_toc(&self) -> Option<&Path> {
        self.sub_toc.as_deref()
    }

    /// True once the master log holds at least one record.
    pub fn exists(&self) -> bool {
        fs::metadata(&self.toc_path).is_ok_and(|m| m.len() > 0)
    }

    // ════════════════════════════════════════════
    // Appending
    // ════════════════════════════════════════════

    /// Creates the database: directory, schema copy and INIT record.
    ///
    /// Returns `false` when another session initialised it first.
    pub fn write_init_record(&self, schema: &Schema) -> FdbResult<bool> {
        fs::create_dir_all(&self.directory)?;
        let mut lock = FileLock::exclusive(&self.toc_path)?;
        if lock.file().metadata()?.len() > 0 {
            // only a torn INIT from a crashed creator is written over
            let (records, _) = record::decode_prefix(&self.toc_path, &fs::read(&self.toc_path)?)?;
            if !records.is_empty() {
                return Ok(false);
            }
        }

        fs::write(&self.schema_path, schema.text())?;
        let init = TocRecord::new(TocPayload::Init {
            key: self.key.clone(),
            schema_digest: schema.id().0,
        });
        write_locked(&mut lock, &[init])?;
        info!(db = %self.directory.display(), key = %self.key, "database initialised");
        Ok(true)
    }

    /// Announces a flushed index segment, in the sub-log when enabled.
    pub fn write_index_record(&mut self, descriptor: IndexDescriptor) -> FdbResult<()> {
        let record = TocRecord::new(TocPayload::Index(descriptor));
        if self.options.use_sub_toc {
            let sub_toc = self.ensure_sub_toc()?;
            self.append(&sub_toc, &[record])
        } else {
            self.append_master(&[record])
        }
    }

    pub fn write_clear_record(&self, target: ClearTarget) -> FdbResult<()> {
        self.append_master(&[TocRecord::new(TocPayload::Clear(target))])
    }

    /// Masks this session's sub-log, if one was created.
    pub fn write_sub_toc_mask_record(&self) -> FdbResult<()> {
        match &self.sub_toc {
            Some(path) => self.write_clear_record(ClearTarget::SubToc { path: path.clone() }),
            None => Ok(()),
        }
    }

    /// Appends several records to the master log under one lock.
    pub fn append_block(&self, payloads: Vec<TocPayload>) -> FdbResult<()> {
        let records: Vec<TocRecord> = payloads.into_iter().map(TocRecord::new).collect();
        self.append_master(&records)
    }

    fn ensure_sub_toc(&mut self) -> FdbResult<PathBuf> {
        if let Some(path) = &self.sub_toc {
            return Ok(self.directory.join(path));
        }

        let (key, schema_digest) = self.init()?;
        let relative = PathBuf::from(format!("{SUB_TOC_PREFIX}{}", sys::unique_suffix()));
        let absolute = self.directory.join(&relative);
        self.append(&absolute, &[TocRecord::new(TocPayload::Init { key, schema_digest })])?;
        self.append_master(&[TocRecord::new(TocPayload::SubToc {
            path: relative.clone(),
        })])?;

        debug!(sub_toc = %absolute.display(), "sub-toc linked");
        self.sub_toc = Some(relative);
        Ok(absolute)
    }

    fn append_master(&self, records: &[TocRecord]) -> FdbResult<()> {
        if !self.exists() {
            return Err(FdbError::invalid_op(
                "append to an uninitialised toc",
                self.toc_path.display().to_string(),
            ));
        }
        self.append(&self.toc_path, records)
    }

    fn append(&self, path: &Path, records: &[TocRecord]) -> FdbResult<()> {
        let mut lock = FileLock::exclusive(path)?;
        write_locked(&mut lock, records)
    }

    // ════════════════════════════════════════════
    // Replay
    // ════════════════════════════════════════════

    /// All records of one log file.
    pub fn records(&self, path: &Path) -> FdbResult<Vec<TocRecord>> {
        let bytes = fs::read(path)?;
        record::decode_all(path, &bytes)
    }

    /// INIT key and schema digest of the master log.
    pub fn init(&self) -> FdbResult<(Key, u64)> {
        let records = self.records(&self.toc_path)?;
        match records.into_iter().next().map(|r| r.payload) {
            Some(TocPayload::Init { key, schema_digest }) => Ok((key, schema_digest)),
            _ => Err(FdbError::corrupt(&self.toc_path, "log does not start with an INIT record")),
        }
    }

    pub fn database_key(&self) -> FdbResult<Key> {
        Ok(self.init()?.0)
    }

    /// Live index segments, newest first.
    ///
    /// Sub-logs are followed where their SUBTOC record sits. CLEAR records
    /// of the master log are gathered before replay, so a masked sub-log is
    /// never opened and a masked segment disappears wherever it was
    /// announced.
    pub fn load_indexes(&self) -> FdbResult<Vec<IndexEntry>> {
        let master = self.records(&self.toc_path)?;
        let mut masks: AHashSet<ClearTarget> = master
            .iter()
            .filter_map(|r| match &r.payload {
                TocPayload::Clear(target) => Some(target.clone()),
                _ => None,
            })
            .collect();

        let mut announced = Vec::new();
        let mut visited = AHashSet::new();
        self.flatten(&self.toc_path, master, false, &mut masks, &mut announced, &mut visited)?;

        let mut entries: Vec<IndexEntry> = announced
            .into_iter()
            .filter(|a| {
                !masks.contains(&ClearTarget::Index {
                    path: a.descriptor.location.path.clone(),
                    offset: a.descriptor.location.offset,
                })
            })
            .map(|a| IndexEntry {
                remap_key: self.key.differences(&a.init_key),
                descriptor: a.descriptor,
                in_sub_toc: a.in_sub_toc,
            })
            .collect();
        entries.reverse();

        debug!(db = %self.directory.display(), indexes = entries.len(), "toc loaded");
        Ok(entries)
    }

    fn flatten(
        &self,
        path: &Path,
        records: Vec<TocRecord>,
        in_sub_toc: bool,
        masks: &mut AHashSet<ClearTarget>,
        out: &mut Vec<Announced>,
        visited: &mut AHashSet<PathBuf>,
    ) -> FdbResult<()> {
        let mut init_key = None;
        for (i, record) in records.into_iter().enumerate() {
            match record.payload {
                TocPayload::Init { key, .. } if i == 0 => init_key = Some(key),
                _ if i == 0 => {
                    return Err(FdbError::corrupt(path, "log does not start with an INIT record"));
                }
                TocPayload::Init { .. } => {
                    return Err(FdbError::corrupt(path, "INIT record after the first record"));
                }
                TocPayload::Index(descriptor) => out.push(Announced {
                    descriptor,
                    init_key: init_key.clone().unwrap_or_default(),
                    in_sub_toc,
                }),
                TocPayload::Clear(target) => {
                    masks.insert(target);
                }
                TocPayload::SubToc { path: relative } => {
                    if masks.contains(&ClearTarget::SubToc {
                        path: relative.clone(),
                    }) {
                        debug!(sub_toc = %relative.display(), "masked sub-toc skipped");
                        continue;
                    }
                    if !visited.insert(relative.clone()) {
                        continue;
                    }
                    let absolute = self.directory.join(&relative);
                    let sub = self.records(&absolute).map_err(|e| match e {
                        FdbError::Io { source } if source.kind() == ErrorKind::NotFound => {
                            FdbError::corrupt(&absolute, "sub-toc referenced but missing")
                        }
                        other => other,
                    })?;
                    self.flatten(&absolute, sub, true, masks, out, visited)?;
                }
            }
        }
        Ok(())
    }

    /// Every log of the database with its records, masked sub-logs
    /// included. Missing sub-logs are skipped.
    fn all_logs(&self) -> FdbResult<Vec<(PathBuf, Vec<TocRecord>)>> {
        let mut logs = vec![(self.toc_path.clone(), self.records(&self.toc_path)?)];
        let mut seen = AHashSet::new();
        let mut i = 0;
        while i < logs.len() {
            let links: Vec<PathBuf> = logs[i]
                .1
                .iter()
                .filter_map(|r| match &r.payload {
                    TocPayload::SubToc { path } => Some(path.clone()),
                    _ => None,
                })
                .collect();
            for relative in links {
                if !seen.insert(relative.clone()) {
                    continue;
                }
                let absolute = self.directory.join(&relative);
                match self.records(&absolute) {
                    Ok(records) => logs.push((absolute, records)),
                    Err(FdbError::Io { source }) if source.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            i += 1;
        }
        Ok(logs)
    }

    /// Records across the master log and every sub-log.
    pub fn number_of_records(&self) -> FdbResult<usize> {
        Ok(self.all_logs()?.iter().map(|(_, records)| records.len()).sum())
    }

    // ════════════════════════════════════════════
    // Ownership
    // ════════════════════════════════════════════

    /// Login name of the directory owner.
    pub fn db_owner(&self) -> FdbResult<String> {
        Ok(sys::user_name(sys::owner_uid(&self.directory)?))
    }

    /// Rejects writers other than the creator, unless they are super users
    /// or enforcement is off.
    pub fn check_uid(&self) -> FdbResult<()> {
        if !self.options.only_creator_can_write || !self.directory.exists() {
            return Ok(());
        }
        let owner = sys::owner_uid(&self.directory)?;
        let uid = sys::current_uid();
        if owner == uid {
            return Ok(());
        }
        let user = sys::user_name(uid);
        if self.options.super_users.iter().any(|u| *u == user) {
            return Ok(());
        }
        Err(FdbError::PermissionDenied {
            path: self.directory.clone(),
            owner: sys::user_name(owner),
            user,
        })
    }

    // ════════════════════════════════════════════
    // Tooling
    // ════════════════════════════════════════════

    /// Every file the database owns: logs, schema, index files and the
    /// shared kv store. Nothing is deleted here.
    pub fn metadata_paths(&self) -> FdbResult<Vec<PathBuf>> {
        let mut paths = BTreeSet::new();
        paths.insert(self.toc_path.clone());
        if self.schema_path.exists() {
            paths.insert(self.schema_path.clone());
        }
        for (log, records) in self.all_logs()? {
            paths.insert(log);
            for record in records {
                if let TocPayload::Index(descriptor) = record.payload {
                    paths.insert(self.directory.join(&descriptor.location.path));
                    if descriptor.backend == IndexBackendKind::Kv {
                        paths.insert(self.directory.join(crate::index::kv::KV_STORE_NAME));
                    }
                }
            }
        }
        Ok(paths.into_iter().collect())
    }

    /// Human-readable listing of every record, sub-logs included.
    pub fn dump(&self) -> FdbResult<String> {
        let mut out = String::new();
        for (log, records) in self.all_logs()? {
            let _ = writeln!(out, "== {}", log.display());
            for record in records {
                let h = &record.header;
                let _ = write!(
                    out,
                    "{:<12} {}.{:06} host={} pid={} uid={} ",
                    h.tag.name(),
                    h.timestamp_sec,
                    h.timestamp_usec,
                    h.hostname,
                    h.pid,
                    h.uid
                );
                let _ = match &record.payload {
                    TocPayload::Init { key, schema_digest } => {
                        writeln!(out, "key={key} schema={schema_digest:016x}")
                    }
                    TocPayload::Index(d) => writeln!(
                        out,
                        "key={} location={} backend={}",
                        d.key,
                        d.location,
                        d.backend.as_str()
                    ),
                    TocPayload::Clear(target) => writeln!(out, "{target}"),
                    TocPayload::SubToc { path } => writeln!(out, "path={}", path.display()),
                };
            }
        }
        Ok(out)
    }
}

fn write_locked(lock: &mut FileLock, records: &[TocRecord]) -> FdbResult<()> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(&record.encode()?);
    }
    let path = lock.path().to_path_buf();
    let file = lock.file();

    // a torn tail left by a dead writer must not prefix the new records
    let len = file.metadata()?.len();
    if len > 0 {
        let (_, boundary) = record::decode_prefix(&path, &fs::read(&path)?)?;
        let boundary = boundary as u64;
        if boundary != len {
            warn!(toc = %path.display(), len, boundary, "log tail realigned before append");
            file.set_len(boundary)?;
        }
    }

    file.write_all(&buf)?;
    file.sync_data()?;
    for record in records {
        debug!(toc = %path.display(), tag = record.tag().name(), "record appended");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexAxis;
    use tempfile::tempdir;

    const SCHEMA: &str = "[ class, expver [ type [ step, param ]]]";

    fn db_key() -> Key {
        Key::from_pairs([("class", "od"), ("expver", "0001")])
    }

    fn descriptor(name: &str, offset: u64) -> IndexDescriptor {
        IndexDescriptor {
            location: IndexLocation::new(name, offset),
            backend: IndexBackendKind::Segment,
            key: Key::from_pairs([("type", "fc")]),
            axes: IndexAxis::new(),
            timestamp: 1,
        }
    }

    fn handler(dir: &Path, options: TocOptions) -> TocHandler {
        let handler = TocHandler::new(dir, &db_key(), options);
        handler.write_init_record(&Schema::parse(SCHEMA).unwrap()).unwrap();
        handler
    }

    #[test]
    fn init_is_written_once() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("od:0001");
        let toc = TocHandler::new(&db, &db_key(), TocOptions::default());
        assert!(!toc.exists());

        let schema = Schema::parse(SCHEMA).unwrap();
        assert!(toc.write_init_record(&schema).unwrap());
        assert!(!toc.write_init_record(&schema).unwrap());
        assert!(toc.exists());
        assert_eq!(toc.database_key().unwrap(), db_key());
        assert_eq!(toc.init().unwrap().1, schema.id().0);
        assert_eq!(fs::read_to_string(toc.schema_path()).unwrap(), SCHEMA);
        assert_eq!(toc.number_of_records().unwrap(), 1);
    }

    #[test]
    fn masked_segments_are_not_loaded() {
        let dir = tempdir().unwrap();
        let mut toc = handler(dir.path(), TocOptions::default());
        toc.write_index_record(descriptor("a.index", 0)).unwrap();
        toc.write_index_record(descriptor("a.index", 512)).unwrap();

        let entries = toc.load_indexes().unwrap();
        assert_eq!(entries.len(), 2);
        // newest first
        assert_eq!(entries[0].location().offset, 512);

        toc.write_clear_record(entries[0].clear_target()).unwrap();
        let entries = toc.load_indexes().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].location().offset, 0);
        assert!(entries[0].remap_key.is_empty());
        assert_eq!(toc.number_of_records().unwrap(), 4);
    }

    #[test]
    fn append_after_torn_tail_keeps_log_readable() {
        let dir = tempdir().unwrap();
        let mut toc = handler(dir.path(), TocOptions::default());
        toc.write_index_record(descriptor("a.index", 0)).unwrap();
        let intact = fs::metadata(toc.toc_path()).unwrap().len();
        toc.write_index_record(descriptor("a.index", 512)).unwrap();

        // writer died halfway through the second INDEX record
        let file = fs::OpenOptions::new().write(true).open(toc.toc_path()).unwrap();
        file.set_len(intact + 130).unwrap();
        drop(file);
        assert_eq!(toc.load_indexes().unwrap().len(), 1);

        toc.write_index_record(descriptor("a.index", 1024)).unwrap();
        assert_eq!(fs::metadata(toc.toc_path()).unwrap().len() % 512, 0);
        let entries = toc.load_indexes().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].location().offset, 1024);
        assert_eq!(entries[1].location().offset, 0);
        assert_eq!(toc.number_of_records().unwrap(), 3);
    }

    #[test]
    fn torn_init_is_rewritten() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("od:0001");
        let schema = Schema::parse(SCHEMA).unwrap();
        let toc = TocHandler::new(&db, &db_key(), TocOptions::default());
        assert!(toc.write_init_record(&schema).unwrap());
        let file = fs::OpenOptions::new().write(true).open(toc.toc_path()).unwrap();
        file.set_len(60).unwrap();
        drop(file);

        assert!(toc.write_init_record(&schema).unwrap());
        assert_eq!(toc.database_key().unwrap(), db_key());
        assert_eq!(toc.number_of_records().unwrap(), 1);
    }

    #[test]
    fn sub_toc_is_linked_and_can_be_masked() {
        let dir = tempdir().unwrap();
        let options = TocOptions {
            use_sub_toc: true,
            ..TocOptions::default()
        };
        let mut writer = handler(dir.path(), options);
        writer.write_index_record(descriptor("b.index", 0)).unwrap();
        writer.write_index_record(descriptor("b.index", 512)).unwrap();
        let sub = writer.sub_toc().unwrap().to_path_buf();
        assert!(sub.to_string_lossy().starts_with(SUB_TOC_PREFIX));

        let master = writer.records(writer.toc_path()).unwrap();
        assert_eq!(master.len(), 2);
        assert!(matches!(master[1].payload, TocPayload::SubToc { .. }));

        let reader = TocHandler::new(dir.path(), &db_key(), TocOptions::default());
        let entries = reader.load_indexes().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.in_sub_toc));

        writer.write_sub_toc_mask_record().unwrap();
        assert!(reader.load_indexes().unwrap().is_empty());
        assert!(reader.metadata_paths().unwrap().contains(&dir.path().join(&sub)));
    }

    #[test]
    fn missing_sub_toc_is_corrupt() {
        let dir = tempdir().unwrap();
        let options = TocOptions {
            use_sub_toc: true,
            ..TocOptions::default()
        };
        let mut writer = handler(dir.path(), options);
        writer.write_index_record(descriptor("b.index", 0)).unwrap();
        fs::remove_file(dir.path().join(writer.sub_toc().unwrap())).unwrap();

        let err = writer.load_indexes().unwrap_err();
        assert!(matches!(err, FdbError::CorruptLog { .. }));
    }

    #[test]
    fn remap_key_reflects_adopted_database() {
        let dir = tempdir().unwrap();
        let mut toc = handler(dir.path(), TocOptions::default());
        toc.write_index_record(descriptor("a.index", 0)).unwrap();

        let adopted = Key::from_pairs([("class", "od"), ("expver", "0002")]);
        let reader = TocHandler::new(dir.path(), &adopted, TocOptions::default());
        let entries = reader.load_indexes().unwrap();
        assert_eq!(entries[0].remap_key, Key::from_pairs([("expver", "0002")]));
    }

    #[test]
    fn log_without_init_is_corrupt() {
        let dir = tempdir().unwrap();
        let toc = TocHandler::new(dir.path(), &db_key(), TocOptions::default());
        let record = TocRecord::new(TocPayload::Index(descriptor("a.index", 0)));
        fs::write(toc.toc_path(), record.encode().unwrap()).unwrap();
        assert!(matches!(toc.load_indexes(), Err(FdbError::CorruptLog { .. })));
        assert!(toc.database_key().is_err());
    }

    #[test]
    fn append_before_init_is_rejected() {
        let dir = tempdir().unwrap();
        let mut toc = TocHandler::new(dir.path(), &db_key(), TocOptions::default());
        assert!(toc.write_index_record(descriptor("a.index", 0)).is_err());
    }

    #[test]
    fn owner_may_write_and_paths_are_listed() {
        let dir = tempdir().unwrap();
        let options = TocOptions {
            only_creator_can_write: true,
            ..TocOptions::default()
        };
        let mut toc = handler(dir.path(), options);
        toc.check_uid().unwrap();
        assert!(!toc.db_owner().unwrap().is_empty());

        toc.write_index_record(descriptor("a.index", 0)).unwrap();
        let paths = toc.metadata_paths().unwrap();
        assert!(paths.contains(&dir.path().join(TOC_FILE)));
        assert!(paths.contains(&dir.path().join(SCHEMA_FILE)));
        assert!(paths.contains(&dir.path().join("a.index")));

        let dump = toc.dump().unwrap();
        assert!(dump.contains("TOC_INIT"));
        assert!(dump.contains("TOC_INDEX"));
    }
}
