//! KV-backed index: one sled store per database, shared by all its indexes.
//!
//! Every entry key is `index_id (8 bytes, big-endian) ++ fingerprint`, so
//! the entries of one index segment are contiguous and a scan can stop at
//! the first key carrying another prefix. The id hashes the index file name
//! together with the segment number, which makes each flush cycle a distinct
//! immutable segment inside the shared store.

use super::{Field, IndexBackend, IndexBackendKind, IndexLocation};
use crate::error::{FdbError, FdbResult};
use crate::sys::FileLock;
use ahash::AHashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory name of the shared store inside a database directory.
pub const KV_STORE_NAME: &str = "index.kv";

/// Prefix length of every entry key.
pub const INDEX_ID_LEN: usize = 8;

/// Open sled stores, keyed by path.
///
/// sled allows one open handle per directory and process, so readers and
/// writers in the same process must share it. The registry is created by
/// the engine and handed down; it is not a global.
#[derive(Debug, Default)]
pub struct KvRegistry {
    stores: Mutex<AHashMap<PathBuf, sled::Db>>,
}

impl KvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the store at `path`, opening it on first use.
    ///
    /// Fails with `InvalidOperation` while another process (or another
    /// registry) has the store open.
    pub fn open(&self, path: &Path) -> FdbResult<sled::Db> {
        let mut stores = self.stores.lock();
        if let Some(db) = stores.get(path) {
            return Ok(db.clone());
        }
        let db = sled::open(path).map_err(|e| {
            FdbError::invalid_op(
                format!("kv store cannot be opened, it may be held by another process: {e}"),
                path.display().to_string(),
            )
        })?;
        debug!(path = %path.display(), "kv store opened");
        stores.insert(path.to_path_buf(), db.clone());
        Ok(db)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.stores.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }

    /// Flushes and forgets the store at `path`. The store closes once the
    /// last index holding a handle is dropped.
    pub fn release(&self, path: &Path) -> FdbResult<()> {
        if let Some(db) = self.stores.lock().remove(path) {
            db.flush()?;
        }
        Ok(())
    }
}

/// Shard prefix of one index segment: the first 8 bytes of
/// `sha256("<file name>#<segment>")`.
pub fn index_id(name: &str, segment: u64) -> [u8; INDEX_ID_LEN] {
    let digest = Sha256::digest(format!("{name}#{segment}").as_bytes());
    let mut id = [0u8; INDEX_ID_LEN];
    id.copy_from_slice(&digest[..INDEX_ID_LEN]);
    id
}

pub struct KvIndex {
    db: sled::Db,
    /// Per-index file; holds the lock and names the shard
    path: PathBuf,
    segment: u64,
    id: [u8; INDEX_ID_LEN],
    writable: bool,
    lock: Option<FileLock>,
}

impl KvIndex {
    /// New writable index. The file at `path` stays empty; it names the
    /// index and carries its advisory lock.
    pub fn create(db: sled::Db, path: &Path) -> FdbResult<Self> {
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_segment(db, path, 0, true))
    }

    /// Read-only view of the segment named by `location`.
    pub fn open(db: sled::Db, location: &IndexLocation) -> Self {
        Self::with_segment(db, &location.path, location.offset, false)
    }

    fn with_segment(db: sled::Db, path: &Path, segment: u64, writable: bool) -> Self {
        let name = shard_name(path);
        Self {
            db,
            path: path.to_path_buf(),
            segment,
            id: index_id(&name, segment),
            writable,
            lock: None,
        }
    }

    pub fn id(&self) -> [u8; INDEX_ID_LEN] {
        self.id
    }

    fn entry_key(&self, fingerprint: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(INDEX_ID_LEN + fingerprint.len());
        key.extend_from_slice(&self.id);
        key.extend_from_slice(fingerprint.as_bytes());
        key
    }

    fn decode(&self, bytes: &[u8]) -> FdbResult<Field> {
        bincode::deserialize(bytes)
            .map_err(|e| FdbError::corrupt(&self.path, format!("kv entry: {e}")))
    }

    fn ensure_writable(&self, op: &str) -> FdbResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FdbError::NotImplemented(format!(
                "{op} on read-only index {}",
                self.path.display()
            )))
        }
    }
}

fn shard_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl IndexBackend for KvIndex {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::Kv
    }

    fn location(&self) -> IndexLocation {
        IndexLocation::new(self.path.clone(), self.segment)
    }

    fn get(&self, fingerprint: &str) -> FdbResult<Option<Field>> {
        match self.db.get(self.entry_key(fingerprint))? {
            Some(bytes) => Ok(Some(self.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, fingerprint: &str, field: &Field) -> FdbResult<()> {
        self.ensure_writable("put")?;
        let value = bincode::serialize(field)?;
        self.db.insert(self.entry_key(fingerprint), value)?;
        Ok(())
    }

    fn visit(&self, visitor: &mut dyn FnMut(&str, &Field) -> bool) -> FdbResult<()> {
        for item in self.db.range(self.id.to_vec()..) {
            let (key, value) = item?;
            if !key.starts_with(&self.id) {
                break;
            }
            let fingerprint = std::str::from_utf8(&key[INDEX_ID_LEN..])
                .map_err(|_| FdbError::corrupt(&self.path, "kv fingerprint is not utf-8"))?;
            let field = self.decode(&value)?;
            if !visitor(fingerprint, &field) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> FdbResult<IndexLocation> {
        self.ensure_writable("flush")?;
        self.db.flush()?;
        Ok(self.location())
    }

    fn reopen(&mut self) -> FdbResult<()> {
        self.ensure_writable("reopen")?;
        self.segment += 1;
        self.id = index_id(&shard_name(&self.path), self.segment);
        Ok(())
    }

    fn sync(&mut self) -> FdbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn flock(&mut self) -> FdbResult<()> {
        if self.lock.is_none() {
            self.lock = Some(FileLock::exclusive(&self.path)?);
        }
        Ok(())
    }

    fn funlock(&mut self) -> FdbResult<()> {
        self.lock = None;
        Ok(())
    }

    fn close(&mut self) -> FdbResult<()> {
        self.funlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FieldLocation;
    use tempfile::tempdir;

    fn field(offset: u64) -> Field {
        Field::new(FieldLocation::file("/data/x.data", offset, 8))
    }

    #[test]
    fn registry_shares_handles() {
        let dir = tempdir().unwrap();
        let registry = KvRegistry::new();
        let path = dir.path().join(KV_STORE_NAME);
        let a = registry.open(&path).unwrap();
        let b = registry.open(&path).unwrap();
        a.insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(b.get(b"k").unwrap().unwrap().as_ref(), b"v");
        assert_eq!(registry.len(), 1);
        registry.release(&path).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn store_is_exclusive_to_one_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(KV_STORE_NAME);
        let holder = KvRegistry::new();
        let _db = holder.open(&path).unwrap();

        let other = KvRegistry::new();
        let err = other.open(&path).unwrap_err();
        assert!(matches!(err, FdbError::InvalidOperation { .. }));
        assert!(other.is_empty());
    }

    #[test]
    fn index_ids_differ_per_segment() {
        assert_ne!(index_id("a.index", 0), index_id("a.index", 1));
        assert_ne!(index_id("a.index", 0), index_id("b.index", 0));
        assert_eq!(index_id("a.index", 3), index_id("a.index", 3));
    }

    #[test]
    fn scan_stays_inside_its_shard() {
        let dir = tempdir().unwrap();
        let registry = KvRegistry::new();
        let db = registry.open(&dir.path().join(KV_STORE_NAME)).unwrap();

        let mut a = KvIndex::create(db.clone(), &dir.path().join("a.index")).unwrap();
        let mut b = KvIndex::create(db.clone(), &dir.path().join("b.index")).unwrap();
        for step in 0..10u64 {
            a.put(&format!("a{step}"), &field(step)).unwrap();
            b.put(&format!("b{step}"), &field(step)).unwrap();
        }

        let mut seen = Vec::new();
        a.visit(&mut |fp, _| {
            seen.push(fp.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|fp| fp.starts_with('a')));
    }

    #[test]
    fn reopened_segment_is_distinct() {
        let dir = tempdir().unwrap();
        let registry = KvRegistry::new();
        let db = registry.open(&dir.path().join(KV_STORE_NAME)).unwrap();
        let mut index = KvIndex::create(db.clone(), &dir.path().join("a.index")).unwrap();

        index.put("0:t", &field(0)).unwrap();
        let first = index.flush().unwrap();
        index.reopen().unwrap();
        index.put("6:t", &field(8)).unwrap();
        let second = index.flush().unwrap();
        assert_eq!((first.offset, second.offset), (0, 1));

        let old = KvIndex::open(db.clone(), &first);
        assert!(old.get("0:t").unwrap().is_some());
        assert!(old.get("6:t").unwrap().is_none());

        let mut reader = KvIndex::open(db, &second);
        assert!(reader.get("6:t").unwrap().is_some());
        assert!(reader.put("x", &field(0)).is_err());
    }
}
