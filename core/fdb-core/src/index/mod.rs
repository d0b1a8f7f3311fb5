//! Index module: datum fingerprint → Field maps, one per index key.
//!
//! Two backends implement [`IndexBackend`]:
//! - [`segment::SegmentIndex`]: one file per index; every flush appends an
//!   immutable, checksummed segment to it.
//! - [`kv::KvIndex`]: entries live in a sled store shared by all indexes of a
//!   database, sharded by an 8-byte index id prefix.
//!
//! The catalogue only talks to [`Index`], which adds the key, the axes and
//! the dirty flag around a backend.

pub mod axis;
pub mod field;
pub mod kv;
pub mod segment;

pub use axis::IndexAxis;
pub use field::{Field, FieldLocation};
pub use kv::{KvIndex, KvRegistry};
pub use segment::SegmentIndex;

use crate::config::EngineKind;
use crate::error::{FdbError, FdbResult};
use crate::key::Key;
use crate::sys;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which backend persisted an index. Recorded in every INDEX record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexBackendKind {
    Segment,
    Kv,
}

impl IndexBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexBackendKind::Segment => "segment",
            IndexBackendKind::Kv => "kv",
        }
    }

    pub fn for_engine(engine: EngineKind) -> Self {
        match engine {
            EngineKind::Toc => IndexBackendKind::Segment,
            EngineKind::Kv => IndexBackendKind::Kv,
        }
    }
}

/// Where one immutable index segment lives: a path plus an offset (the
/// byte offset for segment files, the segment number for the KV store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexLocation {
    pub path: PathBuf,
    pub offset: u64,
}

impl IndexLocation {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }
}

impl fmt::Display for IndexLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.offset)
    }
}

/// Everything an INDEX record says about one flushed index segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Path relative to the database directory
    pub location: IndexLocation,
    pub backend: IndexBackendKind,
    pub key: Key,
    pub axes: IndexAxis,
    pub timestamp: u64,
}

/// Index storage interface.
///
/// # Contract
///
/// - `put`: upsert of a fingerprint in the current (unflushed) segment.
/// - `get`: `None` for absent fingerprints, never an error.
/// - `visit`: entries of this segment only; the callback returns `false`
///   to stop early.
/// - `flush`: persists the current segment and returns its location.
/// - `reopen`: starts a new, empty segment after a flush.
/// - `flock`/`funlock`: advisory exclusive lock held by the writer.
pub trait IndexBackend: Send {
    fn kind(&self) -> IndexBackendKind;

    /// Location of the current segment.
    fn location(&self) -> IndexLocation;

    fn get(&self, fingerprint: &str) -> FdbResult<Option<Field>>;

    fn exists(&self, fingerprint: &str) -> FdbResult<bool> {
        Ok(self.get(fingerprint)?.is_some())
    }

    fn put(&mut self, fingerprint: &str, field: &Field) -> FdbResult<()>;

    fn visit(&self, visitor: &mut dyn FnMut(&str, &Field) -> bool) -> FdbResult<()>;

    fn flush(&mut self) -> FdbResult<IndexLocation>;

    fn reopen(&mut self) -> FdbResult<()>;

    fn sync(&mut self) -> FdbResult<()>;

    fn flock(&mut self) -> FdbResult<()>;

    fn funlock(&mut self) -> FdbResult<()>;

    fn close(&mut self) -> FdbResult<()>;
}

/// Backend variant, matched in each method.
pub enum IndexVariant {
    Segment(SegmentIndex),
    Kv(KvIndex),
}

impl IndexVariant {
    fn backend(&self) -> &dyn IndexBackend {
        match self {
            Self::Segment(index) => index,
            Self::Kv(index) => index,
        }
    }

    fn backend_mut(&mut self) -> &mut dyn IndexBackend {
        match self {
            Self::Segment(index) => index,
            Self::Kv(index) => index,
        }
    }
}

/// Per-database state needed to create or open indexes.
#[derive(Debug, Clone)]
pub struct IndexContext {
    directory: PathBuf,
    kv: Arc<KvRegistry>,
}

impl IndexContext {
    pub fn new(directory: impl Into<PathBuf>, kv: Arc<KvRegistry>) -> Self {
        Self {
            directory: directory.into(),
            kv,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Shared sled store of the database.
    pub fn kv_store_path(&self) -> PathBuf {
        self.directory.join(kv::KV_STORE_NAME)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.directory.join(path)
        }
    }

    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.directory)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    /// Fresh, uniquely named index file for `key`.
    fn generate_path(&self, key: &Key) -> PathBuf {
        let mut stem: String = key
            .values_to_string()
            .chars()
            .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
            .collect();
        if stem.is_empty() {
            stem.push_str("index");
        }
        self.directory
            .join(format!("{stem}.{}.index", sys::unique_suffix()))
    }

    fn create_variant(&self, kind: IndexBackendKind, key: &Key) -> FdbResult<IndexVariant> {
        let path = self.generate_path(key);
        Ok(match kind {
            IndexBackendKind::Segment => IndexVariant::Segment(SegmentIndex::create(&path)?),
            IndexBackendKind::Kv => {
                let db = self.kv.open(&self.kv_store_path())?;
                IndexVariant::Kv(KvIndex::create(db, &path)?)
            }
        })
    }

    fn open_variant(&self, descriptor: &IndexDescriptor) -> FdbResult<IndexVariant> {
        let location = IndexLocation::new(
            self.resolve(&descriptor.location.path),
            descriptor.location.offset,
        );
        Ok(match descriptor.backend {
            IndexBackendKind::Segment => IndexVariant::Segment(SegmentIndex::open(&location)?),
            IndexBackendKind::Kv => {
                let store = self.kv_store_path();
                if !store.exists() {
                    return Err(FdbError::corrupt(
                        &location.path,
                        "kv index referenced but the shared store is missing",
                    ));
                }
                let db = self.kv.open(&store)?;
                IndexVariant::Kv(KvIndex::open(db, &location))
            }
        })
    }
}

/// An index key bound to a backend, with its axes.
pub struct Index {
    key: Key,
    variant: IndexVariant,
    axes: IndexAxis,
    timestamp: u64,
    dirty: bool,
}

impl Index {
    /// New, writable index with a unique file name.
    pub fn create(context: &IndexContext, kind: IndexBackendKind, key: &Key) -> FdbResult<Self> {
        Ok(Self {
            key: key.clone(),
            variant: context.create_variant(kind, key)?,
            axes: IndexAxis::new(),
            timestamp: field::now_secs(),
            dirty: false,
        })
    }

    /// Read-only view of one flushed segment.
    pub fn open(context: &IndexContext, descriptor: &IndexDescriptor) -> FdbResult<Self> {
        Ok(Self {
            key: descriptor.key.clone(),
            variant: context.open_variant(descriptor)?,
            axes: descriptor.axes.clone(),
            timestamp: descriptor.timestamp,
            dirty: false,
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn kind(&self) -> IndexBackendKind {
        self.variant.backend().kind()
    }

    pub fn location(&self) -> IndexLocation {
        self.variant.backend().location()
    }

    pub fn axes(&self) -> &IndexAxis {
        &self.axes
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn put(&mut self, datum: &Key, field: &Field) -> FdbResult<()> {
        self.variant.backend_mut().put(&datum.fingerprint(), field)?;
        self.axes.insert(datum);
        self.dirty = true;
        Ok(())
    }

    pub fn get(&self, datum: &Key) -> FdbResult<Option<Field>> {
        self.variant.backend().get(&datum.fingerprint())
    }

    pub fn exists(&self, datum: &Key) -> FdbResult<bool> {
        self.variant.backend().exists(&datum.fingerprint())
    }

    pub fn may_contain(&self, datum: &Key) -> bool {
        self.axes.may_contain(datum)
    }

    pub fn visit(&self, visitor: &mut dyn FnMut(&str, &Field) -> bool) -> FdbResult<()> {
        self.variant.backend().visit(visitor)
    }

    /// Persists the current segment. Returns the descriptor to record in the
    /// log, or `None` when nothing was put since the last flush.
    pub fn flush(&mut self, context: &IndexContext) -> FdbResult<Option<IndexDescriptor>> {
        if !self.dirty {
            return Ok(None);
        }
        let location = self.variant.backend_mut().flush()?;
        self.dirty = false;
        Ok(Some(IndexDescriptor {
            location: IndexLocation::new(context.relative(&location.path), location.offset),
            backend: self.kind(),
            key: self.key.clone(),
            axes: self.axes.clone(),
            timestamp: self.timestamp,
        }))
    }

    /// Starts a new segment; axes restart with it.
    pub fn reopen(&mut self) -> FdbResult<()> {
        self.variant.backend_mut().reopen()?;
        self.axes.clear();
        self.timestamp = field::now_secs();
        Ok(())
    }

    pub fn sync(&mut self) -> FdbResult<()> {
        self.variant.backend_mut().sync()
    }

    pub fn flock(&mut self) -> FdbResult<()> {
        self.variant.backend_mut().flock()
    }

    pub fn funlock(&mut self) -> FdbResult<()> {
        self.variant.backend_mut().funlock()
    }

    pub fn close(&mut self) -> FdbResult<()> {
        self.variant.backend_mut().close()
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("key", &self.key)
            .field("kind", &self.kind())
            .field("location", &self.location())
            .field("dirty", &self.dirty)
            .finish()
    }
}
