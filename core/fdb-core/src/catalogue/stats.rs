//! Per-database statistics.

use super::visitor::EntryVisitor;
use crate::index::Field;
use crate::key::Key;
use crate::toc::IndexEntry;
use ahash::AHashSet;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

/// Sizes and counts of one database, or the sum of several.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    pub databases: usize,
    pub toc_records: usize,
    pub toc_size: u64,
    pub schema_size: u64,
    pub sub_tocs: usize,
    /// Live index segments
    pub index_count: usize,
    /// Visible fields
    pub field_count: usize,
    pub field_bytes: u64,
    /// Fields shadowed by a newer segment
    pub duplicate_count: usize,
    pub duplicate_bytes: u64,
    pub data_files: BTreeSet<PathBuf>,
}

impl AddAssign<&DbStats> for DbStats {
    fn add_assign(&mut self, other: &DbStats) {
        self.databases += other.databases;
        self.toc_records += other.toc_records;
        self.toc_size += other.toc_size;
        self.schema_size += other.schema_size;
        self.sub_tocs += other.sub_tocs;
        self.index_count += other.index_count;
        self.field_count += other.field_count;
        self.field_bytes += other.field_bytes;
        self.duplicate_count += other.duplicate_count;
        self.duplicate_bytes += other.duplicate_bytes;
        self.data_files.extend(other.data_files.iter().cloned());
    }
}

impl fmt::Display for DbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Databases        : {}", self.databases)?;
        writeln!(f, "TOC records      : {}", self.toc_records)?;
        writeln!(f, "TOC size         : {} bytes", self.toc_size)?;
        writeln!(f, "Schema size      : {} bytes", self.schema_size)?;
        writeln!(f, "Sub-tocs         : {}", self.sub_tocs)?;
        writeln!(f, "Index segments   : {}", self.index_count)?;
        writeln!(f, "Fields           : {} ({} bytes)", self.field_count, self.field_bytes)?;
        writeln!(
            f,
            "Duplicated fields: {} ({} bytes)",
            self.duplicate_count, self.duplicate_bytes
        )?;
        write!(f, "Data files       : {}", self.data_files.len())
    }
}

/// Counts fields while visiting. The first field seen for a datum is live;
/// later ones, in older segments, are duplicates.
#[derive(Debug, Default)]
pub struct StatsVisitor {
    stats: DbStats,
    index_key: Key,
    seen: AHashSet<(Key, String)>,
}

impl StatsVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_stats(self) -> DbStats {
        self.stats
    }
}

impl EntryVisitor for StatsVisitor {
    fn visit_database(&mut self, _key: &Key, _directory: &Path) -> bool {
        self.stats.databases += 1;
        true
    }

    fn visit_index(&mut self, entry: &IndexEntry) -> bool {
        self.stats.index_count += 1;
        self.index_key = entry.key().clone();
        true
    }

    fn visit_datum(&mut self, datum: &Key, field: &Field) {
        if let Some(path) = field.location.path() {
            self.stats.data_files.insert(path.to_path_buf());
        }
        if self.seen.insert((self.index_key.clone(), datum.fingerprint())) {
            self.stats.field_count += 1;
            self.stats.field_bytes += field.length();
        } else {
            self.stats.duplicate_count += 1;
            self.stats.duplicate_bytes += field.length();
        }
    }
}
