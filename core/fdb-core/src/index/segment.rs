//! File-backed index: one file per index, appended one segment per flush.
//!
//! Segment layout (little-endian):
//!
//! ```text
//! [magic u32][payload_len u32][crc32 u32][bincode Vec<(fingerprint, Field)>]
//! ```
//!
//! A segment is never rewritten once flushed. Its starting offset is the
//! location recorded in the TOC, so a reader loads exactly the segment an
//! INDEX record names.

use super::{Field, IndexBackend, IndexBackendKind, IndexLocation};
use crate::error::{FdbError, FdbResult};
use crate::sys::FileLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// "FDBI"
pub const SEGMENT_MAGIC: u32 = 0x4644_4249;
const SEGMENT_HEADER: usize = 12;
/// Upper bound on one segment payload; larger lengths mean a corrupt header.
const MAX_SEGMENT_LEN: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

#[derive(Debug)]
pub struct SegmentIndex {
    path: PathBuf,
    mode: Mode,
    /// Read: offset of the loaded segment. Write: offset of the last flush.
    offset: u64,
    entries: BTreeMap<String, Field>,
    lock: Option<FileLock>,
}

impl SegmentIndex {
    /// Creates an empty index file for writing.
    pub fn create(path: &Path) -> FdbResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            mode: Mode::Write,
            offset,
            entries: BTreeMap::new(),
            lock: None,
        })
    }

    /// Loads the segment at `location` for reading.
    pub fn open(location: &IndexLocation) -> FdbResult<Self> {
        let entries = read_segment(&location.path, location.offset)?;
        Ok(Self {
            path: location.path.clone(),
            mode: Mode::Read,
            offset: location.offset,
            entries,
            lock: None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_writable(&self, op: &str) -> FdbResult<()> {
        match self.mode {
            Mode::Write => Ok(()),
            Mode::Read => Err(FdbError::NotImplemented(format!(
                "{op} on read-only index {}",
                self.path.display()
            ))),
        }
    }
}

impl IndexBackend for SegmentIndex {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::Segment
    }

    fn location(&self) -> IndexLocation {
        IndexLocation::new(self.path.clone(), self.offset)
    }

    fn get(&self, fingerprint: &str) -> FdbResult<Option<Field>> {
        Ok(self.entries.get(fingerprint).cloned())
    }

    fn put(&mut self, fingerprint: &str, field: &Field) -> FdbResult<()> {
        self.ensure_writable("put")?;
        self.entries.insert(fingerprint.to_string(), field.clone());
        Ok(())
    }

    fn visit(&self, visitor: &mut dyn FnMut(&str, &Field) -> bool) -> FdbResult<()> {
        for (fingerprint, field) in &self.entries {
            if !visitor(fingerprint, field) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> FdbResult<IndexLocation> {
        self.ensure_writable("flush")?;

        let entries: Vec<(&String, &Field)> = self.entries.iter().collect();
        let payload = bincode::serialize(&entries)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_SEGMENT_LEN)
            .ok_or_else(|| FdbError::invalid_op("index segment too large", self.path.display().to_string()))?;

        let mut buf = Vec::with_capacity(SEGMENT_HEADER + payload.len());
        buf.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        file.sync_data()?;

        self.offset = offset;
        Ok(IndexLocation::new(self.path.clone(), offset))
    }

    fn reopen(&mut self) -> FdbResult<()> {
        self.ensure_writable("reopen")?;
        self.entries.clear();
        Ok(())
    }

    fn sync(&mut self) -> FdbResult<()> {
        if self.mode == Mode::Write {
            File::open(&self.path)?.sync_all()?;
        }
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
        self.funlock()?;
        self.entries.clear();
        Ok(())
    }
}

/// Reads one segment starting at `offset`.
pub fn read_segment(path: &Path, offset: u64) -> FdbResult<BTreeMap<String, Field>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; SEGMENT_HEADER];
    file.read_exact(&mut header)
        .map_err(|_| FdbError::corrupt(path, format!("truncated segment header at {offset}")))?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != SEGMENT_MAGIC {
        return Err(FdbError::corrupt(path, format!("bad segment magic at {offset}")));
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if len > MAX_SEGMENT_LEN {
        return Err(FdbError::corrupt(path, format!("segment length {len} at {offset}")));
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)
        .map_err(|_| FdbError::corrupt(path, format!("truncated segment at {offset}")))?;
    if crc32fast::hash(&payload) != crc {
        return Err(FdbError::corrupt(path, format!("segment checksum mismatch at {offset}")));
    }

    let entries: Vec<(String, Field)> = bincode::deserialize(&payload)
        .map_err(|e| FdbError::corrupt(path, format!("segment payload at {offset}: {e}")))?;
    Ok(entries.into_iter().collect())
}
