//! Local file store: one data file per index key and session.

use super::Store;
use crate::error::FdbResult;
use crate::index::FieldLocation;
use crate::key::Key;
use crate::sys;
use ahash::AHashMap;
use std::collections::hash_map::Entry;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
struct DataFile {
    path: PathBuf,
    file: File,
}

impl DataFile {
    /// Appends `data` and returns its offset.
    ///
    /// The offset is taken from the file length, not from a running
    /// counter, and a failed write is cut back off the file, so one short
    /// write never shifts the locations of later fields.
    fn append(&mut self, data: &[u8], block_size: u64) -> FdbResult<u64> {
        let end = self.file.metadata()?.len();
        let offset = if block_size > 0 { end.next_multiple_of(block_size) } else { end };
        let trailing = if block_size > 0 {
            (block_size - data.len() as u64 % block_size) % block_size
        } else {
            0
        };

        let written = self
            .file
            .write_all(&vec![0u8; (offset - end) as usize])
            .and_then(|()| self.file.write_all(data))
            .and_then(|()| self.file.write_all(&vec![0u8; trailing as usize]));
        if let Err(e) = written {
            if let Err(trim) = self.file.set_len(end) {
                warn!(path = %self.path.display(), error = %trim, "failed to trim partial field");
            }
            return Err(e.into());
        }
        Ok(offset)
    }
}

#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    /// Fields start on multiples of this; 0 packs them back to back
    block_size: u64,
    files: AHashMap<Key, DataFile>,
    closed: Vec<PathBuf>,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>, block_size: u64) -> Self {
        Self {
            directory: directory.into(),
            block_size,
            files: AHashMap::new(),
            closed: Vec::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn data_file(&mut self, index_key: &Key) -> FdbResult<&mut DataFile> {
        match self.files.entry(index_key.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let data_file = create_data_file(&self.directory, index_key)?;
                Ok(entry.insert(data_file))
            }
        }
    }
}

fn create_data_file(directory: &Path, index_key: &Key) -> FdbResult<DataFile> {
    let mut stem: String = index_key
        .values_to_string()
        .chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect();
    if stem.is_empty() {
        stem.push_str("data");
    }
    fs::create_dir_all(directory)?;
    let path = directory.join(format!("{stem}.{}.data", sys::unique_suffix()));
    let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
    debug!(path = %path.display(), "data file created");
    Ok(DataFile { path, file })
}

impl Store for FileStore {
    fn archive(&mut self, index_key: &Key, data: &[u8]) -> FdbResult<FieldLocation> {
        let block_size = self.block_size;
        let data_file = self.data_file(index_key)?;

        let offset = data_file.append(data, block_size)?;
        Ok(FieldLocation::file(&data_file.path, offset, data.len() as u64))
    }

    fn flush(&mut self) -> FdbResult<()> {
        for data_file in self.files.values_mut() {
            data_file.file.flush()?;
            data_file.file.sync_data()?;
        }
        Ok(())
    }

    fn close(&mut self) -> FdbResult<()> {
        self.flush()?;
        self.closed
            .extend(self.files.drain().map(|(_, data_file)| data_file.path));
        Ok(())
    }

    fn data_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .files
            .values()
            .map(|f| f.path.clone())
            .chain(self.closed.iter().cloned())
            .collect();
        paths.sort();
        paths
    }
}
