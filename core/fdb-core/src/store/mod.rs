//! Data stores: where field bytes live.
//!
//! The catalogue never looks inside a store. It hands over bytes, keeps the
//! returned [`FieldLocation`], and later asks for a reader over it.

pub mod file;

pub use file::FileStore;

use crate::error::{FdbError, FdbResult};
use crate::index::{Field, FieldLocation};
use crate::key::Key;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Field byte storage.
///
/// # Contract
///
/// - `archive`: stores one field for an index key and returns its
///   location. Bytes are durable only after `flush`.
/// - `retrieve`: reader over exactly the bytes of a location.
/// - `close`: flushes and releases handles; the store may not be used after.
pub trait Store: Send {
    fn archive(&mut self, index_key: &Key, data: &[u8]) -> FdbResult<FieldLocation>;

    fn retrieve(&self, field: &Field) -> FdbResult<Box<dyn Read + Send>> {
        open_location(field.location())
    }

    fn flush(&mut self) -> FdbResult<()>;

    fn close(&mut self) -> FdbResult<()>;

    /// Data files written by this store.
    fn data_paths(&self) -> Vec<PathBuf>;
}

/// Reader over the byte range of a location.
pub fn open_location(location: &FieldLocation) -> FdbResult<Box<dyn Read + Send>> {
    match location {
        FieldLocation::File {
            path,
            offset,
            length,
            ..
        } => {
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(*offset))?;
            Ok(Box::new(file.take(*length)))
        }
        FieldLocation::Uri { uri, .. } => Err(FdbError::NotImplemented(format!(
            "no store can read {uri}"
        ))),
    }
}

/// Reads a whole field, failing when the location is shorter than recorded.
pub fn read_field(location: &FieldLocation) -> FdbResult<Vec<u8>> {
    let mut reader = open_location(location)?;
    let mut buf = Vec::with_capacity(location.length() as usize);
    reader.read_to_end(&mut buf)?;
    if buf.len() as u64 != location.length() {
        return Err(FdbError::Store(format!(
            "short read from {location}: {} of {} bytes",
            buf.len(),
            location.length()
        )));
    }
    Ok(buf)
}
