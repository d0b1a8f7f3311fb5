//! TOC record codec.
//!
//! Every record is a fixed 128-byte little-endian header followed by a
//! bincode payload, zero padded to a multiple of [`RECORD_ALIGNMENT`]:
//!
//! ```text
//! off  size  field
//!   0     2  marker "42"
//!   2     1  tag (i INIT, x INDEX, c CLEAR, s SUBTOC)
//!   3     1  tag version
//!   4     4  writer version
//!   8     8  timestamp seconds
//!  16     8  timestamp microseconds
//!  24     4  pid
//!  28     4  uid
//!  32    64  hostname, NUL padded
//!  96     4  payload length
//! 100     4  payload crc32
//! 104    24  reserved
//! ```

use crate::error::{FdbError, FdbResult};
use crate::index::IndexDescriptor;
use crate::key::Key;
use crate::sys;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const RECORD_MARKER: [u8; 2] = *b"42";
pub const RECORD_HEADER_SIZE: usize = 128;
pub const RECORD_ALIGNMENT: usize = 512;
pub const WRITER_VERSION: u32 = 1;
pub const TAG_VERSION: u8 = 1;

const HOSTNAME_LEN: usize = 64;
/// Upper bound on one payload; larger lengths mean a corrupt header.
const MAX_PAYLOAD: u32 = 1 << 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTag {
    Init,
    Index,
    Clear,
    SubToc,
}

impl RecordTag {
    pub fn as_byte(&self) -> u8 {
        match self {
            RecordTag::Init => b'i',
            RecordTag::Index => b'x',
            RecordTag::Clear => b'c',
            RecordTag::SubToc => b's',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'i' => Some(RecordTag::Init),
            b'x' => Some(RecordTag::Index),
            b'c' => Some(RecordTag::Clear),
            b's' => Some(RecordTag::SubToc),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordTag::Init => "TOC_INIT",
            RecordTag::Index => "TOC_INDEX",
            RecordTag::Clear => "TOC_CLEAR",
            RecordTag::SubToc => "TOC_SUB_TOC",
        }
    }
}

/// What a CLEAR record retracts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClearTarget {
    /// One index segment, as announced by an INDEX record
    Index { path: PathBuf, offset: u64 },
    /// A whole sub-log and everything it announced
    SubToc { path: PathBuf },
}

impl fmt::Display for ClearTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClearTarget::Index { path, offset } => write!(f, "index {}:{offset}", path.display()),
            ClearTarget::SubToc { path } => write!(f, "sub-toc {}", path.display()),
        }
    }
}

/// Record payloads. All paths are relative to the database directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TocPayload {
    Init { key: Key, schema_digest: u64 },
    Index(IndexDescriptor),
    Clear(ClearTarget),
    SubToc { path: PathBuf },
}

impl TocPayload {
    pub fn tag(&self) -> RecordTag {
        match self {
            TocPayload::Init { .. } => RecordTag::Init,
            TocPayload::Index(_) => RecordTag::Index,
            TocPayload::Clear(_) => RecordTag::Clear,
            TocPayload::SubToc { .. } => RecordTag::SubToc,
        }
    }
}

/// Who wrote a record, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub tag: RecordTag,
    pub tag_version: u8,
    pub writer_version: u32,
    pub timestamp_sec: i64,
    pub timestamp_usec: i64,
    pub pid: u32,
    pub uid: u32,
    pub hostname: String,
}

impl RecordHeader {
    fn new(tag: RecordTag) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            tag,
            tag_version: TAG_VERSION,
            writer_version: WRITER_VERSION,
            timestamp_sec: now.as_secs() as i64,
            timestamp_usec: i64::from(now.subsec_micros()),
            pid: std::process::id(),
            uid: sys::current_uid(),
            hostname: sys::hostname(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocRecord {
    pub header: RecordHeader,
    pub payload: TocPayload,
}

impl TocRecord {
    /// Stamps a payload with this process's identity and the current time.
    pub fn new(payload: TocPayload) -> Self {
        Self {
            header: RecordHeader::new(payload.tag()),
            payload,
        }
    }

    pub fn tag(&self) -> RecordTag {
        self.header.tag
    }

    /// Header, payload and zero padding up to the record alignment.
    pub fn encode(&self) -> FdbResult<Vec<u8>> {
        let payload = bincode::serialize(&self.payload)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD)
            .ok_or_else(|| FdbError::invalid_op("toc payload too large", self.tag().name()))?;

        let h = &self.header;
        let mut buf = Vec::with_capacity(padded_len(RECORD_HEADER_SIZE + payload.len()));
        buf.extend_from_slice(&RECORD_MARKER);
        buf.push(h.tag.as_byte());
        buf.push(h.tag_version);
        buf.extend_from_slice(&h.writer_version.to_le_bytes());
        buf.extend_from_slice(&h.timestamp_sec.to_le_bytes());
        buf.extend_from_slice(&h.timestamp_usec.to_le_bytes());
        buf.extend_from_slice(&h.pid.to_le_bytes());
        buf.extend_from_slice(&h.uid.to_le_bytes());

        let mut host = [0u8; HOSTNAME_LEN];
        let name = h.hostname.as_bytes();
        let n = name.len().min(HOSTNAME_LEN - 1);
        host[..n].copy_from_slice(&name[..n]);
        buf.extend_from_slice(&host);

        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.resize(RECORD_HEADER_SIZE, 0);
        buf.extend_from_slice(&payload);
        buf.resize(padded_len(buf.len()), 0);
        Ok(buf)
    }
}

pub fn padded_len(len: usize) -> usize {
    len.div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_i64(bytes: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(b)
}

/// Decodes every record of a log file image.
///
/// A record cut short at the end of the file is a torn append from a writer
/// that died mid-write: it is dropped with a warning and the prefix is
/// returned. Any other damage is `CorruptLog`.
pub fn decode_all(path: &Path, bytes: &[u8]) -> FdbResult<Vec<TocRecord>> {
    decode_prefix(path, bytes).map(|(records, _)| records)
}

/// Like [`decode_all`], also returning the aligned offset just past the last
/// complete record. Appends belong at that offset: anything beyond it is a
/// torn tail, and a complete record missing part of its padding is padded
/// back out.
pub fn decode_prefix(path: &Path, bytes: &[u8]) -> FdbResult<(Vec<TocRecord>, usize)> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if rest.len() < RECORD_HEADER_SIZE {
            warn!(path = %path.display(), offset = pos, "torn record header at end of log ignored");
            break;
        }
        if rest[..2] != RECORD_MARKER {
            return Err(FdbError::corrupt(path, format!("bad record marker at {pos}")));
        }
        let tag = RecordTag::from_byte(rest[2])
            .ok_or_else(|| FdbError::corrupt(path, format!("unknown record tag {:#04x} at {pos}", rest[2])))?;

        let len = le_u32(rest, 96);
        let crc = le_u32(rest, 100);
        if len > MAX_PAYLOAD {
            return Err(FdbError::corrupt(path, format!("payload length {len} at {pos}")));
        }
        let end = RECORD_HEADER_SIZE + len as usize;
        if rest.len() < end {
            warn!(path = %path.display(), offset = pos, "torn record payload at end of log ignored");
            break;
        }

        let payload_bytes = &rest[RECORD_HEADER_SIZE..end];
        if crc32fast::hash(payload_bytes) != crc {
            return Err(FdbError::corrupt(path, format!("record checksum mismatch at {pos}")));
        }
        let payload: TocPayload = bincode::deserialize(payload_bytes)
            .map_err(|e| FdbError::corrupt(path, format!("record payload at {pos}: {e}")))?;
        if payload.tag() != tag {
            return Err(FdbError::corrupt(
                path,
                format!("{} header carries a {} payload at {pos}", tag.name(), payload.tag().name()),
            ));
        }

        let host = &rest[32..32 + HOSTNAME_LEN];
        let host_len = host.iter().position(|b| *b == 0).unwrap_or(HOSTNAME_LEN);
        let header = RecordHeader {
            tag,
            tag_version: rest[3],
            writer_version: le_u32(rest, 4),
            timestamp_sec: le_i64(rest, 8),
            timestamp_usec: le_i64(rest, 16),
            pid: le_u32(rest, 24),
            uid: le_u32(rest, 28),
            hostname: String::from_utf8_lossy(&host[..host_len]).into_owned(),
        };
        records.push(TocRecord { header, payload });

        pos += padded_len(end);
    }

    Ok((records, pos))
}
