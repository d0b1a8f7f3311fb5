//! Field and FieldLocation: where the bytes of one datum live.

use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Location of one datum's bytes, produced by a Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldLocation {
    /// Byte range inside a local file
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
        remap_key: Option<Key>,
    },
    /// Byte range inside an object named by URI
    Uri {
        uri: String,
        offset: u64,
        length: u64,
        remap_key: Option<Key>,
    },
}

impl FieldLocation {
    pub fn file(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        FieldLocation::File {
            path: path.into(),
            offset,
            length,
            remap_key: None,
        }
    }

    pub fn uri(&self) -> String {
        match self {
            FieldLocation::File { path, .. } => format!("file://{}", path.display()),
            FieldLocation::Uri { uri, .. } => uri.clone(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            FieldLocation::File { path, .. } => Some(path),
            FieldLocation::Uri { .. } => None,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            FieldLocation::File { offset, .. } | FieldLocation::Uri { offset, .. } => *offset,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            FieldLocation::File { length, .. } | FieldLocation::Uri { length, .. } => *length,
        }
    }

    pub fn remap_key(&self) -> Option<&Key> {
        match self {
            FieldLocation::File { remap_key, .. } | FieldLocation::Uri { remap_key, .. } => {
                remap_key.as_ref()
            }
        }
    }

    /// Same location tagged with a remap key. An empty key clears it.
    pub fn with_remap_key(mut self, key: &Key) -> Self {
        let slot = match &mut self {
            FieldLocation::File { remap_key, .. } | FieldLocation::Uri { remap_key, .. } => {
                remap_key
            }
        };
        *slot = (!key.is_empty()).then(|| key.clone());
        self
    }
}

impl fmt::Display for FieldLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, +{}]", self.uri(), self.offset(), self.length())?;
        if let Some(remap) = self.remap_key() {
            write!(f, " remap {remap}")?;
        }
        Ok(())
    }
}

/// Immutable record of where a datum was archived, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub location: FieldLocation,
    /// Seconds since the epoch
    pub timestamp: u64,
}

impl Field {
    pub fn new(location: FieldLocation) -> Self {
        Self {
            location,
            timestamp: now_secs(),
        }
    }

    pub fn location(&self) -> &FieldLocation {
        &self.location
    }

    pub fn length(&self) -> u64 {
        self.location.length()
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
