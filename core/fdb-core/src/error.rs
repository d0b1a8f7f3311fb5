//! Error types for the FDB catalogue core.
//!
//! All public APIs return `FdbResult<T>`; library code does not panic.
//! A datum that is simply absent is not an error: lookups return `Option`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Unified error type for all catalogue operations.
#[derive(Debug, Error)]
pub enum FdbError {
    /// A key was routed to a database whose stored schema did not produce it
    #[error("database {database} is not consistent with key {key}")]
    SchemaMismatch { key: String, database: String },

    /// Second archive of the same datum under the `fail` overwrite policy
    #[error("duplicate entry: overwrite to FDB with key {key}")]
    DuplicateEntry { key: String },

    /// Unreadable record in a TOC log or index segment
    #[error("corrupt log {}: {reason}", .path.display())]
    CorruptLog { path: PathBuf, reason: String },

    /// Database directory owned by somebody else
    #[error("only user '{owner}' can write to FDB dir {}, current user is '{user}'", .path.display())]
    PermissionDenied {
        path: PathBuf,
        owner: String,
        user: String,
    },

    /// Capability not offered by the selected catalogue variant
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Schema text could not be parsed
    #[error("schema parse error at line {line}: {message}")]
    SchemaParse { line: usize, message: String },

    /// No rule of the schema accepts a key
    #[error("schema lookup failed: {0}")]
    SchemaLookup(String),

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// sled embedded database error
    #[error("sled error: {source}")]
    Sled {
        #[from]
        source: sled::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid operation
    #[error("invalid operation: {message}\nContext: {context}")]
    InvalidOperation { message: String, context: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Data store failure
    #[error("store error: {0}")]
    Store(String),
}

/// Result type alias for all catalogue operations.
pub type FdbResult<T> = Result<T, FdbError>;

impl FdbError {
    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        FdbError::CorruptLog {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_op(message: impl Into<String>, context: impl Into<String>) -> Self {
        FdbError::InvalidOperation {
            message: message.into(),
            context: context.into(),
        }
    }

    /// True when retrying or fanning out to sibling databases cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FdbError::CorruptLog { .. } | FdbError::NotImplemented(_) | FdbError::SchemaParse { .. }
        )
    }
}

// From 구현들
impl From<serde_json::Error> for FdbError {
    fn from(err: serde_json::Error) -> Self {
        FdbError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for FdbError {
    fn from(err: bincode::Error) -> Self {
        FdbError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_schema_mismatch() {
        let err = FdbError::SchemaMismatch {
            key: "{class=od}".to_string(),
            database: "{class=rd}".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "database {class=rd} is not consistent with key {class=od}"
        );
    }

    #[test]
    fn error_display_duplicate_entry() {
        let err = FdbError::DuplicateEntry {
            key: "{step=6}".to_string(),
        };
        assert!(err.to_string().contains("duplicate entry"));
        assert!(err.to_string().contains("{step=6}"));
    }

    #[test]
    fn error_display_permission_denied() {
        let err = FdbError::PermissionDenied {
            path: PathBuf::from("/data/od:0001"),
            owner: "alice".to_string(),
            user: "bob".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "only user 'alice' can write to FDB dir /data/od:0001, current user is 'bob'"
        );
    }

    #[test]
    fn error_display_corrupt_log() {
        let err = FdbError::corrupt(Path::new("/db/toc"), "bad marker");
        assert_eq!(err.to_string(), "corrupt log /db/toc: bad marker");
        assert!(err.is_fatal());
    }

    #[test]
    fn fatal_classification() {
        assert!(FdbError::NotImplemented("archive on reader".into()).is_fatal());
        assert!(!FdbError::SchemaLookup("no rule".into()).is_fatal());
        assert!(!FdbError::Store("short read".into()).is_fatal());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FdbError = io.into();
        assert!(matches!(err, FdbError::Io { .. }));
        assert!(err.to_string().starts_with("io error"));
    }

    #[test]
    fn error_display_invalid_operation() {
        let err = FdbError::invalid_op("archive without index", "call select_index first");
        assert!(err.to_string().contains("invalid operation"));
        assert!(err.to_string().contains("select_index"));
    }
}
