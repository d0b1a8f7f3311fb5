//! FDB configuration
//!
//! `FdbConfig` is a plain serde struct. It can come from defaults, a JSON
//! document, or `FDB_*` environment variables layered over either.

use crate::error::{FdbError, FdbResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FDB_";

/// Index engine behind a catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// One segment file per index, referenced by TOC records
    #[default]
    Toc,
    /// Shared sled store per database, sharded by index id.
    ///
    /// sled holds an exclusive lock on the store for as long as it is open,
    /// so only one process at a time can read or write a database with this
    /// engine. Threads of that process share the handle through
    /// `KvRegistry`. Use `Toc` for databases written by several processes.
    Kv,
}

impl EngineKind {
    /// 문자열로 변환
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Toc => "toc",
            EngineKind::Kv => "kv",
        }
    }

    /// 문자열에서 파싱
    pub fn parse_engine(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "toc" => Some(EngineKind::Toc),
            "kv" => Some(EngineKind::Kv),
            _ => None,
        }
    }
}

/// What a writer does when a datum key is archived twice into the same index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Keep the first Field, drop the new one silently
    Ignore,
    /// Replace and log a warning
    #[default]
    Warn,
    /// Refuse with `DuplicateEntry`
    Fail,
}

impl OverwritePolicy {
    pub fn parse_policy(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Some(OverwritePolicy::Ignore),
            "warn" => Some(OverwritePolicy::Warn),
            "fail" => Some(OverwritePolicy::Fail),
            _ => None,
        }
    }
}

/// One filesystem root that can hold database directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    pub path: PathBuf,
    /// New databases may be created here
    #[serde(default = "default_true")]
    pub writable: bool,
    /// Readers and listings look here
    #[serde(default = "default_true")]
    pub visit: bool,
}

impl RootConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writable: true,
            visit: true,
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writable: false,
            visit: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Catalogue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FdbConfig {
    pub roots: Vec<RootConfig>,
    /// Master schema, copied into every new database
    pub schema_path: PathBuf,
    pub engine: EngineKind,
    pub overwrite_policy: OverwritePolicy,
    /// Each writer session appends to a private sub-log
    pub use_sub_toc: bool,
    pub only_creator_can_write: bool,
    pub super_users: Vec<String>,
    /// Data records are padded to this boundary; 0 disables padding
    pub data_block_size: u64,
    /// Index segments a reader keeps materialised
    pub reader_open_index_limit: usize,
    /// `name_home` entries used by `~name/...` paths
    pub home_aliases: HashMap<String, String>,
}

impl Default for FdbConfig {
    fn default() -> Self {
        Self {
            roots: vec![RootConfig::new("./fdb_root")],
            schema_path: PathBuf::from("./schema"),
            engine: EngineKind::Toc,
            overwrite_policy: OverwritePolicy::Warn,
            use_sub_toc: false,
            only_creator_can_write: true,
            super_users: Vec::new(),
            data_block_size: 0,
            reader_open_index_limit: 64,
            home_aliases: HashMap::new(),
        }
    }
}

impl FdbConfig {
    /// Configuration with a single writable root and the given schema.
    pub fn with_root(root: impl Into<PathBuf>, schema_path: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![RootConfig::new(root)],
            schema_path: schema_path.into(),
            ..Self::default()
        }
    }

    /// JSON에서 로드
    pub fn from_json_str(json: &str) -> FdbResult<Self> {
        let config: FdbConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 파일에서 로드
    pub fn from_file(path: &Path) -> FdbResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Defaults with `FDB_*` environment overrides applied.
    pub fn from_env() -> FdbResult<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value.
    ///
    /// Recognised variables: `FDB_ROOTS` (colon separated), `FDB_SCHEMA`,
    /// `FDB_ENGINE`, `FDB_OVERWRITE_POLICY`, `FDB_USE_SUB_TOC`,
    /// `FDB_ONLY_CREATOR_CAN_WRITE`, `FDB_SUPER_USERS` (comma separated),
    /// `FDB_DATA_BLOCK_SIZE` and `FDB_READER_OPEN_INDEX_LIMIT`.
    pub fn apply_env<F>(&mut self, lookup: F) -> FdbResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(roots) = var("ROOTS") {
            self.roots = roots
                .split(':')
                .filter(|s| !s.is_empty())
                .map(|s| RootConfig::new(self.expand_path(s)))
                .collect();
        }
        if let Some(schema) = var("SCHEMA") {
            self.schema_path = self.expand_path(&schema);
        }
        if let Some(engine) = var("ENGINE") {
            self.engine = EngineKind::parse_engine(&engine)
                .ok_or_else(|| FdbError::Config(format!("unknown engine '{engine}'")))?;
        }
        if let Some(policy) = var("OVERWRITE_POLICY") {
            self.overwrite_policy = OverwritePolicy::parse_policy(&policy)
                .ok_or_else(|| FdbError::Config(format!("unknown overwrite policy '{policy}'")))?;
        }
        if let Some(value) = var("USE_SUB_TOC") {
            self.use_sub_toc = parse_flag(&value);
        }
        if let Some(value) = var("ONLY_CREATOR_CAN_WRITE") {
            self.only_creator_can_write = parse_flag(&value);
        }
        if let Some(users) = var("SUPER_USERS") {
            self.super_users = users
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(size) = var("DATA_BLOCK_SIZE") {
            self.data_block_size = size
                .parse()
                .map_err(|_| FdbError::Config(format!("bad data block size '{size}'")))?;
        }
        if let Some(limit) = var("READER_OPEN_INDEX_LIMIT") {
            self.reader_open_index_limit = limit
                .parse()
                .map_err(|_| FdbError::Config(format!("bad reader index limit '{limit}'")))?;
        }

        self.validate()
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> FdbResult<()> {
        if self.roots.is_empty() {
            return Err(FdbError::Config("no roots configured".to_string()));
        }
        if self.reader_open_index_limit == 0 {
            return Err(FdbError::Config(
                "reader_open_index_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Expands `~name/rest` through the `name_home` alias. Anything else is
    /// returned unchanged.
    pub fn expand_path(&self, path: &str) -> PathBuf {
        let Some(stripped) = path.strip_prefix('~') else {
            return PathBuf::from(path);
        };
        let (name, rest) = match stripped.find('/') {
            Some(pos) => (&stripped[..pos], &stripped[pos + 1..]),
            None => (stripped, ""),
        };
        match self.home_aliases.get(&format!("{name}_home")) {
            Some(home) if rest.is_empty() => PathBuf::from(home),
            Some(home) => Path::new(home).join(rest),
            None => PathBuf::from(path),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
