//! RootManager: which filesystem root holds a database.

use crate::config::FdbConfig;
use crate::error::{FdbError, FdbResult};
use crate::key::Key;
use crate::request::Request;
use crate::toc::{TOC_FILE, TocHandler, TocOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Root {
    path: PathBuf,
    writable: bool,
    visit: bool,
}

/// A database found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLocation {
    pub key: Key,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RootManager {
    roots: Vec<Root>,
}

impl RootManager {
    pub fn new(config: &FdbConfig) -> Self {
        let roots = config
            .roots
            .iter()
            .map(|r| Root {
                path: config.expand_path(&r.path.to_string_lossy()),
                writable: r.writable,
                visit: r.visit,
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> + '_ {
        self.roots.iter().map(|r| r.path.as_path())
    }

    /// Directory name of a database under any root.
    pub fn directory_name(key: &Key) -> String {
        key.values_to_string()
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect()
    }

    /// Existing database directory for `key`, if exactly one visitable root
    /// holds it.
    ///
    /// A directory whose INIT key is a different key with the same directory
    /// name belongs to another database and is a `Config` error. An INIT key
    /// with a different directory name is an adopted database and is
    /// accepted; its readers remap locations.
    pub fn existing_database(&self, key: &Key) -> FdbResult<Option<PathBuf>> {
        let name = Self::directory_name(key);
        let mut found = self
            .roots
            .iter()
            .filter(|r| r.visit)
            .map(|r| r.path.join(&name))
            .filter(|dir| dir.join(TOC_FILE).is_file());

        let first = found.next();
        if let Some(other) = found.next() {
            return Err(FdbError::Config(format!(
                "database {key} found under more than one root: {} and {}",
                first.as_deref().unwrap_or(Path::new("?")).display(),
                other.display()
            )));
        }
        // an empty log is a database another writer is still initialising
        let initialised = |dir: &&PathBuf| fs::metadata(dir.join(TOC_FILE)).is_ok_and(|m| m.len() > 0);
        if let Some(dir) = first.as_ref().filter(initialised) {
            let stored = TocHandler::new(dir, key, TocOptions::default()).database_key()?;
            if stored != *key && Self::directory_name(&stored) == name {
                return Err(FdbError::Config(format!(
                    "{} holds database {stored}, not {key}",
                    dir.display()
                )));
            }
        }
        Ok(first)
    }

    /// Directory a writer should use for `key`.
    pub fn directory(&self, key: &Key) -> FdbResult<PathBuf> {
        if let Some(existing) = self.existing_database(key)? {
            return Ok(existing);
        }
        let root = self
            .roots
            .iter()
            .find(|r| r.writable)
            .ok_or_else(|| FdbError::Config(format!("no writable root for database {key}")))?;
        Ok(root.path.join(Self::directory_name(key)))
    }

    /// Databases under the visitable roots whose key matches `request`.
    ///
    /// Directories without a log are ignored; unreadable logs are logged and
    /// skipped.
    pub fn visitable_databases(&self, request: &Request) -> Vec<DatabaseLocation> {
        let mut out = Vec::new();
        for root in self.roots.iter().filter(|r| r.visit) {
            let Ok(entries) = fs::read_dir(&root.path) else {
                debug!(root = %root.path.display(), "root not readable");
                continue;
            };
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.join(TOC_FILE).is_file())
                .collect();
            dirs.sort();

            for dir in dirs {
                let toc = TocHandler::new(&dir, &Key::new(), TocOptions::default());
                match toc.database_key() {
                    Ok(key) if key.match_request(request) => {
                        out.push(DatabaseLocation { key, path: dir })
                    }
                    Ok(_) => {}
                    Err(e) => error!(db = %dir.display(), error = %e, "cannot read database key"),
                }
            }
        }
        out
    }
}
