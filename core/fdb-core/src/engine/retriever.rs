//! Retriever: fans a request out over every database it expands to.
//!
//! A failure inside one database is recorded and the walk moves on to the
//! next one. Only errors of the expansion itself end the call.

use super::EngineContext;
use crate::catalogue::{Catalogue, CatalogueReader};
use crate::error::{FdbError, FdbResult};
use crate::index::Field;
use crate::key::Key;
use crate::request::Request;
use crate::schema::{Predicate, ReadVisitor, TypeRegistry, request_values};
use ahash::AHashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A datum found by a retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedField {
    /// Database, index and datum keys concatenated
    pub key: Key,
    pub field: Field,
}

/// A database the walk could not use.
#[derive(Debug)]
pub struct RetrieveFailure {
    pub key: Key,
    pub error: FdbError,
}

#[derive(Debug, Default)]
pub struct RetrieveResult {
    pub fields: Vec<RetrievedField>,
    pub failures: Vec<RetrieveFailure>,
}

impl RetrieveResult {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when no database failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Field stored for `key`, compared on every keyword of `key`.
    pub fn find(&self, key: &Key) -> Option<&RetrievedField> {
        self.fields.iter().find(|f| f.key.partial_match(key))
    }
}

pub struct Retriever {
    context: Arc<EngineContext>,
}

impl Retriever {
    pub(crate) fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    #[instrument(skip(self), fields(request = %request))]
    pub fn retrieve(&self, request: &Request) -> FdbResult<RetrieveResult> {
        let mut visitor = RetrieveVisitor {
            context: &self.context,
            readers: AHashMap::new(),
            current: None,
            result: RetrieveResult::default(),
        };
        self.context.schema.expand(request, &mut visitor)?;
        let result = visitor.result;
        debug!(
            fields = result.fields.len(),
            failures = result.failures.len(),
            "retrieve finished"
        );
        Ok(result)
    }
}

struct RetrieveVisitor<'a> {
    context: &'a EngineContext,
    /// `None` for databases that are missing or failed to open
    readers: AHashMap<Key, Option<CatalogueReader>>,
    current: Option<Key>,
    result: RetrieveResult,
}

impl RetrieveVisitor<'_> {
    fn reader(&mut self) -> Option<&mut CatalogueReader> {
        let current = self.current.as_ref()?;
        self.readers.get_mut(current)?.as_mut()
    }

    fn fail(&mut self, key: &Key, error: FdbError) {
        warn!(key = %key, error = %error, "retrieve failed for database");
        self.result.failures.push(RetrieveFailure {
            key: key.clone(),
            error,
        });
    }

    fn open(&self, key: &Key) -> FdbResult<Option<CatalogueReader>> {
        match self.context.roots.existing_database(key)? {
            Some(directory) => self.context.open_reader(&directory, key),
            None => Ok(None),
        }
    }
}

impl ReadVisitor for RetrieveVisitor<'_> {
    /// Keywords the request leaves out expand to the values the current
    /// database actually holds.
    fn values(
        &mut self,
        request: &Request,
        predicate: &Predicate,
        types: &TypeRegistry,
        depth: usize,
    ) -> Vec<String> {
        let values = request_values(request, predicate, types);
        if !values.is_empty() || depth == 0 {
            return values;
        }
        let keyword = predicate.keyword();
        self.reader()
            .map(|reader| reader.axis_values(keyword, depth == 2).into_iter().collect())
            .unwrap_or_default()
    }

    fn select_database(&mut self, key: &Key, _full: &Key) -> FdbResult<bool> {
        if !self.readers.contains_key(key) {
            let reader = match self.open(key) {
                Ok(reader) => reader,
                Err(e) => {
                    self.fail(key, e);
                    None
                }
            };
            if reader.is_none() {
                debug!(db = %key, "database not available");
            }
            self.readers.insert(key.clone(), reader);
        }
        self.current = Some(key.clone());
        Ok(self.reader().is_some())
    }

    fn select_index(&mut self, key: &Key, full: &Key) -> FdbResult<bool> {
        let Some(reader) = self.reader() else {
            return Ok(false);
        };
        match reader.select_index(key) {
            Ok(found) => Ok(found),
            Err(e) => {
                self.fail(full, e);
                Ok(false)
            }
        }
    }

    fn select_datum(&mut self, key: &Key, full: &Key) -> FdbResult<bool> {
        let Some(reader) = self.reader() else {
            return Ok(false);
        };
        match reader.retrieve(key) {
            Ok(Some(field)) => {
                self.result.fields.push(RetrievedField {
                    key: full.clone(),
                    field,
                });
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.fail(full, e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FdbConfig;
    use crate::engine::Archiver;
    use crate::engine::tests::context;
    use crate::store::read_field;
    use tempfile::tempdir;

    fn key(expver: &str, step: &str) -> Key {
        Key::from_pairs([
            ("class", "od"),
            ("expver", expver),
            ("type", "fc"),
            ("levtype", "sfc"),
            ("step", step),
            ("param", "t"),
        ])
    }

    #[test]
    fn fan_out_over_databases() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), FdbConfig::default());
        let mut archiver = Archiver::new(ctx.clone());
        archiver.archive(&key("0001", "0"), b"one").unwrap();
        archiver.archive(&key("0002", "0"), b"two").unwrap();
        archiver.close().unwrap();

        let retriever = Retriever::new(ctx);
        let request =
            Request::parse("class=od,expver=0001/0002/0003,type=fc,levtype=sfc,step=0,param=t").unwrap();
        let result = retriever.retrieve(&request).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.is_complete());

        let second = result.find(&key("0002", "0")).unwrap();
        assert_eq!(read_field(second.field.location()).unwrap(), b"two");
    }

    #[test]
    fn missing_keywords_follow_the_axes() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), FdbConfig::default());
        let mut archiver = Archiver::new(ctx.clone());
        for step in ["0", "6", "12"] {
            archiver.archive(&key("0001", step), step.as_bytes()).unwrap();
        }
        archiver.close().unwrap();

        let request = Request::parse("class=od,expver=0001,type=fc,levtype=sfc,param=t").unwrap();
        let result = Retriever::new(ctx).retrieve(&request).unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn broken_database_does_not_stop_siblings() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), FdbConfig::default());
        let mut archiver = Archiver::new(ctx.clone());
        archiver.archive(&key("0001", "0"), b"one").unwrap();
        archiver.archive(&key("0002", "0"), b"two").unwrap();
        archiver.close().unwrap();

        std::fs::write(dir.path().join("root/od:0001/toc"), vec![b'x'; 1024]).unwrap();

        let request =
            Request::parse("class=od,expver=0001/0002,type=fc,levtype=sfc,step=0,param=t").unwrap();
        let result = Retriever::new(ctx).retrieve(&request).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].key.get("expver"), Some("0001"));
    }
}
