//! Entry visitors: walk every datum a reader can see.

use crate::index::Field;
use crate::key::Key;
use crate::request::Request;
use crate::toc::IndexEntry;
use ahash::AHashSet;
use std::path::{Path, PathBuf};

/// Callbacks driven by [`Catalogue::visit_entries`](super::Catalogue::visit_entries).
///
/// # Contract
///
/// - `visit_database` is called once, first. Returning `false` skips the
///   whole database.
/// - `visit_index` is called per live segment, newest first. Returning
///   `false` skips that segment.
/// - `visit_datum` is called per stored fingerprint, including those
///   shadowed by a newer segment.
/// - `catalogue_complete` is called once after the last segment.
pub trait EntryVisitor {
    fn visit_database(&mut self, key: &Key, directory: &Path) -> bool {
        let _ = (key, directory);
        true
    }

    fn visit_index(&mut self, entry: &IndexEntry) -> bool {
        let _ = entry;
        true
    }

    fn visit_datum(&mut self, datum: &Key, field: &Field);

    fn catalogue_complete(&mut self) {}
}

/// One listed datum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListElement {
    pub db_key: Key,
    pub index_key: Key,
    pub datum_key: Key,
    pub field: Field,
    pub directory: PathBuf,
}

impl ListElement {
    /// Database, index and datum keys concatenated.
    pub fn full_key(&self) -> Key {
        self.db_key.merged(&self.index_key).merged(&self.datum_key)
    }
}

/// Collects the visible data matching a request.
///
/// Only the newest field of each datum is kept; older segments holding the
/// same fingerprint are shadowed.
#[derive(Debug, Default)]
pub struct ListVisitor {
    request: Request,
    db_key: Option<Key>,
    directory: PathBuf,
    index_key: Option<Key>,
    seen: AHashSet<(Key, Key, String)>,
    elements: Vec<ListElement>,
}

impl ListVisitor {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            ..Self::default()
        }
    }

    pub fn elements(&self) -> &[ListElement] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<ListElement> {
        self.elements
    }
}

impl EntryVisitor for ListVisitor {
    fn visit_database(&mut self, key: &Key, directory: &Path) -> bool {
        if !key.match_request(&self.request) {
            return false;
        }
        self.db_key = Some(key.clone());
        self.directory = directory.to_path_buf();
        true
    }

    fn visit_index(&mut self, entry: &IndexEntry) -> bool {
        if !entry.key().match_request(&self.request) {
            self.index_key = None;
            return false;
        }
        self.index_key = Some(entry.key().clone());
        true
    }

    fn visit_datum(&mut self, datum: &Key, field: &Field) {
        let (Some(db_key), Some(index_key)) = (&self.db_key, &self.index_key) else {
            return;
        };
        if !datum.match_request(&self.request) {
            return;
        }
        let seen = (db_key.clone(), index_key.clone(), datum.fingerprint());
        if !self.seen.insert(seen) {
            return;
        }
        self.elements.push(ListElement {
            db_key: db_key.clone(),
            index_key: index_key.clone(),
            datum_key: datum.clone(),
            field: field.clone(),
            directory: self.directory.clone(),
        });
    }

    fn catalogue_complete(&mut self) {
        self.db_key = None;
        self.index_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FieldLocation, IndexAxis, IndexBackendKind, IndexDescriptor, IndexLocation};

    fn entry(levtype: &str, offset: u64) -> IndexEntry {
        IndexEntry {
            descriptor: IndexDescriptor {
                location: IndexLocation::new("idx", offset),
                backend: IndexBackendKind::Segment,
                key: Key::from_pairs([("levtype", levtype)]),
                axes: IndexAxis::new(),
                timestamp: 0,
            },
            remap_key: Key::new(),
            in_sub_toc: false,
        }
    }

    fn field(offset: u64) -> Field {
        Field::new(FieldLocation::file("/d", offset, 1))
    }

    #[test]
    fn shadowed_data_is_listed_once() {
        let mut visitor = ListVisitor::new(Request::new());
        let db = Key::from_pairs([("class", "od")]);
        let datum = Key::from_pairs([("step", "0")]);

        assert!(visitor.visit_database(&db, Path::new("/db")));
        assert!(visitor.visit_index(&entry("sfc", 1)));
        visitor.visit_datum(&datum, &field(9));
        assert!(visitor.visit_index(&entry("sfc", 0)));
        visitor.visit_datum(&datum, &field(1));
        visitor.catalogue_complete();

        let elements = visitor.into_elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].field.location.offset(), 9);
        assert_eq!(
            elements[0].full_key().to_string(),
            "{class=od,levtype=sfc,step=0}"
        );
    }

    #[test]
    fn request_filters_each_level() {
        let request = Request::parse("levtype=pl,step=6").unwrap();
        let mut visitor = ListVisitor::new(request);
        let db = Key::from_pairs([("class", "od")]);

        assert!(visitor.visit_database(&db, Path::new("/db")));
        assert!(!visitor.visit_index(&entry("sfc", 0)));
        assert!(visitor.visit_index(&entry("pl", 1)));
        visitor.visit_datum(&Key::from_pairs([("step", "0")]), &field(0));
        visitor.visit_datum(&Key::from_pairs([("step", "6")]), &field(1));
        assert_eq!(visitor.elements().len(), 1);

        let other = Key::from_pairs([("levtype", "sfc")]);
        assert!(!visitor.visit_database(&other, Path::new("/other")));
    }
}
