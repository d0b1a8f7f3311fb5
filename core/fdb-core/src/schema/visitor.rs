//! Visitor traits driven by schema expansion.

use super::predicate::Predicate;
use super::types::TypeRegistry;
use crate::error::FdbResult;
use crate::key::Key;
use crate::request::Request;

/// Read-side visitor.
///
/// `select_database` and `select_index` return `false` to prune the subtree
/// below them; `select_datum` is called once per fully expanded datum key.
pub trait ReadVisitor {
    /// Candidate values for a predicate's keyword, canonicalised.
    ///
    /// `depth` is the level being expanded (0 database, 1 index, 2 datum).
    fn values(
        &mut self,
        request: &Request,
        predicate: &Predicate,
        types: &TypeRegistry,
        depth: usize,
    ) -> Vec<String> {
        let _ = depth;
        request_values(request, predicate, types)
    }

    fn select_database(&mut self, key: &Key, full: &Key) -> FdbResult<bool>;

    fn select_index(&mut self, key: &Key, full: &Key) -> FdbResult<bool>;

    fn select_datum(&mut self, key: &Key, full: &Key) -> FdbResult<bool>;
}

/// Write-side visitor. Values come from the key being archived, so there is
/// no `values` hook.
pub trait WriteVisitor {
    fn select_database(&mut self, key: &Key, full: &Key) -> FdbResult<bool>;

    fn select_index(&mut self, key: &Key, full: &Key) -> FdbResult<bool>;

    fn select_datum(&mut self, key: &Key, full: &Key) -> FdbResult<bool>;
}

/// Canonical, de-duplicated request values for a predicate. An optional
/// predicate absent from the request yields its default.
pub fn request_values(request: &Request, predicate: &Predicate, types: &TypeRegistry) -> Vec<String> {
    let keyword = predicate.keyword();
    let raw = request.values(keyword);
    if raw.is_empty() {
        return predicate
            .default_value()
            .map(|d| vec![d.to_string()])
            .unwrap_or_default();
    }

    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for value in raw {
        let value = types.canonical(keyword, value).into_owned();
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::predicate::Matcher;
    use crate::schema::types::KeywordType;

    #[test]
    fn request_values_canonicalise_and_dedupe() {
        let mut types = TypeRegistry::new();
        types.insert("step", KeywordType::Step);
        let request = Request::parse("step=0/06/6/12").unwrap();
        let predicate = Predicate::new("step", Matcher::Any);
        assert_eq!(request_values(&request, &predicate, &types), ["0", "6", "12"]);
    }

    #[test]
    fn optional_default_when_absent() {
        let types = TypeRegistry::new();
        let request = Request::new();
        let optional = Predicate::new("levelist", Matcher::Optional("1000".into()));
        assert_eq!(request_values(&request, &optional, &types), ["1000"]);
        let any = Predicate::new("param", Matcher::Any);
        assert!(request_values(&request, &any, &types).is_empty());
    }
}
