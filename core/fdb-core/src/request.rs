//! Multi-valued retrieval requests (`class=od,step=0/6/12`).

use crate::error::{FdbError, FdbResult};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request holds one or more candidate values per keyword. Read-side
/// schema expansion iterates the cartesian product of these values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    params: Vec<(String, Vec<String>)>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `k1=v1/v2,k2=v3`.
    pub fn parse(text: &str) -> FdbResult<Self> {
        let mut request = Request::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| FdbError::invalid_op("malformed request", text.to_string()))?;
            let values: Vec<String> = v
                .split('/')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if k.trim().is_empty() || values.is_empty() {
                return Err(FdbError::invalid_op("malformed request", text.to_string()));
            }
            request.set_values(k.trim(), values);
        }
        Ok(request)
    }

    /// Values for a keyword; empty when the request does not mention it.
    pub fn values(&self, keyword: &str) -> &[String] {
        self.params
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn set_values<I, S>(&mut self, keyword: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        match self.params.iter_mut().find(|(k, _)| k == keyword) {
            Some(entry) => entry.1 = values,
            None => self.params.push((keyword.to_string(), values)),
        }
    }

    pub fn unset_values(&mut self, keyword: &str) {
        self.params.retain(|(k, _)| k != keyword);
    }

    pub fn has(&self, keyword: &str) -> bool {
        self.params.iter().any(|(k, _)| k == keyword)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> + '_ {
        self.params.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// True when `value` is acceptable for `keyword`. Keywords the request
    /// does not mention accept anything.
    pub fn allows(&self, keyword: &str, value: &str) -> bool {
        match self.params.iter().find(|(k, _)| k == keyword) {
            Some((_, values)) => values.iter().any(|v| v == value),
            None => true,
        }
    }

    /// Number of value combinations the request spans.
    pub fn count(&self) -> usize {
        self.params.iter().map(|(_, v)| v.len()).product()
    }
}

impl From<&Key> for Request {
    fn from(key: &Key) -> Self {
        let mut request = Request::new();
        for (k, v) in key.iter() {
            request.set_values(k, [v]);
        }
        request
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, values)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={}", values.join("/"))?;
        }
        Ok(())
    }
}
