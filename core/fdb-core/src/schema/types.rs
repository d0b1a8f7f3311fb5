//! Keyword types.
//!
//! A type canonicalises raw values before they are matched or stored, so
//! `step=006` and `step=6` name the same datum.

use crate::request::Request;
use ahash::AHashMap;
use std::borrow::Cow;

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Value type attached to a keyword by a schema declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeywordType {
    /// Value used as-is
    #[default]
    Default,
    /// Experiment version, zero-padded to 4 characters
    Expver,
    /// Forecast step or step range (`0-6`)
    Step,
    /// Integer without leading zeros
    Integer,
    /// `YYYYMMDD`
    Date,
    /// `month * 100 + day`
    ClimateDaily,
    /// Accepted but never part of identity
    Ignore,
}

impl KeywordType {
    /// Type by its schema name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Default" => Some(KeywordType::Default),
            "Expver" => Some(KeywordType::Expver),
            "Step" => Some(KeywordType::Step),
            "Integer" => Some(KeywordType::Integer),
            "Date" => Some(KeywordType::Date),
            "ClimateDaily" => Some(KeywordType::ClimateDaily),
            "Ignore" => Some(KeywordType::Ignore),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeywordType::Default => "Default",
            KeywordType::Expver => "Expver",
            KeywordType::Step => "Step",
            KeywordType::Integer => "Integer",
            KeywordType::Date => "Date",
            KeywordType::ClimateDaily => "ClimateDaily",
            KeywordType::Ignore => "Ignore",
        }
    }

    /// True when values of this type take part in keys.
    pub fn is_identity(&self) -> bool {
        !matches!(self, KeywordType::Ignore)
    }

    /// Canonical form of `value`. Values a type cannot interpret are
    /// returned unchanged, so they simply fail to match.
    pub fn canonical<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            KeywordType::Default => Cow::Borrowed(value),
            KeywordType::Ignore => Cow::Borrowed(""),
            KeywordType::Expver => {
                if value.len() >= 4 {
                    Cow::Borrowed(value)
                } else {
                    Cow::Owned(format!("{value:0>4}"))
                }
            }
            KeywordType::Integer => strip_zeros(value),
            KeywordType::Step => canonical_step(value),
            KeywordType::Date => canonical_date(value),
            KeywordType::ClimateDaily => canonical_climate_daily(value),
        }
    }
}

fn strip_zeros(value: &str) -> Cow<'_, str> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Cow::Borrowed(value);
    }
    let trimmed = value.trim_start_matches('0');
    if trimmed.is_empty() {
        Cow::Borrowed("0")
    } else {
        Cow::Borrowed(trimmed)
    }
}

fn canonical_step(value: &str) -> Cow<'_, str> {
    match value.split_once('-') {
        Some((from, to)) if !from.is_empty() => {
            let from = strip_zeros(from);
            let to = strip_zeros(to);
            if from == to {
                Cow::Owned(from.into_owned())
            } else {
                Cow::Owned(format!("{from}-{to}"))
            }
        }
        _ => strip_zeros(value),
    }
}

fn canonical_date(value: &str) -> Cow<'_, str> {
    let bytes = value.as_bytes();
    if bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && value.bytes().filter(u8::is_ascii_digit).count() == 8
    {
        return Cow::Owned(value.replace('-', ""));
    }
    Cow::Borrowed(value)
}

fn canonical_climate_daily(value: &str) -> Cow<'_, str> {
    let date = canonical_date(value);
    if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) {
        let month: u32 = date[4..6].parse().unwrap_or(0);
        let day: u32 = date[6..8].parse().unwrap_or(0);
        if (1..=12).contains(&month) && (1..=31).contains(&day) {
            return Cow::Owned((month * 100 + day).to_string());
        }
        return Cow::Borrowed(value);
    }

    // mmm-dd
    if let Some((month, day)) = value.split_once('-') {
        let month = month.to_ascii_lowercase();
        if let (Some(m), Ok(d)) = (
            MONTHS.iter().position(|name| *name == month),
            day.parse::<u32>(),
        ) && (1..=31).contains(&d)
        {
            return Cow::Owned(((m as u32 + 1) * 100 + d).to_string());
        }
    }
    Cow::Borrowed(value)
}

/// Keyword → type table built from a schema's declarations.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: AHashMap<String, KeywordType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: impl Into<String>, ty: KeywordType) {
        self.types.insert(keyword.into(), ty);
    }

    /// Type of a keyword; undeclared keywords are `Default`.
    pub fn lookup(&self, keyword: &str) -> KeywordType {
        self.types.get(keyword).copied().unwrap_or_default()
    }

    pub fn canonical<'a>(&self, keyword: &str, value: &'a str) -> Cow<'a, str> {
        self.lookup(keyword).canonical(value)
    }

    /// Request with every value canonicalised and duplicates removed.
    pub fn canonical_request(&self, request: &Request) -> Request {
        let mut out = Request::new();
        for keyword in request.keywords() {
            let mut values: Vec<String> = Vec::new();
            for value in request.values(keyword) {
                let value = self.canonical(keyword, value).into_owned();
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            out.set_values(keyword, values);
        }
        out
    }

    /// Declared pairs sorted by keyword.
    pub fn declarations(&self) -> Vec<(&str, KeywordType)> {
        let mut out: Vec<(&str, KeywordType)> =
            self.types.iter().map(|(k, t)| (k.as_str(), *t)).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}
