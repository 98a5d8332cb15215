//! # Data Model
//!
//! Core data structures for occurrence identity: records and their terms,
//! composite business keys and the stable identifiers minted for them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Reserved separator between the parts of a composite key.
pub const KEY_SEPARATOR: char = '|';

/// Escape prefix used to keep [`KEY_SEPARATOR`] out of joined term values.
const KEY_ESCAPE: char = '\\';

/// Darwin Core term names used by the well-known key forms.
pub mod dwc {
    pub const INSTITUTION_CODE: &str = "institutionCode";
    pub const COLLECTION_CODE: &str = "collectionCode";
    pub const CATALOG_NUMBER: &str = "catalogNumber";
    pub const OCCURRENCE_ID: &str = "occurrenceID";
}

/// A record field name, stored by its simple name.
///
/// Qualified names such as `http://rs.tdwg.org/dwc/terms/catalogNumber` or
/// `dwc:catalogNumber` are reduced to `catalogNumber`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Term(String);

impl Term {
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref().trim();
        let simple = name
            .rsplit(|c| matches!(c, '/' | '#' | ':'))
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(name);
        Self(simple.to_string())
    }

    pub fn simple_name(&self) -> &str {
        &self.0
    }

    /// Parse a comma separated term list, skipping blank entries.
    pub fn parse_list(raw: &str) -> Vec<Term> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Term::new)
            .collect()
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Term::new(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::new(value)
    }
}

impl From<Term> for String {
    fn from(term: Term) -> Self {
        term.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A verbatim occurrence record: an id plus raw term values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    /// Record id within the source archive
    pub id: String,
    /// Raw core term values keyed by term
    #[serde(default)]
    pub terms: HashMap<Term, String>,
}

impl OccurrenceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            terms: HashMap::new(),
        }
    }

    /// Builder-style setter for a single term value.
    pub fn with_term(mut self, term: impl Into<Term>, value: impl Into<String>) -> Self {
        self.terms.insert(term.into(), value.into());
        self
    }

    /// The raw value stored for `term`, if any.
    pub fn raw_value(&self, term: &Term) -> Option<&str> {
        self.terms.get(term).map(String::as_str)
    }

    /// The trimmed value for `term`, treating blanks and a literal `null` as absent.
    pub fn value(&self, term: &Term) -> Option<&str> {
        let value = self.raw_value(term)?.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("null") {
            None
        } else {
            Some(value)
        }
    }
}

/// Derived business key: dataset id followed by the non-empty term values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// Join the dataset id and the ordered values, escaping the separator.
    ///
    /// Callers guarantee `values` is non-empty.
    pub(crate) fn join<'a>(dataset_id: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut key = String::with_capacity(dataset_id.len() + 32);
        push_escaped(&mut key, dataset_id.trim());
        for value in values {
            key.push(KEY_SEPARATOR);
            push_escaped(&mut key, value);
        }
        Self(key)
    }

    /// Wrap a key string read back from a store or a report.
    ///
    /// Returns `None` for an empty string, which is never a valid key.
    pub fn from_stored(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        if ch == KEY_SEPARATOR || ch == KEY_ESCAPE {
            out.push(KEY_ESCAPE);
        }
        out.push(ch);
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CompositeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stable identifier minted once per composite key.
///
/// Ordering follows the 128-bit value, which matches the ordering of the
/// hyphenated lowercase text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Generate a fresh random identifier.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for Identifier {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
