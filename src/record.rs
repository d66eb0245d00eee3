use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::LinkageError;

/// Which input a record came from when two datasets are linked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn tag(&self) -> &'static str {
        match self {
            Side::A => "A",
            Side::B => "B",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

///
/// Identity of one input row for the lifetime of a run.
///
/// Dedup mode uses bare ordinals (`3`); link mode namespaces the ordinal with
/// the side tag (`A|3`) so ids from the two files never collide and the side
/// can be recovered from the id alone.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    side: Option<Side>,
    ordinal: usize,
}

impl RecordId {
    pub fn new(side: Option<Side>, ordinal: usize) -> Self {
        RecordId { side, ordinal }
    }

    pub fn bare(ordinal: usize) -> Self {
        RecordId::new(None, ordinal)
    }

    pub fn tagged(side: Side, ordinal: usize) -> Self {
        RecordId::new(Some(side), ordinal)
    }

    pub fn side(&self) -> Option<Side> {
        self.side
    }

    /// Zero-based row position in the original file, header excluded.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.side {
            Some(side) => write!(f, "{}|{}", side, self.ordinal),
            None => write!(f, "{}", self.ordinal),
        }
    }
}

impl FromStr for RecordId {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad_id = || LinkageError::input(format!("malformed record id '{s}'"));
        let (side, ordinal) = match s.split_once('|') {
            Some(("A", ordinal)) => (Some(Side::A), ordinal),
            Some(("B", ordinal)) => (Some(Side::B), ordinal),
            Some(_) => return Err(bad_id()),
            None => (None, s),
        };
        let ordinal = ordinal.parse().map_err(|_| bad_id())?;
        Ok(RecordId::new(side, ordinal))
    }
}

///
/// Normalized view of a row used only for comparison, never for output.
///
/// Every value has been case-folded, whitespace-collapsed and quote-stripped;
/// blank cells become `None`.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Option<String>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes `raw` before storing it under `field`.
    pub fn insert_raw(&mut self, field: &str, raw: &str) {
        self.fields.insert(field.to_string(), normalize(raw));
    }

    pub fn insert(&mut self, field: &str, value: Option<String>) {
        self.fields.insert(field.to_string(), value);
    }

    /// Normalized value of `field`; `None` when blank or absent.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Option<String>> {
        self.fields.remove(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Structural composite key over `match_fields`. Blank values take part
    /// in the key, so two rows blank on every match field share a key.
    pub fn exact_key<'a, S: AsRef<str>>(&'a self, match_fields: &[S]) -> ExactKey<'a> {
        ExactKey(
            match_fields
                .iter()
                .map(|field| self.get(field.as_ref()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: AsRef<str>> FromIterator<(K, V)> for Record {
    /// Builds a record from raw cell values, normalizing each one.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (field, raw) in iter {
            let field: String = field.into();
            record.insert_raw(&field, raw.as_ref());
        }
        record
    }
}

/// Ordered tuple of normalized match-field values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExactKey<'a>(Vec<Option<&'a str>>);

///
/// Cleans a raw cell for comparison: newlines become spaces, runs of spaces
/// collapse to one, surrounding quotes and whitespace are stripped and the
/// text is lower-cased. An empty result is `None`.
///
pub fn normalize(raw: &str) -> Option<String> {
    let mut collapsed = String::with_capacity(raw.len());
    let mut previous_space = false;
    for c in raw.chars() {
        let c = if c == '\n' || c == '\r' { ' ' } else { c };
        if c == ' ' {
            if !previous_space {
                collapsed.push(' ');
            }
            previous_space = true;
        } else {
            collapsed.push(c);
            previous_space = false;
        }
    }
    let cleaned = collapsed
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_lowercase();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
