//! Series label sets, fingerprints and profile-type identifiers.

use crate::error::DbError;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;

/// 64-bit hash of a sorted label set. Equal label sets always share a fingerprint.
pub type Fingerprint = u64;

pub const LABEL_NAME_METRIC: &str = "__name__";
pub const LABEL_NAME_PROFILE_TYPE: &str = "__profile_type__";
pub const LABEL_NAME_TYPE: &str = "__type__";
pub const LABEL_NAME_UNIT: &str = "__unit__";
pub const LABEL_NAME_PERIOD_TYPE: &str = "__period_type__";
pub const LABEL_NAME_PERIOD_UNIT: &str = "__period_unit__";
/// Set to `"false"` by clients that already send delta values for a cumulative type.
pub const LABEL_NAME_DELTA: &str = "__delta__";

const SEP: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelPair {
    pub name: String,
    pub value: String,
}

impl LabelPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A label set kept sorted by name, with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<LabelPair>);

impl Labels {
    /// Builds a label set. Later duplicates of a name win; empty values are dropped.
    pub fn new(mut pairs: Vec<LabelPair>) -> Self {
        pairs.reverse();
        // stable sort keeps the last occurrence first for each name
        pairs.sort_by(|a, b| a.name.cmp(&b.name));
        pairs.dedup_by(|next, kept| next.name == kept.name);
        pairs.retain(|p| !p.value.is_empty());
        Labels(pairs)
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().map(|(n, v)| LabelPair::new(*n, *v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelPair> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<LabelPair> {
        self.0
    }

    /// Returns a copy with `name` set to `value`.
    pub fn with(&self, name: &str, value: &str) -> Labels {
        let mut pairs = self.0.clone();
        pairs.push(LabelPair::new(name, value));
        Labels::new(pairs)
    }

    /// Keeps only the labels whose names appear in `names`.
    pub fn subset(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|p| names.iter().any(|n| n == &p.name))
                .cloned()
                .collect(),
        )
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut h = FxHasher::default();
        for p in &self.0 {
            h.write(p.name.as_bytes());
            h.write_u8(SEP);
            h.write(p.value.as_bytes());
            h.write_u8(SEP);
        }
        h.finish()
    }

    /// Approximate heap footprint, used for head size accounting.
    pub fn size_bytes(&self) -> u64 {
        self.0
            .iter()
            .map(|p| (p.name.len() + p.value.len() + 48) as u64)
            .sum()
    }
}

impl Ord for Labels {
    /// Pairwise comparison by name then value; a strict prefix sorts first.
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.name.cmp(&b.name) {
                Ordering::Equal => {}
                o => return o,
            }
            match a.value.cmp(&b.value) {
                Ordering::Equal => {}
                o => return o,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for Labels {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", p.name, p.value)?;
        }
        f.write_str("}")
    }
}

impl FromIterator<LabelPair> for Labels {
    fn from_iter<I: IntoIterator<Item = LabelPair>>(iter: I) -> Self {
        Labels::new(iter.into_iter().collect())
    }
}

/// Identifies what a profile measures, e.g. `process_cpu:cpu:nanoseconds:cpu:nanoseconds`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileType {
    pub name: String,
    pub sample_type: String,
    pub sample_unit: String,
    pub period_type: String,
    pub period_unit: String,
}

impl ProfileType {
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.name, self.sample_type, self.sample_unit, self.period_type, self.period_unit
        )
    }

    /// Parses `name:sample_type:sample_unit:period_type:period_unit`.
    pub fn parse(id: &str) -> Result<Self, DbError> {
        let parts: Vec<&str> = id.split(':').collect();
        if parts.len() != 5 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(DbError::InvalidSelector(format!(
                "profile type {:?} must have the form name:type:unit:period_type:period_unit",
                id
            )));
        }
        Ok(Self {
            name: parts[0].to_string(),
            sample_type: parts[1].to_string(),
            sample_unit: parts[2].to_string(),
            period_type: parts[3].to_string(),
            period_unit: parts[4].to_string(),
        })
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}
