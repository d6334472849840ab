//! Category hierarchy types and the read-only hierarchy lookup
//!
//! A taxonomy is an ordered list of four-level paths (N1 broadest, N4 most
//! specific). [`HierarchyLookup`] indexes one taxonomy for validation and
//! reverse lookup. It is built once per job and shared read-only (behind an
//! `Arc`) by every chunk worker of that job.

use crate::text;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Hierarchy level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    N1,
    N2,
    N3,
    N4,
}

impl Level {
    /// All levels, broadest first
    pub const ALL: [Level; 4] = [Level::N1, Level::N2, Level::N3, Level::N4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::N1 => "N1",
            Level::N2 => "N2",
            Level::N3 => "N3",
            Level::N4 => "N4",
        }
    }

    /// Zero-based depth (N1 = 0)
    pub fn depth(&self) -> usize {
        match self {
            Level::N1 => 0,
            Level::N2 => 1,
            Level::N3 => 2,
            Level::N4 => 3,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A four-level category path
///
/// Empty strings stand for levels that are not (yet) resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryPath {
    #[serde(rename = "N1", default)]
    pub n1: String,
    #[serde(rename = "N2", default)]
    pub n2: String,
    #[serde(rename = "N3", default)]
    pub n3: String,
    #[serde(rename = "N4", default)]
    pub n4: String,
}

/// One row of a client taxonomy
pub type TaxonomyEntry = CategoryPath;

impl CategoryPath {
    pub fn new(
        n1: impl Into<String>,
        n2: impl Into<String>,
        n3: impl Into<String>,
        n4: impl Into<String>,
    ) -> Self {
        Self {
            n1: n1.into(),
            n2: n2.into(),
            n3: n3.into(),
            n4: n4.into(),
        }
    }

    pub fn get(&self, level: Level) -> &str {
        match level {
            Level::N1 => &self.n1,
            Level::N2 => &self.n2,
            Level::N3 => &self.n3,
            Level::N4 => &self.n4,
        }
    }

    pub fn set(&mut self, level: Level, value: impl Into<String>) {
        let value = value.into();
        match level {
            Level::N1 => self.n1 = value,
            Level::N2 => self.n2 = value,
            Level::N3 => self.n3 = value,
            Level::N4 => self.n4 = value,
        }
    }

    /// True when no level carries a value
    pub fn is_empty(&self) -> bool {
        Level::ALL.iter().all(|l| self.get(*l).trim().is_empty())
    }

    /// Trimmed copy of every level
    pub fn trimmed(&self) -> Self {
        Self::new(self.n1.trim(), self.n2.trim(), self.n3.trim(), self.n4.trim())
    }

    /// Lower-cased, trimmed comparison key
    pub fn key(&self) -> PathKey {
        PathKey(
            text::key(&self.n1),
            text::key(&self.n2),
            text::key(&self.n3),
            text::key(&self.n4),
        )
    }
}

impl fmt::Display for CategoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > {} > {} > {}", self.n1, self.n2, self.n3, self.n4)
    }
}

/// Lower-cased (N1, N2, N3, N4) key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathKey(pub String, pub String, pub String, pub String);

/// Lower-cased (N1, N2, N3) ancestors of a leaf
pub type Ancestors = (String, String, String);

/// Read-only index over a taxonomy
///
/// All keys are trimmed and lower-cased. Entries without an N4 are skipped.
/// Ordered collections keep every traversal deterministic.
#[derive(Debug, Clone, Default)]
pub struct HierarchyLookup {
    entries: Vec<TaxonomyEntry>,
    valid_paths: BTreeSet<PathKey>,
    valid_values: [BTreeSet<String>; 4],
    n2_to_n1: BTreeMap<String, BTreeSet<String>>,
    n3_to_n1n2: BTreeMap<String, BTreeSet<(String, String)>>,
    n4_to_paths: BTreeMap<String, Vec<Ancestors>>,
    n1n2_to_n3s: BTreeMap<(String, String), BTreeSet<String>>,
    n1n2n3_to_n4s: BTreeMap<Ancestors, BTreeSet<String>>,
    canonical_case: BTreeMap<String, String>,
}

impl HierarchyLookup {
    /// Index `entries`
    pub fn new(entries: &[TaxonomyEntry]) -> Self {
        let mut lookup = Self::default();

        for entry in entries {
            let entry = entry.trimmed();
            if entry.n4.is_empty() {
                continue;
            }
            let PathKey(n1, n2, n3, n4) = entry.key();

            if !lookup.valid_paths.insert(PathKey(n1.clone(), n2.clone(), n3.clone(), n4.clone())) {
                continue;
            }
            lookup.entries.push(entry.clone());

            for (level, value) in Level::ALL.iter().zip([&n1, &n2, &n3, &n4]) {
                lookup.valid_values[level.depth()].insert(value.clone());
            }

            lookup.n2_to_n1.entry(n2.clone()).or_default().insert(n1.clone());
            lookup
                .n3_to_n1n2
                .entry(n3.clone())
                .or_default()
                .insert((n1.clone(), n2.clone()));
            lookup
                .n4_to_paths
                .entry(n4.clone())
                .or_default()
                .push((n1.clone(), n2.clone(), n3.clone()));
            lookup
                .n1n2_to_n3s
                .entry((n1.clone(), n2.clone()))
                .or_default()
                .insert(n3.clone());
            lookup
                .n1n2n3_to_n4s
                .entry((n1.clone(), n2.clone(), n3.clone()))
                .or_default()
                .insert(n4.clone());

            for original in [&entry.n1, &entry.n2, &entry.n3, &entry.n4] {
                lookup
                    .canonical_case
                    .entry(text::key(original))
                    .or_insert_with(|| original.clone());
            }
        }

        lookup
    }

    /// Distinct indexed paths, in taxonomy order
    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.valid_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid_paths.is_empty()
    }

    pub fn contains_path(&self, key: &PathKey) -> bool {
        self.valid_paths.contains(key)
    }

    /// Is `value` (lower-cased) a valid value at `level`?
    pub fn is_valid(&self, level: Level, value: &str) -> bool {
        self.valid_values[level.depth()].contains(value)
    }

    /// All valid values at `level`
    pub fn values(&self, level: Level) -> &BTreeSet<String> {
        &self.valid_values[level.depth()]
    }

    /// Possible N1 parents of an N2 value
    pub fn n1_parents(&self, n2: &str) -> Option<&BTreeSet<String>> {
        self.n2_to_n1.get(n2)
    }

    /// Possible (N1, N2) parents of an N3 value
    pub fn n1n2_parents(&self, n3: &str) -> Option<&BTreeSet<(String, String)>> {
        self.n3_to_n1n2.get(n3)
    }

    /// Every (N1, N2, N3) a leaf appears under
    pub fn leaf_paths(&self, n4: &str) -> &[Ancestors] {
        self.n4_to_paths.get(n4).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Valid N3 children of (N1, N2)
    pub fn n3_children(&self, n1: &str, n2: &str) -> Option<&BTreeSet<String>> {
        self.n1n2_to_n3s.get(&(n1.to_string(), n2.to_string()))
    }

    /// Valid leaves of (N1, N2, N3)
    pub fn leaves(&self, n1: &str, n2: &str, n3: &str) -> Option<&BTreeSet<String>> {
        self.n1n2n3_to_n4s
            .get(&(n1.to_string(), n2.to_string(), n3.to_string()))
    }

    /// Original display casing for a value, or the value itself when unknown
    pub fn canonical(&self, value: &str) -> String {
        self.canonical_case
            .get(&text::key(value))
            .cloned()
            .unwrap_or_else(|| value.to_string())
    }

    /// Display-cased path for four lower-cased levels
    pub fn canonical_path(&self, n1: &str, n2: &str, n3: &str, n4: &str) -> CategoryPath {
        CategoryPath::new(
            self.canonical(n1),
            self.canonical(n2),
            self.canonical(n3),
            self.canonical(n4),
        )
    }
}
