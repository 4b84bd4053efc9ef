//! Directory entries, attributes, and modifications.

use crate::dn::Dn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Operational attribute recording that an entry was renamed to resolve a
/// naming conflict. Holds the DN the entry originally asked for.
pub const CONFLICT_ATTR: &str = "ds-sync-conflict";

/// Immutable unique identifier assigned to an entry at creation.
///
/// The identifier never changes for the life of the entry; the DN may
/// change any number of times through renames.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntryId(pub Uuid);

impl EntryId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modification kinds, mirroring the directory modify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModKind {
    /// Add the given values to the attribute.
    Add,
    /// Delete the given values, or the whole attribute when no values given.
    Delete,
    /// Replace the attribute's values with the given set.
    Replace,
}

/// A single attribute modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    /// Modification kind.
    pub kind: ModKind,
    /// Attribute type (normalized to lowercase on construction).
    pub attr: String,
    /// Values carried by the modification.
    pub values: Vec<String>,
}

impl Modification {
    /// Build a modification, normalizing the attribute type.
    pub fn new(kind: ModKind, attr: &str, values: Vec<String>) -> Self {
        Self {
            kind,
            attr: attr.trim().to_ascii_lowercase(),
            values,
        }
    }

    /// Shorthand for a single-value replace.
    pub fn replace(attr: &str, value: &str) -> Self {
        Self::new(ModKind::Replace, attr, vec![value.to_string()])
    }

    /// Shorthand for a single-value add.
    pub fn add(attr: &str, value: &str) -> Self {
        Self::new(ModKind::Add, attr, vec![value.to_string()])
    }

    /// Shorthand for deleting a whole attribute.
    pub fn delete_attr(attr: &str) -> Self {
        Self::new(ModKind::Delete, attr, vec![])
    }
}

/// A directory entry: immutable id, current DN, attribute map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Immutable unique identifier.
    pub id: EntryId,
    /// Current DN; changes only through rename.
    pub dn: Dn,
    /// Attributes keyed by lowercase type.
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Build an entry from (attr, value) pairs.
    pub fn new(id: EntryId, dn: Dn, attrs: Vec<(String, String)>) -> Self {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (attr, value) in attrs {
            map.entry(attr.trim().to_ascii_lowercase())
                .or_default()
                .push(value);
        }
        Self {
            id,
            dn,
            attrs: map,
        }
    }

    /// All values of an attribute.
    pub fn get(&self, attr: &str) -> Option<&Vec<String>> {
        self.attrs.get(&attr.trim().to_ascii_lowercase())
    }

    /// First value of an attribute.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.get(attr).and_then(|v| v.first()).map(|s| s.as_str())
    }

    /// Case-insensitive value membership check.
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.get(attr)
            .map(|vals| vals.iter().any(|v| v.eq_ignore_ascii_case(value)))
            .unwrap_or(false)
    }

    /// Apply one modification in place.
    pub fn apply(&mut self, m: &Modification) {
        match m.kind {
            ModKind::Add => {
                let vals = self.attrs.entry(m.attr.clone()).or_default();
                for v in &m.values {
                    if !vals.iter().any(|x| x.eq_ignore_ascii_case(v)) {
                        vals.push(v.clone());
                    }
                }
            }
            ModKind::Delete => {
                if m.values.is_empty() {
                    self.attrs.remove(&m.attr);
                } else if let Some(vals) = self.attrs.get_mut(&m.attr) {
                    vals.retain(|x| !m.values.iter().any(|v| x.eq_ignore_ascii_case(v)));
                    if vals.is_empty() {
                        self.attrs.remove(&m.attr);
                    }
                }
            }
            ModKind::Replace => {
                if m.values.is_empty() {
                    self.attrs.remove(&m.attr);
                } else {
                    self.attrs.insert(m.attr.clone(), m.values.clone());
                }
            }
        }
    }

    /// Mark the entry as conflict-renamed, recording the DN it asked for.
    pub fn set_conflict_marker(&mut self, wanted_dn: &Dn) {
        self.attrs
            .insert(CONFLICT_ATTR.to_string(), vec![wanted_dn.to_string()]);
    }

    /// The conflict marker value, if present.
    pub fn conflict_marker(&self) -> Option<&str> {
        self.first(CONFLICT_ATTR)
    }
}
