//! Per-entry modification history for modify-conflict resolution.
//!
//! For each attribute the history keeps the newest attribute-level
//! replace/delete CSN and per-value add/delete CSNs. Replaying a
//! modification consults this record so a late-arriving older write is
//! suppressed instead of overwriting a newer value, and concurrent
//! multi-valued edits merge the same way on every replica.
//!
//! The history travels with full initialization as an operational
//! attribute, so a freshly initialized replica resolves conflicts exactly
//! like the source.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::csn::Csn;
use larch_store::{Entry, ModKind, Modification};

/// Operational attribute carrying the serialized history on an entry.
pub const HIST_ATTR: &str = "ds-sync-hist";

/// Change history of one attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrHistory {
    /// Newest attribute-level replace CSN.
    pub last_replace: Option<Csn>,
    /// Newest attribute-level delete CSN.
    pub last_delete: Option<Csn>,
    /// Newest add CSN per value (keyed by lowercase value).
    pub value_adds: BTreeMap<String, Csn>,
    /// Newest delete CSN per value (keyed by lowercase value).
    pub value_deletes: BTreeMap<String, Csn>,
}

impl AttrHistory {
    fn newest_attr_level(&self) -> Option<Csn> {
        self.last_replace.max(self.last_delete)
    }
}

/// Change history of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryHistory {
    /// CSN the entry was created at. Decides the loser of an
    /// add/add naming conflict deterministically.
    pub created: Csn,
    /// Per-attribute histories.
    pub attrs: BTreeMap<String, AttrHistory>,
}

impl EntryHistory {
    /// Start a history for an entry created at `created`.
    pub fn new(created: Csn) -> Self {
        Self {
            created,
            attrs: BTreeMap::new(),
        }
    }

    /// Record the entry's initial attribute values as adds at creation time.
    pub fn record_initial(&mut self, attrs: &[(String, String)]) {
        let created = self.created;
        for (attr, value) in attrs {
            let h = self.attrs.entry(norm(attr)).or_default();
            h.value_adds.insert(norm(value), created);
        }
    }

    /// Filter one modification at `csn` against the history, returning the
    /// effective modification to apply (possibly rewritten) or `None` when
    /// it is entirely suppressed by newer recorded changes. The history is
    /// updated either way.
    ///
    /// `current_values` is the attribute's value set on the entry at apply
    /// time; values absent from the history are treated as older than any
    /// recorded CSN.
    pub fn filter(
        &mut self,
        m: &Modification,
        csn: Csn,
        current_values: Option<&Vec<String>>,
    ) -> Option<Modification> {
        let h = self.attrs.entry(norm(&m.attr)).or_default();
        match m.kind {
            ModKind::Replace => {
                if h.newest_attr_level().map(|c| c >= csn).unwrap_or(false) {
                    return None;
                }
                // Values added concurrently but later than this replace
                // survive it on every replica.
                let survivors: Vec<String> = h
                    .value_adds
                    .iter()
                    .filter(|(_, add_csn)| **add_csn > csn)
                    .map(|(v, _)| v.clone())
                    .collect();
                h.last_replace = Some(csn);
                h.value_adds.retain(|_, add_csn| *add_csn > csn);
                h.value_deletes.retain(|_, del_csn| *del_csn > csn);
                let mut values = Vec::new();
                for v in &m.values {
                    h.value_adds.insert(norm(v), csn);
                    values.push(v.clone());
                }
                for v in survivors {
                    if !values.iter().any(|x| norm(x) == v) {
                        values.push(v);
                    }
                }
                if values.is_empty() && !m.values.is_empty() {
                    return None;
                }
                Some(Modification::new(ModKind::Replace, &m.attr, values))
            }
            ModKind::Add => {
                let attr_floor = h.newest_attr_level();
                let mut kept = Vec::new();
                for v in &m.values {
                    let key = norm(v);
                    let shadowed = attr_floor.map(|c| c >= csn).unwrap_or(false)
                        || h.value_deletes.get(&key).map(|c| *c >= csn).unwrap_or(false)
                        || h.value_adds.get(&key).map(|c| *c >= csn).unwrap_or(false);
                    if !shadowed {
                        h.value_adds.insert(key, csn);
                        kept.push(v.clone());
                    }
                }
                if kept.is_empty() {
                    None
                } else {
                    Some(Modification::new(ModKind::Add, &m.attr, kept))
                }
            }
            ModKind::Delete => {
                if m.values.is_empty() {
                    // Whole-attribute delete: values added after it survive.
                    if h.newest_attr_level().map(|c| c >= csn).unwrap_or(false) {
                        return None;
                    }
                    h.last_delete = Some(csn);
                    let newer: Vec<String> = h
                        .value_adds
                        .iter()
                        .filter(|(_, add_csn)| **add_csn > csn)
                        .map(|(v, _)| v.clone())
                        .collect();
                    h.value_adds.retain(|_, add_csn| *add_csn > csn);
                    if newer.is_empty() {
                        return Some(Modification::new(ModKind::Delete, &m.attr, vec![]));
                    }
                    // Rewrite to delete only the values that predate it.
                    let doomed: Vec<String> = current_values
                        .map(|vals| {
                            vals.iter()
                                .filter(|v| !newer.contains(&norm(v)))
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    if doomed.is_empty() {
                        None
                    } else {
                        Some(Modification::new(ModKind::Delete, &m.attr, doomed))
                    }
                } else {
                    let mut kept = Vec::new();
                    for v in &m.values {
                        let key = norm(v);
                        let added_later =
                            h.value_adds.get(&key).map(|c| *c > csn).unwrap_or(false);
                        if !added_later {
                            h.value_deletes.insert(key.clone(), csn);
                            h.value_adds.remove(&key);
                            kept.push(v.clone());
                        }
                    }
                    if kept.is_empty() {
                        None
                    } else {
                        Some(Modification::new(ModKind::Delete, &m.attr, kept))
                    }
                }
            }
        }
    }

    /// Serialize the history for storage on the entry.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a history previously produced by [`Self::encode`].
    pub fn decode(s: &str) -> Option<EntryHistory> {
        serde_json::from_str(s).ok()
    }

    /// Attach the serialized history to an entry (used when snapshotting
    /// for full initialization).
    pub fn attach_to(&self, entry: &mut Entry) {
        entry
            .attrs
            .insert(HIST_ATTR.to_string(), vec![self.encode()]);
    }

    /// Extract and strip the history from an entry received during full
    /// initialization.
    pub fn detach_from(entry: &mut Entry) -> Option<EntryHistory> {
        let values = entry.attrs.remove(HIST_ATTR)?;
        values.first().and_then(|v| Self::decode(v))
    }
}

fn norm(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}
