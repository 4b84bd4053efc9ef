//! Deterministic conflict resolution.
//!
//! Invoked once a message's structural dependencies are satisfied (or it
//! was escalated as an anomaly). Every rule yields exactly one outcome
//! given the same set of delivered messages, independent of arrival order,
//! so all replicas converge to the same final tree.
//!
//! Outcomes that required no operator attention (stale DN, suppressed
//! older modify, delete of a replaced entry) count as *resolved*; outcomes
//! that visibly changed placement or naming (add/add rename, orphan
//! relocation) count as *unresolved* and raise one alert each.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::csn::Csn;
use crate::historical::EntryHistory;
use crate::update::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg, UpdateMessage};
use larch_store::{
    DirectoryStore, Dn, Entry, EntryId, ModKind, Modification, Rdn, StoreError,
};

/// Per-domain conflict counters, observable for diagnosis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCounters {
    /// Modify conflicts settled silently by the historical state.
    pub resolved_modify: u64,
    /// Naming conflicts settled silently (stale DN, replaced target).
    pub resolved_naming: u64,
    /// Naming conflicts that changed placement/naming and were alerted.
    pub unresolved_naming: u64,
}

/// Operator alert raised for an unresolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAlert {
    /// Where the entry ended up.
    pub dn: String,
    /// The DN it originally asked for.
    pub wanted_dn: String,
    /// CSN of the conflicting operation.
    pub csn: Csn,
    /// Human-readable cause.
    pub reason: String,
}

/// Terminal outcome of replaying one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The operation applied as sent.
    Applied,
    /// The operation resolved to a no-op (duplicate, replaced target,
    /// vanished parent); nothing visible changed.
    ResolvedNoop,
    /// The operation applied, but an entry was conflict-renamed.
    ConflictRenamed {
        /// The DN the entry was placed at.
        new_dn: Dn,
    },
}

const MAX_ALERTS: usize = 128;

/// The conflict resolution engine for one domain.
#[derive(Debug)]
pub struct ConflictEngine {
    suffix: Dn,
    counters: ConflictCounters,
    alerts: Vec<ConflictAlert>,
}

impl ConflictEngine {
    /// Engine for a domain rooted at `suffix`.
    pub fn new(suffix: Dn) -> Self {
        Self {
            suffix,
            counters: ConflictCounters::default(),
            alerts: Vec::new(),
        }
    }

    /// Current counters.
    pub fn counters(&self) -> ConflictCounters {
        self.counters
    }

    /// Alerts raised so far (bounded ring, oldest dropped).
    pub fn alerts(&self) -> &[ConflictAlert] {
        &self.alerts
    }

    /// Deterministic disambiguating RDN for a conflict-renamed entry:
    /// `entryuuid=<unique id>` prepended to the RDN it asked for.
    pub fn conflict_rdn(entry_id: EntryId, wanted: &Rdn) -> Rdn {
        wanted.prepend("entryuuid", &entry_id.to_string())
    }

    /// Replay one message whose dependencies are satisfied (or which was
    /// escalated as a structural anomaly).
    pub fn apply(
        &mut self,
        store: &dyn DirectoryStore,
        histories: &mut HashMap<EntryId, EntryHistory>,
        msg: &UpdateMessage,
    ) -> ApplyOutcome {
        match msg {
            UpdateMessage::Add(add) => self.apply_add(store, histories, add),
            UpdateMessage::Delete(del) => self.apply_delete(store, histories, del),
            UpdateMessage::Modify(m) => self.apply_modify(store, histories, m),
            UpdateMessage::ModifyDn(mdn) => self.apply_modify_dn(store, histories, mdn),
        }
    }

    fn apply_add(
        &mut self,
        store: &dyn DirectoryStore,
        histories: &mut HashMap<EntryId, EntryHistory>,
        add: &AddMsg,
    ) -> ApplyOutcome {
        if store.find_by_id(add.entry_id).is_some() {
            debug!(entry_id = %add.entry_id, "add replay: entry already present");
            return ApplyOutcome::ResolvedNoop;
        }

        // Resolve the target DN under the parent's *current* location; the
        // DN in the message may be stale if the parent moved.
        let (target_dn, orphaned) = match add.parent_id {
            None => (add.dn.clone(), false),
            Some(pid) => match store.find_by_id(pid) {
                Some(parent) => {
                    let dn = parent.dn.child(add.dn.rdn().clone());
                    if dn != add.dn {
                        self.counters.resolved_naming += 1;
                    }
                    (dn, false)
                }
                // Parent deleted or never arrived: place under the domain
                // root, conflict-marked, rather than dropping the entry.
                None => (
                    self.suffix
                        .child(Self::conflict_rdn(add.entry_id, add.dn.rdn())),
                    true,
                ),
            },
        };

        let mut history = EntryHistory::new(add.csn);
        history.record_initial(&add.attrs);

        let mut entry = Entry::new(add.entry_id, target_dn.clone(), add.attrs.clone());
        if orphaned {
            entry.set_conflict_marker(&add.dn);
        }

        match store.add_entry(entry) {
            Ok(()) => {
                histories.insert(add.entry_id, history);
                if orphaned {
                    self.raise_alert(&target_dn, &add.dn, add.csn, "parent deleted before add");
                    ApplyOutcome::ConflictRenamed { new_dn: target_dn }
                } else {
                    ApplyOutcome::Applied
                }
            }
            Err(StoreError::AlreadyExists { existing_id, dn }) => {
                self.resolve_add_add(store, histories, add, history, existing_id, dn)
            }
            Err(e) => {
                warn!(entry_id = %add.entry_id, error = %e, "add replay failed");
                ApplyOutcome::ResolvedNoop
            }
        }
    }

    /// Two entries with different unique ids claimed the same DN. The
    /// entry created at the *later* CSN loses its name, in both delivery
    /// orders, so every replica picks the same winner.
    fn resolve_add_add(
        &mut self,
        store: &dyn DirectoryStore,
        histories: &mut HashMap<EntryId, EntryHistory>,
        add: &AddMsg,
        history: EntryHistory,
        existing_id: EntryId,
        target_dn: Dn,
    ) -> ApplyOutcome {
        let existing_created = histories
            .get(&existing_id)
            .map(|h| h.created)
            // Without history the holder predates replication; treat it
            // as the earlier creation.
            .unwrap_or(Csn::new(i64::MIN, 0, 0));

        if add.csn > existing_created {
            // Incoming entry is the later creation: it takes the
            // disambiguated name.
            let conflict_dn =
                target_dn.with_rdn(Self::conflict_rdn(add.entry_id, target_dn.rdn()));
            let mut entry = Entry::new(add.entry_id, conflict_dn.clone(), add.attrs.clone());
            entry.set_conflict_marker(&target_dn);
            match store.add_entry(entry) {
                Ok(()) => {
                    histories.insert(add.entry_id, history);
                    self.raise_alert(&conflict_dn, &target_dn, add.csn, "naming conflict");
                    ApplyOutcome::ConflictRenamed {
                        new_dn: conflict_dn,
                    }
                }
                Err(e) => {
                    warn!(entry_id = %add.entry_id, error = %e, "conflict add failed");
                    ApplyOutcome::ResolvedNoop
                }
            }
        } else {
            // Incoming entry is the earlier creation: the current holder
            // moves to the disambiguated name and the incoming entry takes
            // the contested DN.
            let holder_conflict_dn =
                target_dn.with_rdn(Self::conflict_rdn(existing_id, target_dn.rdn()));
            if let Err(e) = store.rename_entry(existing_id, holder_conflict_dn.clone()) {
                warn!(existing_id = %existing_id, error = %e, "conflict evict failed");
                return ApplyOutcome::ResolvedNoop;
            }
            let _ = store.modify_entry(
                existing_id,
                &[Modification::new(
                    ModKind::Replace,
                    larch_store::entry::CONFLICT_ATTR,
                    vec![target_dn.to_string()],
                )],
            );
            self.raise_alert(
                &holder_conflict_dn,
                &target_dn,
                add.csn,
                "naming conflict",
            );
            let entry = Entry::new(add.entry_id, target_dn.clone(), add.attrs.clone());
            match store.add_entry(entry) {
                Ok(()) => {
                    histories.insert(add.entry_id, history);
                    ApplyOutcome::ConflictRenamed {
                        new_dn: holder_conflict_dn,
                    }
                }
                Err(e) => {
                    warn!(entry_id = %add.entry_id, error = %e, "add after evict failed");
                    ApplyOutcome::ResolvedNoop
                }
            }
        }
    }

    fn apply_modify(
        &mut self,
        store: &dyn DirectoryStore,
        histories: &mut HashMap<EntryId, EntryHistory>,
        m: &ModifyMsg,
    ) -> ApplyOutcome {
        let Some(entry) = store.find_by_id(m.entry_id) else {
            // Target deleted concurrently; suppressing the modify is the
            // deterministic outcome.
            self.counters.resolved_naming += 1;
            return ApplyOutcome::ResolvedNoop;
        };
        if entry.dn != m.dn {
            // Stale DN in the message; the unique id found the entry at
            // its current name.
            self.counters.resolved_naming += 1;
        }

        let history = histories
            .entry(m.entry_id)
            .or_insert_with(|| EntryHistory::new(Csn::new(0, 0, 0)));

        let mut effective = Vec::new();
        let mut altered = false;
        for one in &m.mods {
            let current = entry.get(&one.attr);
            match history.filter(one, m.csn, current) {
                None => altered = true,
                Some(filtered) => {
                    let protected = protect_rdn_values(&entry, filtered);
                    match protected {
                        None => altered = true,
                        Some(p) => {
                            if p != *one {
                                altered = true;
                            }
                            effective.push(p);
                        }
                    }
                }
            }
        }
        if altered {
            self.counters.resolved_modify += 1;
        }
        if effective.is_empty() {
            return ApplyOutcome::ResolvedNoop;
        }
        match store.modify_entry(m.entry_id, &effective) {
            Ok(_) => ApplyOutcome::Applied,
            Err(e) => {
                warn!(entry_id = %m.entry_id, error = %e, "modify replay failed");
                ApplyOutcome::ResolvedNoop
            }
        }
    }

    fn apply_delete(
        &mut self,
        store: &dyn DirectoryStore,
        histories: &mut HashMap<EntryId, EntryHistory>,
        del: &DeleteMsg,
    ) -> ApplyOutcome {
        let Some(entry) = store.find_by_id(del.entry_id) else {
            // Entry already gone, or the DN now belongs to a different
            // entry (it was replaced): either way a resolved no-op.
            self.counters.resolved_naming += 1;
            return ApplyOutcome::ResolvedNoop;
        };
        if entry.dn != del.dn {
            self.counters.resolved_naming += 1;
        }

        // Children that slipped in concurrently are relocated under the
        // domain root rather than silently dropped with their parent.
        let mut renamed_children = false;
        for child_id in store.children_of(del.entry_id) {
            let Some(child) = store.find_by_id(child_id) else {
                continue;
            };
            let conflict_dn = self
                .suffix
                .child(Self::conflict_rdn(child_id, child.dn.rdn()));
            match store.rename_entry(child_id, conflict_dn.clone()) {
                Ok(_) => {
                    let _ = store.modify_entry(
                        child_id,
                        &[Modification::new(
                            ModKind::Replace,
                            larch_store::entry::CONFLICT_ATTR,
                            vec![child.dn.to_string()],
                        )],
                    );
                    self.raise_alert(&conflict_dn, &child.dn, del.csn, "parent deleted");
                    renamed_children = true;
                }
                Err(e) => {
                    warn!(child_id = %child_id, error = %e, "orphan relocation failed");
                }
            }
        }

        match store.delete_entry(del.entry_id) {
            Ok(_) => {
                histories.remove(&del.entry_id);
                if renamed_children {
                    ApplyOutcome::ConflictRenamed {
                        new_dn: self.suffix.clone(),
                    }
                } else {
                    ApplyOutcome::Applied
                }
            }
            Err(e) => {
                warn!(entry_id = %del.entry_id, error = %e, "delete replay failed");
                ApplyOutcome::ResolvedNoop
            }
        }
    }

    fn apply_modify_dn(
        &mut self,
        store: &dyn DirectoryStore,
        histories: &mut HashMap<EntryId, EntryHistory>,
        mdn: &ModifyDnMsg,
    ) -> ApplyOutcome {
        let _ = histories;
        let Some(entry) = store.find_by_id(mdn.entry_id) else {
            self.counters.resolved_naming += 1;
            return ApplyOutcome::ResolvedNoop;
        };

        // Re-resolve the new superior by unique id: it may have moved, in
        // which case the rename lands under its current location.
        let superior_dn = match (mdn.new_superior_id, &mdn.new_superior) {
            (Some(sid), declared) => match store.find_by_id(sid) {
                Some(parent) => {
                    if declared.as_ref().map(|d| *d != parent.dn).unwrap_or(false) {
                        self.counters.resolved_naming += 1;
                    }
                    Some(parent.dn)
                }
                // New superior gone entirely: the rename is a no-op.
                None => {
                    self.counters.resolved_naming += 1;
                    return ApplyOutcome::ResolvedNoop;
                }
            },
            (None, Some(dn)) => match store.find_by_dn(dn) {
                Some(parent) => Some(parent.dn),
                None => {
                    self.counters.resolved_naming += 1;
                    return ApplyOutcome::ResolvedNoop;
                }
            },
            (None, None) => entry.dn.parent(),
        };

        let new_dn = match superior_dn {
            Some(parent_dn) => parent_dn.child(mdn.new_rdn.clone()),
            None => entry.dn.with_rdn(mdn.new_rdn.clone()),
        };
        if new_dn == entry.dn {
            // Replay of a rename that already took effect.
            self.counters.resolved_naming += 1;
            return ApplyOutcome::ResolvedNoop;
        }

        let old_rdn = entry.dn.rdn().clone();
        match store.rename_entry(mdn.entry_id, new_dn.clone()) {
            Ok(_) => {
                self.fix_rdn_attrs(store, mdn, &old_rdn);
                ApplyOutcome::Applied
            }
            Err(StoreError::AlreadyExists { .. }) => {
                // The destination is taken: move the entry there under a
                // disambiguated name instead.
                let conflict_dn =
                    new_dn.with_rdn(Self::conflict_rdn(mdn.entry_id, new_dn.rdn()));
                match store.rename_entry(mdn.entry_id, conflict_dn.clone()) {
                    Ok(_) => {
                        let _ = store.modify_entry(
                            mdn.entry_id,
                            &[Modification::new(
                                ModKind::Replace,
                                larch_store::entry::CONFLICT_ATTR,
                                vec![new_dn.to_string()],
                            )],
                        );
                        self.fix_rdn_attrs(store, mdn, &old_rdn);
                        self.raise_alert(&conflict_dn, &new_dn, mdn.csn, "rename collision");
                        ApplyOutcome::ConflictRenamed {
                            new_dn: conflict_dn,
                        }
                    }
                    Err(e) => {
                        warn!(entry_id = %mdn.entry_id, error = %e, "conflict rename failed");
                        ApplyOutcome::ResolvedNoop
                    }
                }
            }
            Err(e) => {
                debug!(entry_id = %mdn.entry_id, error = %e, "rename resolved to no-op");
                self.counters.resolved_naming += 1;
                ApplyOutcome::ResolvedNoop
            }
        }
    }

    /// Keep the attribute values in step with a rename: the new RDN values
    /// are added, and the old RDN values removed when requested (unless
    /// still part of the new RDN).
    fn fix_rdn_attrs(&self, store: &dyn DirectoryStore, mdn: &ModifyDnMsg, old_rdn: &Rdn) {
        let mut mods = Vec::new();
        for (attr, value) in mdn.new_rdn.avas() {
            mods.push(Modification::new(
                ModKind::Add,
                attr,
                vec![value.clone()],
            ));
        }
        if mdn.delete_old_rdn {
            for (attr, value) in old_rdn.avas() {
                if !mdn.new_rdn.contains(attr, value) {
                    mods.push(Modification::new(
                        ModKind::Delete,
                        attr,
                        vec![value.clone()],
                    ));
                }
            }
        }
        if !mods.is_empty() {
            let _ = store.modify_entry(mdn.entry_id, &mods);
        }
    }

    fn raise_alert(&mut self, dn: &Dn, wanted: &Dn, csn: Csn, reason: &str) {
        self.counters.unresolved_naming += 1;
        warn!(
            dn = %dn,
            wanted_dn = %wanted,
            csn = %csn,
            reason,
            "unresolved replication conflict"
        );
        if self.alerts.len() >= MAX_ALERTS {
            self.alerts.remove(0);
        }
        self.alerts.push(ConflictAlert {
            dn: dn.to_string(),
            wanted_dn: wanted.to_string(),
            csn,
            reason: reason.to_string(),
        });
    }
}

/// A modify must never strip a value that is, at apply time, part of the
/// entry's current RDN: a concurrent rename may have promoted it, and the
/// naming value always survives.
fn protect_rdn_values(entry: &Entry, m: Modification) -> Option<Modification> {
    let rdn = entry.dn.rdn();
    if !rdn.uses_attr(&m.attr) {
        return Some(m);
    }
    let naming_values: Vec<&String> = rdn
        .avas()
        .iter()
        .filter(|(a, _)| *a == m.attr)
        .map(|(_, v)| v)
        .collect();
    match m.kind {
        ModKind::Add => Some(m),
        ModKind::Delete => {
            if m.values.is_empty() {
                // Whole-attribute delete: keep only the naming values.
                let doomed: Vec<String> = entry
                    .get(&m.attr)
                    .map(|vals| {
                        vals.iter()
                            .filter(|v| {
                                !naming_values.iter().any(|n| n.eq_ignore_ascii_case(v))
                            })
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
                let kept: Vec<String> = m
                    .values
                    .into_iter()
                    .filter(|v| !naming_values.iter().any(|n| n.eq_ignore_ascii_case(v)))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(Modification::new(ModKind::Delete, &m.attr, kept))
                }
            }
        }
        ModKind::Replace => {
            let mut values = m.values;
            for n in naming_values {
                if !values.iter().any(|v| v.eq_ignore_ascii_case(n)) {
                    values.push(n.clone());
                }
            }
            Some(Modification::new(ModKind::Replace, &m.attr, values))
        }
    }
}
