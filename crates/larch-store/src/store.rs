//! The directory store trait and its in-memory implementation.
//!
//! The tree is held as id-keyed arena maps (id -> entry, dn -> id,
//! id -> parent id, id -> children ids); no entry references another
//! entry directly.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::dn::Dn;
use crate::entry::{Entry, EntryId, Modification};
use crate::error::StoreError;

/// The local data store contract consumed by the replication core.
///
/// Every mutating call reports success or a typed [`StoreError`]; the
/// replication engine classifies those errors into conflict-resolution
/// outcomes, so implementations must return the precise variant.
pub trait DirectoryStore: Send + Sync {
    /// The suffix (root DN) this store serves.
    fn suffix(&self) -> Dn;

    /// Add an entry at its DN. The parent must exist unless the entry is
    /// the suffix itself.
    fn add_entry(&self, entry: Entry) -> Result<(), StoreError>;

    /// Delete the entry with the given id. Fails on non-leaf entries.
    fn delete_entry(&self, id: EntryId) -> Result<Entry, StoreError>;

    /// Apply modifications to the entry with the given id and return the
    /// updated entry.
    fn modify_entry(&self, id: EntryId, mods: &[Modification]) -> Result<Entry, StoreError>;

    /// Move/rename the entry with the given id to `new_dn`, rebasing any
    /// descendants. Returns the updated entry.
    fn rename_entry(&self, id: EntryId, new_dn: Dn) -> Result<Entry, StoreError>;

    /// Look up an entry by unique id.
    fn find_by_id(&self, id: EntryId) -> Option<Entry>;

    /// Look up an entry by DN.
    fn find_by_dn(&self, dn: &Dn) -> Option<Entry>;

    /// Ids of the direct children of the given entry.
    fn children_of(&self, id: EntryId) -> Vec<EntryId>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Returns true if the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries ordered by unique id. Used for the generation-id
    /// baseline walk and for full-initialization snapshots.
    fn baseline(&self) -> Vec<Entry>;

    /// Replace the whole content with the given entries (full re-init).
    /// Entries are inserted parents-first regardless of input order.
    fn replace_all(&self, entries: Vec<Entry>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Dit {
    by_id: HashMap<EntryId, Entry>,
    by_dn: HashMap<Dn, EntryId>,
    parent: HashMap<EntryId, EntryId>,
    children: HashMap<EntryId, HashSet<EntryId>>,
}

/// In-memory directory information tree.
#[derive(Debug)]
pub struct MemoryStore {
    suffix: Dn,
    dit: RwLock<Dit>,
}

impl MemoryStore {
    /// Create an empty store serving the given suffix.
    pub fn new(suffix: Dn) -> Self {
        Self {
            suffix,
            dit: RwLock::new(Dit::default()),
        }
    }

    fn parent_id_for(&self, dit: &Dit, dn: &Dn) -> Result<Option<EntryId>, StoreError> {
        if *dn == self.suffix {
            return Ok(None);
        }
        if !dn.is_descendant_of(&self.suffix) {
            return Err(StoreError::OutsideSuffix {
                dn: dn.clone(),
                suffix: self.suffix.clone(),
            });
        }
        let parent_dn = dn.parent().ok_or_else(|| StoreError::NoSuchParent {
            dn: dn.clone(),
        })?;
        match dit.by_dn.get(&parent_dn) {
            Some(id) => Ok(Some(*id)),
            None => Err(StoreError::NoSuchParent { dn: dn.clone() }),
        }
    }

    fn insert(&self, dit: &mut Dit, entry: Entry) -> Result<(), StoreError> {
        if let Some(existing_id) = dit.by_dn.get(&entry.dn) {
            return Err(StoreError::AlreadyExists {
                dn: entry.dn.clone(),
                existing_id: *existing_id,
            });
        }
        let parent_id = self.parent_id_for(dit, &entry.dn)?;
        dit.by_dn.insert(entry.dn.clone(), entry.id);
        if let Some(pid) = parent_id {
            dit.parent.insert(entry.id, pid);
            dit.children.entry(pid).or_default().insert(entry.id);
        }
        dit.by_id.insert(entry.id, entry);
        Ok(())
    }
}

impl DirectoryStore for MemoryStore {
    fn suffix(&self) -> Dn {
        self.suffix.clone()
    }

    fn add_entry(&self, entry: Entry) -> Result<(), StoreError> {
        let mut dit = self.dit.write().unwrap();
        self.insert(&mut dit, entry)
    }

    fn delete_entry(&self, id: EntryId) -> Result<Entry, StoreError> {
        let mut dit = self.dit.write().unwrap();
        let entry = dit
            .by_id
            .get(&id)
            .cloned()
            .ok_or(StoreError::NoSuchId { id })?;
        if dit.children.get(&id).map(|c| !c.is_empty()).unwrap_or(false) {
            return Err(StoreError::NotAllowedOnNonLeaf {
                dn: entry.dn.clone(),
            });
        }
        dit.by_id.remove(&id);
        dit.by_dn.remove(&entry.dn);
        dit.children.remove(&id);
        if let Some(pid) = dit.parent.remove(&id) {
            if let Some(siblings) = dit.children.get_mut(&pid) {
                siblings.remove(&id);
            }
        }
        Ok(entry)
    }

    fn modify_entry(&self, id: EntryId, mods: &[Modification]) -> Result<Entry, StoreError> {
        let mut dit = self.dit.write().unwrap();
        let entry = dit
            .by_id
            .get_mut(&id)
            .ok_or(StoreError::NoSuchId { id })?;
        for m in mods {
            entry.apply(m);
        }
        Ok(entry.clone())
    }

    fn rename_entry(&self, id: EntryId, new_dn: Dn) -> Result<Entry, StoreError> {
        let mut dit = self.dit.write().unwrap();
        let old_dn = dit
            .by_id
            .get(&id)
            .map(|e| e.dn.clone())
            .ok_or(StoreError::NoSuchId { id })?;
        if old_dn == new_dn {
            return Ok(dit.by_id[&id].clone());
        }
        if let Some(existing_id) = dit.by_dn.get(&new_dn) {
            if *existing_id != id {
                return Err(StoreError::AlreadyExists {
                    dn: new_dn,
                    existing_id: *existing_id,
                });
            }
        }
        let new_parent_id = self.parent_id_for(&dit, &new_dn)?;

        // Move the entry itself.
        dit.by_dn.remove(&old_dn);
        dit.by_dn.insert(new_dn.clone(), id);
        if let Some(old_pid) = dit.parent.remove(&id) {
            if let Some(siblings) = dit.children.get_mut(&old_pid) {
                siblings.remove(&id);
            }
        }
        if let Some(pid) = new_parent_id {
            dit.parent.insert(id, pid);
            dit.children.entry(pid).or_default().insert(id);
        }
        if let Some(e) = dit.by_id.get_mut(&id) {
            e.dn = new_dn.clone();
        }

        // Rebase every descendant DN under the new location.
        let moved: Vec<(EntryId, Dn)> = dit
            .by_id
            .values()
            .filter(|e| e.id != id && e.dn.is_descendant_of(&old_dn))
            .filter_map(|e| e.dn.rebase(&old_dn, &new_dn).map(|d| (e.id, d)))
            .collect();
        for (cid, child_dn) in moved {
            let prev = dit.by_id.get(&cid).map(|e| e.dn.clone());
            if let Some(prev_dn) = prev {
                dit.by_dn.remove(&prev_dn);
            }
            dit.by_dn.insert(child_dn.clone(), cid);
            if let Some(e) = dit.by_id.get_mut(&cid) {
                e.dn = child_dn;
            }
        }

        Ok(dit.by_id[&id].clone())
    }

    fn find_by_id(&self, id: EntryId) -> Option<Entry> {
        self.dit.read().unwrap().by_id.get(&id).cloned()
    }

    fn find_by_dn(&self, dn: &Dn) -> Option<Entry> {
        let dit = self.dit.read().unwrap();
        dit.by_dn.get(dn).and_then(|id| dit.by_id.get(id)).cloned()
    }

    fn children_of(&self, id: EntryId) -> Vec<EntryId> {
        self.dit
            .read()
            .unwrap()
            .children
            .get(&id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.dit.read().unwrap().by_id.len()
    }

    fn baseline(&self) -> Vec<Entry> {
        let dit = self.dit.read().unwrap();
        let mut entries: Vec<Entry> = dit.by_id.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    fn replace_all(&self, entries: Vec<Entry>) -> Result<(), StoreError> {
        let mut dit = self.dit.write().unwrap();
        *dit = Dit::default();
        // Shallow names first so parents exist before their children.
        let mut entries = entries;
        entries.sort_by_key(|e| e.dn.depth());
        for entry in entries {
            self.insert(&mut dit, entry)?;
        }
        Ok(())
    }
}
