//! One replicated domain on one server.
//!
//! The domain owns the pieces that must agree with each other: the
//! directory store, the durable changelog, the CSN generator, the server
//! state vector, the dependency resolver, and the conflict engine. Local
//! operations stamp a fresh CSN, apply, and are journaled for fanout; a
//! failed journal append unwinds the store change so the tree never holds
//! a write that can no longer replicate. Inbound messages are journaled
//! first and then replayed through the resolver and the engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::changelog::{ChangelogConfig, ChangelogStats, ChangelogStore};
use crate::conflict::{ConflictCounters, ConflictEngine};
use crate::csn::{Csn, CsnGenerator};
use crate::error::ReplError;
use crate::generation::{GenerationId, GenerationStatus};
use crate::historical::EntryHistory;
use crate::pending::{DependencyResolver, PendingConfig};
use crate::state::ServerState;
use crate::update::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg, UpdateMessage};
use larch_store::{DirectoryStore, Dn, Entry, EntryId, ModKind, Modification, Rdn, StoreError};

/// Configuration for one replicated domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Domain identifier, shared by every member.
    pub domain_id: u32,
    /// This server's replica id, unique within the domain.
    pub replica_id: i32,
    /// Changelog persistence settings.
    pub changelog: ChangelogConfig,
    /// Dependency queue bounds.
    pub pending: PendingConfig,
    /// Upper bound on replay passes per received batch. Each pass can
    /// unblock further queued messages; a bound keeps a pathological
    /// queue from spinning.
    pub max_replay_passes: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            domain_id: 1,
            replica_id: 1,
            changelog: ChangelogConfig::default(),
            pending: PendingConfig::default(),
            max_replay_passes: 10,
        }
    }
}

/// Outcome of delivering one inbound message to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The CSN was already incorporated; nothing happened.
    Duplicate,
    /// Journaled but not replayed: the domain is in degraded generation
    /// status and waits for re-initialization.
    Ingested,
    /// Journaled and queued on an unsatisfied dependency.
    Queued,
    /// Journaled and replayed (the count includes queued messages the
    /// delivery unblocked).
    Replayed {
        /// Messages replayed against the store.
        count: usize,
    },
}

/// Point-in-time status of a domain, for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStatus {
    /// Domain identifier.
    pub domain_id: u32,
    /// Local replica id.
    pub replica_id: i32,
    /// Current generation id.
    pub generation: GenerationId,
    /// Generation status.
    pub status: GenerationStatus,
    /// Newest incorporated CSN per replica, rendered.
    pub state: String,
    /// Messages waiting on dependencies.
    pub pending: usize,
    /// Entries in the local store.
    pub entries: usize,
    /// Conflict counters.
    pub conflicts: ConflictCounters,
    /// Changelog statistics.
    pub changelog: ChangelogStats,
}

struct Inner {
    state: ServerState,
    generation: GenerationId,
    status: GenerationStatus,
    resolver: DependencyResolver,
    histories: HashMap<EntryId, EntryHistory>,
    engine: ConflictEngine,
}

/// One replicated domain: the unit brokers and relays operate on.
pub struct ReplicationDomain {
    config: DomainConfig,
    store: Arc<dyn DirectoryStore>,
    changelog: ChangelogStore,
    generator: CsnGenerator,
    inner: Mutex<Inner>,
}

impl ReplicationDomain {
    /// Open a domain over `store`, recovering the changelog from
    /// `changelog_dir`. Journaled messages not yet reflected in the store
    /// are not replayed here; the caller decides whether to resync from
    /// the journal or from a peer.
    pub fn open(
        config: DomainConfig,
        store: Arc<dyn DirectoryStore>,
        changelog_dir: impl AsRef<Path>,
    ) -> Result<Self, ReplError> {
        let changelog =
            ChangelogStore::open(changelog_dir, config.domain_id, config.changelog.clone())?;
        let generator = CsnGenerator::new(config.replica_id);
        // The clock must never re-issue a CSN that is already journaled.
        let journaled = changelog.newest_state();
        for (_, csn) in journaled.iter() {
            generator.adjust(&csn);
        }
        let generation = GenerationId::compute(store.as_ref());
        let suffix = store.suffix();
        info!(
            domain_id = config.domain_id,
            replica_id = config.replica_id,
            %generation,
            "domain opened"
        );
        Ok(Self {
            generator,
            changelog,
            store,
            inner: Mutex::new(Inner {
                state: journaled,
                generation,
                status: GenerationStatus::Normal,
                resolver: DependencyResolver::new(config.pending),
                histories: HashMap::new(),
                engine: ConflictEngine::new(suffix),
            }),
            config,
        })
    }

    /// The domain identifier.
    pub fn domain_id(&self) -> u32 {
        self.config.domain_id
    }

    /// This server's replica id.
    pub fn replica_id(&self) -> i32 {
        self.config.replica_id
    }

    /// The underlying directory store.
    pub fn store(&self) -> &Arc<dyn DirectoryStore> {
        &self.store
    }

    /// The current generation id.
    pub fn generation(&self) -> GenerationId {
        self.inner.lock().unwrap().generation
    }

    /// The current generation status.
    pub fn status(&self) -> GenerationStatus {
        self.inner.lock().unwrap().status
    }

    /// The newest incorporated CSN per replica.
    pub fn state(&self) -> ServerState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Recompute the generation id from the store's current baseline and
    /// adopt it. Used after an import established a new baseline.
    pub fn refresh_generation(&self) -> GenerationId {
        let generation = GenerationId::compute(self.store.as_ref());
        let mut inner = self.inner.lock().unwrap();
        inner.generation = generation;
        inner.status = GenerationStatus::Normal;
        generation
    }

    /// Adopt a generation id pushed by an administrative reset, clearing
    /// any degraded status.
    pub fn adopt_generation(&self, generation: GenerationId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            info!(
                domain_id = self.config.domain_id,
                old = %inner.generation,
                new = %generation,
                "generation reset"
            );
        }
        inner.generation = generation;
        inner.status = GenerationStatus::Normal;
    }

    /// Mark the domain degraded: inbound updates are journaled but not
    /// replayed until re-initialization.
    pub fn mark_degraded(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != GenerationStatus::BadGeneration {
            warn!(
                domain_id = self.config.domain_id,
                "domain degraded (generation mismatch)"
            );
        }
        inner.status = GenerationStatus::BadGeneration;
    }

    // ---- local operations -------------------------------------------------

    /// Apply a local add and journal it for fanout.
    pub fn local_add(
        &self,
        dn: Dn,
        attrs: Vec<(String, String)>,
    ) -> Result<UpdateMessage, ReplError> {
        let parent_id = match dn.parent() {
            None => None,
            Some(_) if dn == self.store.suffix() => None,
            Some(parent_dn) => Some(
                self.store
                    .find_by_dn(&parent_dn)
                    .ok_or(StoreError::NoSuchParent { dn: dn.clone() })?
                    .id,
            ),
        };
        let csn = self.generator.new_csn();
        let entry_id = EntryId::random();
        self.store
            .add_entry(Entry::new(entry_id, dn.clone(), attrs.clone()))?;
        let mut history = EntryHistory::new(csn);
        history.record_initial(&attrs);
        let msg = UpdateMessage::Add(AddMsg {
            csn,
            entry_id,
            dn,
            parent_id,
            attrs,
        });
        let res = self.journal_local(msg, |inner| {
            inner.histories.insert(entry_id, history);
        });
        if res.is_err() {
            let _ = self.store.delete_entry(entry_id);
        }
        res
    }

    /// Apply a local delete and journal it for fanout.
    pub fn local_delete(&self, dn: &Dn) -> Result<UpdateMessage, ReplError> {
        let entry = self
            .store
            .find_by_dn(dn)
            .ok_or_else(|| StoreError::NoSuchEntry { dn: dn.clone() })?;
        let csn = self.generator.new_csn();
        let removed = self.store.delete_entry(entry.id)?;
        let msg = UpdateMessage::Delete(DeleteMsg {
            csn,
            entry_id: entry.id,
            dn: dn.clone(),
        });
        let res = self.journal_local(msg, |inner| {
            inner.histories.remove(&entry.id);
        });
        if res.is_err() {
            let _ = self.store.add_entry(removed);
        }
        res
    }

    /// Apply a local modify and journal it for fanout.
    pub fn local_modify(
        &self,
        dn: &Dn,
        mods: Vec<Modification>,
    ) -> Result<UpdateMessage, ReplError> {
        let entry = self
            .store
            .find_by_dn(dn)
            .ok_or_else(|| StoreError::NoSuchEntry { dn: dn.clone() })?;
        let csn = self.generator.new_csn();
        self.store.modify_entry(entry.id, &mods)?;
        let msg = UpdateMessage::Modify(ModifyMsg {
            csn,
            entry_id: entry.id,
            dn: dn.clone(),
            mods: mods.clone(),
        });
        let res = self.journal_local(msg, |inner| {
            let history = inner
                .histories
                .entry(entry.id)
                .or_insert_with(|| EntryHistory::new(csn));
            for m in &mods {
                let _ = history.filter(m, csn, entry.get(&m.attr));
            }
        });
        if res.is_err() {
            if let Some(after) = self.store.find_by_id(entry.id) {
                let _ = self.store.modify_entry(entry.id, &restore_mods(&entry, &after));
            }
        }
        res
    }

    /// Apply a local rename/move and journal it for fanout.
    pub fn local_modify_dn(
        &self,
        dn: &Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
    ) -> Result<UpdateMessage, ReplError> {
        let entry = self
            .store
            .find_by_dn(dn)
            .ok_or_else(|| StoreError::NoSuchEntry { dn: dn.clone() })?;
        let new_superior_id = match &new_superior {
            None => None,
            Some(sup) => Some(
                self.store
                    .find_by_dn(sup)
                    .ok_or_else(|| StoreError::NoSuchEntry { dn: sup.clone() })?
                    .id,
            ),
        };
        let new_dn = match &new_superior {
            Some(sup) => sup.child(new_rdn.clone()),
            None => dn.with_rdn(new_rdn.clone()),
        };
        let csn = self.generator.new_csn();
        let old_rdn = entry.dn.rdn().clone();
        self.store.rename_entry(entry.id, new_dn)?;
        let mut attr_mods = Vec::new();
        for (attr, value) in new_rdn.avas() {
            attr_mods.push(Modification::new(ModKind::Add, attr, vec![value.clone()]));
        }
        if delete_old_rdn {
            for (attr, value) in old_rdn.avas() {
                if !new_rdn.contains(attr, value) {
                    attr_mods.push(Modification::new(
                        ModKind::Delete,
                        attr,
                        vec![value.clone()],
                    ));
                }
            }
        }
        if !attr_mods.is_empty() {
            let _ = self.store.modify_entry(entry.id, &attr_mods);
        }
        let msg = UpdateMessage::ModifyDn(ModifyDnMsg {
            csn,
            entry_id: entry.id,
            dn: dn.clone(),
            new_rdn,
            delete_old_rdn,
            new_superior,
            new_superior_id,
        });
        let res = self.journal_local(msg, |_| {});
        if res.is_err() {
            let _ = self.store.rename_entry(entry.id, entry.dn.clone());
            if let Some(after) = self.store.find_by_id(entry.id) {
                let _ = self.store.modify_entry(entry.id, &restore_mods(&entry, &after));
            }
        }
        res
    }

    /// Durably journal a local update and fold it into the domain state.
    /// On an append error nothing is recorded; the caller unwinds the
    /// store mutation before surfacing the error.
    fn journal_local(
        &self,
        msg: UpdateMessage,
        record: impl FnOnce(&mut Inner),
    ) -> Result<UpdateMessage, ReplError> {
        self.changelog.append(&msg)?;
        let mut inner = self.inner.lock().unwrap();
        inner.state.update(msg.csn());
        record(&mut inner);
        if !inner.generation.is_set() {
            // First write on a previously empty domain establishes the
            // baseline fingerprint.
            inner.generation = GenerationId::compute(self.store.as_ref());
        }
        debug!(
            domain_id = self.config.domain_id,
            kind = msg.kind(),
            csn = %msg.csn(),
            dn = %msg.dn(),
            "local update journaled"
        );
        Ok(msg)
    }

    // ---- inbound replication ----------------------------------------------

    /// Deliver one message received from a peer.
    ///
    /// The message is journaled before any replay, so once this returns it
    /// survives restart regardless of replay outcome. Duplicates (already
    /// incorporated CSNs) are dropped without side effects.
    pub fn receive(&self, msg: UpdateMessage) -> Result<ReceiveOutcome, ReplError> {
        let csn = msg.csn();
        let mut inner = self.inner.lock().unwrap();
        if inner.state.covers(&csn) || inner.resolver.contains(csn) {
            debug!(csn = %csn, "duplicate update dropped");
            return Ok(ReceiveOutcome::Duplicate);
        }
        self.changelog.append(&msg)?;
        self.generator.adjust(&csn);

        if inner.status == GenerationStatus::BadGeneration {
            return Ok(ReceiveOutcome::Ingested);
        }

        inner.resolver.submit(msg);
        let replayed = self.replay_ready(&mut inner);
        if replayed == 0 {
            Ok(ReceiveOutcome::Queued)
        } else {
            Ok(ReceiveOutcome::Replayed { count: replayed })
        }
    }

    /// Periodic maintenance: escalate messages that overstayed the
    /// dependency queue and retry the ready set. Returns how many messages
    /// were replayed.
    pub fn tick(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == GenerationStatus::BadGeneration {
            return 0;
        }
        let mut replayed = self.replay_ready(&mut inner);
        for msg in inner.resolver.drain_escalations() {
            warn!(
                csn = %msg.csn(),
                kind = msg.kind(),
                dn = %msg.dn(),
                "dependency timeout, escalating to conflict resolution"
            );
            self.apply_one(&mut inner, &msg);
            replayed += 1;
        }
        replayed += self.replay_ready(&mut inner);
        replayed
    }

    fn replay_ready(&self, inner: &mut Inner) -> usize {
        let mut replayed = 0usize;
        for _ in 0..self.config.max_replay_passes {
            let ready = inner.resolver.take_ready(self.store.as_ref());
            if ready.is_empty() {
                break;
            }
            for msg in ready {
                self.apply_one(inner, &msg);
                replayed += 1;
            }
        }
        replayed
    }

    fn apply_one(&self, inner: &mut Inner, msg: &UpdateMessage) {
        let Inner {
            engine, histories, ..
        } = inner;
        let outcome = engine.apply(self.store.as_ref(), histories, msg);
        debug!(
            csn = %msg.csn(),
            kind = msg.kind(),
            outcome = ?outcome,
            "update replayed"
        );
        inner.state.update(msg.csn());
    }

    // ---- catch-up, trimming, snapshots ------------------------------------

    /// Journaled messages a peer at `peer_state` has not yet incorporated,
    /// in CSN order, at most `max`.
    pub fn updates_for(&self, peer_state: &ServerState, max: usize) -> Vec<UpdateMessage> {
        self.changelog.read_after(peer_state, max)
    }

    /// The oldest journaled CSN from one replica, if any.
    pub fn oldest_journaled(&self, replica_id: i32) -> Option<Csn> {
        self.changelog.oldest_csn(replica_id)
    }

    /// Trim the changelog below the per-replica floor acknowledged by every
    /// peer. Returns the number of records removed.
    pub fn purge_changelog(&self, floor: &ServerState) -> Result<usize, ReplError> {
        self.changelog.purge_before(floor)
    }

    /// Snapshot the domain for full initialization of a peer: every entry
    /// in parent-before-child order with its history attached, plus the
    /// state vector the receiving member should adopt.
    pub fn snapshot(&self) -> (Vec<Entry>, GenerationId, ServerState) {
        let inner = self.inner.lock().unwrap();
        let mut entries = self.store.baseline();
        entries.sort_by_key(|e| e.dn.depth());
        for entry in &mut entries {
            if let Some(history) = inner.histories.get(&entry.id) {
                history.attach_to(entry);
            }
        }
        (entries, inner.generation, inner.state.clone())
    }

    /// Replace the domain's content from a full-initialization snapshot,
    /// adopting the source's generation id and state vector. Clears any
    /// degraded status and the dependency queue.
    pub fn apply_snapshot(
        &self,
        mut entries: Vec<Entry>,
        generation: GenerationId,
        state: ServerState,
    ) -> Result<(), ReplError> {
        let mut histories = HashMap::new();
        for entry in &mut entries {
            if let Some(history) = EntryHistory::detach_from(entry) {
                histories.insert(entry.id, history);
            }
        }
        let count = entries.len();
        self.store.replace_all(entries)?;
        let mut inner = self.inner.lock().unwrap();
        inner.histories = histories;
        inner.generation = generation;
        inner.status = GenerationStatus::Normal;
        inner.state = state;
        inner.resolver = DependencyResolver::new(self.config.pending);
        inner.engine = ConflictEngine::new(self.store.suffix());
        for (_, csn) in inner.state.iter() {
            self.generator.adjust(&csn);
        }
        info!(
            domain_id = self.config.domain_id,
            entries = count,
            %generation,
            "snapshot applied"
        );
        Ok(())
    }

    /// Flush any batched changelog appends.
    pub fn sync_changelog(&self) -> Result<(), ReplError> {
        self.changelog.sync()
    }

    /// Alerts raised for unresolved conflicts, oldest first.
    pub fn conflict_alerts(&self) -> Vec<crate::conflict::ConflictAlert> {
        self.inner.lock().unwrap().engine.alerts().to_vec()
    }

    /// Point-in-time status for monitoring.
    pub fn status_report(&self) -> DomainStatus {
        let inner = self.inner.lock().unwrap();
        DomainStatus {
            domain_id: self.config.domain_id,
            replica_id: self.config.replica_id,
            generation: inner.generation,
            status: inner.status,
            state: inner.state.to_string(),
            pending: inner.resolver.len(),
            entries: self.store.len(),
            conflicts: inner.engine.counters(),
            changelog: self.changelog.stats(),
        }
    }
}

/// Modifications that restore `before`'s attribute state, given the entry
/// currently reads as `after`.
fn restore_mods(before: &Entry, after: &Entry) -> Vec<Modification> {
    let mut mods = Vec::new();
    for attr in after.attrs.keys() {
        if !before.attrs.contains_key(attr) {
            mods.push(Modification::new(ModKind::Delete, attr, vec![]));
        }
    }
    for (attr, values) in &before.attrs {
        mods.push(Modification::new(ModKind::Replace, attr, values.clone()));
    }
    mods
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_store::MemoryStore;

    fn suffix() -> Dn {
        Dn::parse("dc=example").unwrap()
    }

    fn domain_with_root(replica_id: i32, dir: &Path) -> ReplicationDomain {
        let store = Arc::new(MemoryStore::new(suffix()));
        let config = DomainConfig {
            domain_id: 7,
            replica_id,
            ..DomainConfig::default()
        };
        let domain = ReplicationDomain::open(config, store, dir).unwrap();
        domain.local_add(suffix(), vec![]).unwrap();
        domain
    }

    #[test]
    fn local_ops_stamp_increasing_csns_and_journal() {
        let dir = tempfile::tempdir().unwrap();
        let domain = domain_with_root(1, dir.path());
        let a = domain
            .local_add(
                Dn::parse("uid=a,dc=example").unwrap(),
                vec![("uid".into(), "a".into())],
            )
            .unwrap();
        let m = domain
            .local_modify(
                &Dn::parse("uid=a,dc=example").unwrap(),
                vec![Modification::replace("cn", "Alice")],
            )
            .unwrap();
        assert!(a.csn() < m.csn());
        assert_eq!(a.replica_id(), 1);
        // Root + add + modify journaled.
        assert_eq!(domain.updates_for(&ServerState::new(), 10).len(), 3);
        assert!(domain.state().covers(&m.csn()));
        assert!(domain.generation().is_set());
    }

    #[test]
    fn local_add_requires_parent() {
        let dir = tempfile::tempdir().unwrap();
        let domain = domain_with_root(1, dir.path());
        let err = domain
            .local_add(Dn::parse("uid=a,ou=missing,dc=example").unwrap(), vec![])
            .unwrap_err();
        assert!(matches!(err, ReplError::Store(_)));
    }

    #[test]
    fn failed_journal_append_unwinds_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let changelog_dir = dir.path().join("journal");
        let store = Arc::new(MemoryStore::new(suffix()));
        store
            .add_entry(Entry::new(EntryId::random(), suffix(), vec![]))
            .unwrap();
        store
            .add_entry(Entry::new(
                EntryId::random(),
                Dn::parse("uid=a,dc=example").unwrap(),
                vec![("cn".into(), "Alice".into())],
            ))
            .unwrap();
        let domain = ReplicationDomain::open(
            DomainConfig::default(),
            Arc::clone(&store) as Arc<dyn DirectoryStore>,
            &changelog_dir,
        )
        .unwrap();
        // With the journal directory gone, every append fails when the
        // replica log file is created.
        std::fs::remove_dir_all(&changelog_dir).unwrap();

        let target = Dn::parse("uid=a,dc=example").unwrap();

        assert!(domain
            .local_add(Dn::parse("uid=b,dc=example").unwrap(), vec![])
            .is_err());
        assert!(store
            .find_by_dn(&Dn::parse("uid=b,dc=example").unwrap())
            .is_none());

        assert!(domain
            .local_modify(&target, vec![Modification::replace("cn", "Bob")])
            .is_err());
        assert_eq!(store.find_by_dn(&target).unwrap().first("cn"), Some("Alice"));

        assert!(domain
            .local_modify_dn(&target, Rdn::new("uid", "a2"), true, None)
            .is_err());
        let entry = store.find_by_dn(&target).expect("rename rolled back");
        assert!(store
            .find_by_dn(&Dn::parse("uid=a2,dc=example").unwrap())
            .is_none());
        assert!(entry.get("uid").is_none());

        assert!(domain.local_delete(&target).is_err());
        assert!(store.find_by_dn(&target).is_some());

        // Nothing leaked into the state vector either.
        assert!(domain.state().is_empty());
    }

    #[test]
    fn receive_applies_and_deduplicates() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = domain_with_root(1, dir_a.path());
        let b = domain_with_root(2, dir_b.path());

        let msg = a
            .local_add(
                Dn::parse("uid=x,dc=example").unwrap(),
                vec![("uid".into(), "x".into())],
            )
            .unwrap();
        // The remote root entry has a different unique id than the local
        // one, so deliver only the child (as after catch-up filtering).
        let outcome = b.receive(remap_parent(&msg, &b)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Replayed { count: 1 });
        assert!(b
            .store()
            .find_by_dn(&Dn::parse("uid=x,dc=example").unwrap())
            .is_some());

        let outcome = b.receive(remap_parent(&msg, &b)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Duplicate);
    }

    // Points an add at the receiving domain's own root entry, mirroring
    // what a common baseline would provide.
    fn remap_parent(msg: &UpdateMessage, target: &ReplicationDomain) -> UpdateMessage {
        match msg {
            UpdateMessage::Add(add) => {
                let root = target.store().find_by_dn(&suffix()).unwrap();
                UpdateMessage::Add(AddMsg {
                    parent_id: Some(root.id),
                    ..add.clone()
                })
            }
            other => other.clone(),
        }
    }

    #[test]
    fn receive_queues_until_dependency_arrives() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = domain_with_root(1, dir_a.path());
        let b = domain_with_root(2, dir_b.path());

        let parent = a
            .local_add(Dn::parse("ou=p,dc=example").unwrap(), vec![])
            .unwrap();
        let child = a
            .local_add(Dn::parse("uid=c,ou=p,dc=example").unwrap(), vec![])
            .unwrap();

        // Child first: queued.
        assert_eq!(b.receive(child.clone()).unwrap(), ReceiveOutcome::Queued);
        // Parent arrives: both replay.
        assert_eq!(
            b.receive(remap_parent(&parent, &b)).unwrap(),
            ReceiveOutcome::Replayed { count: 2 }
        );
        assert!(b
            .store()
            .find_by_dn(&Dn::parse("uid=c,ou=p,dc=example").unwrap())
            .is_some());
    }

    #[test]
    fn degraded_domain_journals_without_replaying() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = domain_with_root(1, dir_a.path());
        let b = domain_with_root(2, dir_b.path());
        b.mark_degraded();

        let msg = a
            .local_add(Dn::parse("uid=x,dc=example").unwrap(), vec![])
            .unwrap();
        assert_eq!(
            b.receive(remap_parent(&msg, &b)).unwrap(),
            ReceiveOutcome::Ingested
        );
        assert!(b
            .store()
            .find_by_dn(&Dn::parse("uid=x,dc=example").unwrap())
            .is_none());
        // Journaled regardless: present in catch-up reads.
        assert!(b
            .updates_for(&ServerState::new(), 100)
            .iter()
            .any(|m| m.csn() == msg.csn()));
    }

    #[test]
    fn tick_escalates_stuck_dependency() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = domain_with_root(1, dir_a.path());

        let store = Arc::new(MemoryStore::new(suffix()));
        let config = DomainConfig {
            domain_id: 7,
            replica_id: 2,
            pending: PendingConfig {
                max_queued: 256,
                max_age_ms: 0,
            },
            ..DomainConfig::default()
        };
        let b = ReplicationDomain::open(config, store, dir_b.path()).unwrap();
        b.local_add(suffix(), vec![]).unwrap();

        a.local_add(Dn::parse("ou=p,dc=example").unwrap(), vec![])
            .unwrap();
        let child = a
            .local_add(Dn::parse("uid=c,ou=p,dc=example").unwrap(), vec![])
            .unwrap();

        // Parent never delivered; the child waits, then escalates.
        assert_eq!(b.receive(child).unwrap(), ReceiveOutcome::Queued);
        assert!(b.tick() >= 1);
        let report = b.status_report();
        assert_eq!(report.pending, 0);
        assert_eq!(report.conflicts.unresolved_naming, 1);
    }

    #[test]
    fn snapshot_and_apply_snapshot_move_content_and_generation() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = domain_with_root(1, dir_a.path());
        a.local_add(
            Dn::parse("uid=a,dc=example").unwrap(),
            vec![("uid".into(), "a".into())],
        )
        .unwrap();
        a.local_add(Dn::parse("ou=p,dc=example").unwrap(), vec![])
            .unwrap();
        a.local_add(Dn::parse("uid=c,ou=p,dc=example").unwrap(), vec![])
            .unwrap();

        let store = Arc::new(MemoryStore::new(suffix()));
        let b = ReplicationDomain::open(
            DomainConfig {
                domain_id: 7,
                replica_id: 2,
                ..DomainConfig::default()
            },
            store,
            dir_b.path(),
        )
        .unwrap();
        b.mark_degraded();

        let (entries, generation, state) = a.snapshot();
        b.apply_snapshot(entries, generation, state).unwrap();

        assert_eq!(b.store().len(), 4);
        assert_eq!(b.generation(), a.generation());
        assert_eq!(b.status(), GenerationStatus::Normal);
        assert_eq!(b.state(), a.state());
        // No stray history attribute left on the entries.
        let entry = b
            .store()
            .find_by_dn(&Dn::parse("uid=a,dc=example").unwrap())
            .unwrap();
        assert!(entry.attrs.get(crate::historical::HIST_ATTR).is_none());
    }

    #[test]
    fn reopen_recovers_state_from_changelog() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(suffix()));
        let last_csn;
        {
            let domain = ReplicationDomain::open(
                DomainConfig::default(),
                Arc::clone(&store) as Arc<dyn DirectoryStore>,
                dir.path(),
            )
            .unwrap();
            domain.local_add(suffix(), vec![]).unwrap();
            last_csn = domain
                .local_add(Dn::parse("uid=a,dc=example").unwrap(), vec![])
                .unwrap()
                .csn();
        }
        let domain = ReplicationDomain::open(
            DomainConfig::default(),
            store as Arc<dyn DirectoryStore>,
            dir.path(),
        )
        .unwrap();
        assert!(domain.state().covers(&last_csn));
        // Fresh CSNs sort after everything journaled before the restart.
        let next = domain
            .local_modify(
                &Dn::parse("uid=a,dc=example").unwrap(),
                vec![Modification::replace("cn", "x")],
            )
            .unwrap();
        assert!(next.csn() > last_csn);
    }

    #[test]
    fn purge_respects_floor() {
        let dir = tempfile::tempdir().unwrap();
        let domain = domain_with_root(1, dir.path());
        let m1 = domain
            .local_add(Dn::parse("uid=a,dc=example").unwrap(), vec![])
            .unwrap();
        let m2 = domain
            .local_add(Dn::parse("uid=b,dc=example").unwrap(), vec![])
            .unwrap();

        let mut floor = ServerState::new();
        floor.update(m1.csn());
        let removed = domain.purge_changelog(&floor).unwrap();
        assert!(removed >= 2); // root + first add
        assert_eq!(domain.oldest_journaled(1), Some(m2.csn()));
    }
}
