//! Dependency / ordering resolver for inbound updates.
//!
//! Messages from one replica replay in strict CSN order; messages from
//! different replicas interleave freely except for structural
//! dependencies: an add waits for its parent, a delete waits for its
//! children, a rename waits for its new superior. The queue is bounded by
//! count and age; a message whose dependency never materializes is
//! escalated to the conflict engine as a structural anomaly instead of
//! blocking forever (its parent may itself have been renamed or deleted).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::update::UpdateMessage;
use larch_store::DirectoryStore;

/// Replay state of a queued inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyState {
    /// Waiting on a structural dependency.
    Pending,
    /// Dependencies satisfied; eligible for replay.
    Ready,
    /// Replayed against the local store.
    Applied,
    /// Terminally refused (duplicate or no-op outcome).
    Rejected,
}

/// Bounds on the late-arrival queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PendingConfig {
    /// Maximum queued messages per domain before the oldest is escalated.
    pub max_queued: usize,
    /// Maximum time a message may wait for its dependency.
    pub max_age_ms: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            max_queued: 256,
            max_age_ms: 2_000,
        }
    }
}

#[derive(Debug)]
struct QueuedUpdate {
    msg: UpdateMessage,
    arrival: u64,
    queued_at: Instant,
}

/// Per-domain replay queue.
#[derive(Debug)]
pub struct DependencyResolver {
    config: PendingConfig,
    queue: Vec<QueuedUpdate>,
    next_arrival: u64,
}

impl DependencyResolver {
    /// An empty resolver with the given bounds.
    pub fn new(config: PendingConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
            next_arrival: 0,
        }
    }

    /// Queue one inbound message.
    pub fn submit(&mut self, msg: UpdateMessage) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.queue.push(QueuedUpdate {
            msg,
            arrival,
            queued_at: Instant::now(),
        });
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns true when a message with this CSN is already queued.
    pub fn contains(&self, csn: crate::csn::Csn) -> bool {
        self.queue.iter().any(|qu| qu.msg.csn() == csn)
    }

    /// Remove and return every message whose dependencies are satisfied
    /// against the current store, in CSN order. Replaying a returned
    /// message can unblock others; callers loop until this returns empty.
    pub fn take_ready(&mut self, store: &dyn DirectoryStore) -> Vec<UpdateMessage> {
        let mut ready_idx: Vec<usize> = Vec::new();
        for (i, qu) in self.queue.iter().enumerate() {
            if self.blocked_by_same_replica(qu) {
                continue;
            }
            if Self::dependencies_met(&qu.msg, store) {
                ready_idx.push(i);
            }
        }
        let mut out = Vec::with_capacity(ready_idx.len());
        for i in ready_idx.into_iter().rev() {
            out.push(self.queue.swap_remove(i).msg);
        }
        out.sort_by_key(|m| m.csn());
        out
    }

    /// Remove and return messages that overstayed the age bound or
    /// overflow the count bound, oldest first. These are replayed through
    /// the conflict engine's anomaly paths.
    pub fn drain_escalations(&mut self) -> Vec<UpdateMessage> {
        let max_age = Duration::from_millis(self.config.max_age_ms);
        let now = Instant::now();
        let mut escalate: Vec<usize> = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, qu)| now.duration_since(qu.queued_at) >= max_age)
            .map(|(i, _)| i)
            .collect();
        // Overflow beyond the count bound escalates the oldest arrivals.
        if self.queue.len() - escalate.len() > self.config.max_queued {
            let overflow = self.queue.len() - escalate.len() - self.config.max_queued;
            let mut by_age: Vec<usize> = (0..self.queue.len())
                .filter(|i| !escalate.contains(i))
                .collect();
            by_age.sort_by_key(|i| self.queue[*i].arrival);
            escalate.extend(by_age.into_iter().take(overflow));
        }
        escalate.sort_unstable();
        let mut out = Vec::with_capacity(escalate.len());
        for i in escalate.into_iter().rev() {
            out.push(self.queue.swap_remove(i).msg);
        }
        out.sort_by_key(|m| m.csn());
        out
    }

    fn blocked_by_same_replica(&self, qu: &QueuedUpdate) -> bool {
        let csn = qu.msg.csn();
        self.queue
            .iter()
            .any(|other| other.msg.replica_id() == csn.replica_id && other.msg.csn() < csn)
    }

    fn dependencies_met(msg: &UpdateMessage, store: &dyn DirectoryStore) -> bool {
        match msg {
            UpdateMessage::Add(add) => match add.parent_id {
                // Root entries are trivially ready.
                None => true,
                Some(pid) => store.find_by_id(pid).is_some(),
            },
            UpdateMessage::Delete(del) => store.children_of(del.entry_id).is_empty(),
            UpdateMessage::Modify(_) => true,
            UpdateMessage::ModifyDn(mdn) => match mdn.new_superior_id {
                None => true,
                Some(pid) => store.find_by_id(pid).is_some(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;
    use crate::update::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg};
    use larch_store::{Dn, Entry, EntryId, MemoryStore, Rdn};

    fn suffix() -> Dn {
        Dn::parse("dc=example").unwrap()
    }

    fn store_with_root() -> (MemoryStore, EntryId) {
        let store = MemoryStore::new(suffix());
        let root = EntryId::random();
        store.add_entry(Entry::new(root, suffix(), vec![])).unwrap();
        (store, root)
    }

    fn add_msg(ts: i64, replica: i32, id: EntryId, dn: &str, parent: Option<EntryId>) -> UpdateMessage {
        UpdateMessage::Add(AddMsg {
            csn: Csn::new(ts, 0, replica),
            entry_id: id,
            dn: Dn::parse(dn).unwrap(),
            parent_id: parent,
            attrs: vec![],
        })
    }

    #[test]
    fn add_waits_for_parent() {
        let (store, root) = store_with_root();
        let parent_id = EntryId::random();
        let child_id = EntryId::random();
        let mut resolver = DependencyResolver::new(PendingConfig::default());

        // Child arrives before its parent.
        resolver.submit(add_msg(
            200,
            2,
            child_id,
            "uid=c,ou=p,dc=example",
            Some(parent_id),
        ));
        assert!(resolver.take_ready(&store).is_empty());

        resolver.submit(add_msg(100, 1, parent_id, "ou=p,dc=example", Some(root)));
        let ready = resolver.take_ready(&store);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].entry_id(), parent_id);

        // Apply the parent, the child becomes ready.
        store
            .add_entry(Entry::new(
                parent_id,
                Dn::parse("ou=p,dc=example").unwrap(),
                vec![],
            ))
            .unwrap();
        let ready = resolver.take_ready(&store);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].entry_id(), child_id);
        assert!(resolver.is_empty());
    }

    #[test]
    fn delete_waits_for_children() {
        let (store, root) = store_with_root();
        let ou = EntryId::random();
        store
            .add_entry(Entry::new(ou, Dn::parse("ou=p,dc=example").unwrap(), vec![]))
            .unwrap();
        let leaf = EntryId::random();
        store
            .add_entry(Entry::new(
                leaf,
                Dn::parse("uid=a,ou=p,dc=example").unwrap(),
                vec![],
            ))
            .unwrap();
        let _ = root;

        let mut resolver = DependencyResolver::new(PendingConfig::default());
        resolver.submit(UpdateMessage::Delete(DeleteMsg {
            csn: Csn::new(100, 0, 1),
            entry_id: ou,
            dn: Dn::parse("ou=p,dc=example").unwrap(),
        }));
        assert!(resolver.take_ready(&store).is_empty());

        store.delete_entry(leaf).unwrap();
        assert_eq!(resolver.take_ready(&store).len(), 1);
    }

    #[test]
    fn same_replica_strict_csn_order() {
        let (store, root) = store_with_root();
        let a = EntryId::random();
        let b = EntryId::random();
        let mut resolver = DependencyResolver::new(PendingConfig::default());
        // Later message from replica 1 arrives first.
        resolver.submit(add_msg(200, 1, b, "uid=b,dc=example", Some(root)));
        resolver.submit(add_msg(100, 1, a, "uid=a,dc=example", Some(root)));

        let ready = resolver.take_ready(&store);
        // Both are structurally ready; order must be CSN order.
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].entry_id(), a);
        assert_eq!(ready[1].entry_id(), b);
    }

    #[test]
    fn cross_replica_messages_not_blocked_by_each_other() {
        let (store, root) = store_with_root();
        let mut resolver = DependencyResolver::new(PendingConfig::default());
        let blocked_parent = EntryId::random();
        resolver.submit(add_msg(
            100,
            1,
            EntryId::random(),
            "uid=x,ou=gone,dc=example",
            Some(blocked_parent),
        ));
        resolver.submit(add_msg(
            200,
            2,
            EntryId::random(),
            "uid=y,dc=example",
            Some(root),
        ));
        // Replica 2's message is ready even though replica 1's is stuck.
        let ready = resolver.take_ready(&store);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].replica_id(), 2);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn modify_only_waits_for_same_replica_order() {
        let (store, root) = store_with_root();
        let target = EntryId::random();
        let mut resolver = DependencyResolver::new(PendingConfig::default());
        resolver.submit(UpdateMessage::Modify(ModifyMsg {
            csn: Csn::new(200, 0, 1),
            entry_id: target,
            dn: Dn::parse("uid=a,dc=example").unwrap(),
            mods: vec![],
        }));
        resolver.submit(add_msg(100, 1, target, "uid=a,dc=example", Some(root)));
        let ready = resolver.take_ready(&store);
        assert_eq!(ready.len(), 2);
        assert!(matches!(ready[0], UpdateMessage::Add(_)));
        assert!(matches!(ready[1], UpdateMessage::Modify(_)));
    }

    #[test]
    fn modify_dn_waits_for_new_superior() {
        let (store, _) = store_with_root();
        let target = EntryId::random();
        store
            .add_entry(Entry::new(
                target,
                Dn::parse("uid=a,dc=example").unwrap(),
                vec![],
            ))
            .unwrap();
        let new_parent = EntryId::random();
        let mut resolver = DependencyResolver::new(PendingConfig::default());
        resolver.submit(UpdateMessage::ModifyDn(ModifyDnMsg {
            csn: Csn::new(100, 0, 1),
            entry_id: target,
            dn: Dn::parse("uid=a,dc=example").unwrap(),
            new_rdn: Rdn::new("uid", "a"),
            delete_old_rdn: false,
            new_superior: Some(Dn::parse("ou=p,dc=example").unwrap()),
            new_superior_id: Some(new_parent),
        }));
        assert!(resolver.take_ready(&store).is_empty());

        store
            .add_entry(Entry::new(
                new_parent,
                Dn::parse("ou=p,dc=example").unwrap(),
                vec![],
            ))
            .unwrap();
        assert_eq!(resolver.take_ready(&store).len(), 1);
    }

    #[test]
    fn aged_message_escalates() {
        let mut resolver = DependencyResolver::new(PendingConfig {
            max_queued: 256,
            max_age_ms: 0,
        });
        resolver.submit(add_msg(
            100,
            1,
            EntryId::random(),
            "uid=x,ou=gone,dc=example",
            Some(EntryId::random()),
        ));
        let escalated = resolver.drain_escalations();
        assert_eq!(escalated.len(), 1);
        assert!(resolver.is_empty());
    }

    #[test]
    fn overflow_escalates_oldest() {
        let mut resolver = DependencyResolver::new(PendingConfig {
            max_queued: 2,
            max_age_ms: 60_000,
        });
        let first = EntryId::random();
        resolver.submit(add_msg(100, 1, first, "uid=a,ou=g,dc=example", Some(EntryId::random())));
        for ts in [200, 300, 400] {
            resolver.submit(add_msg(
                ts,
                2,
                EntryId::random(),
                "uid=b,ou=g,dc=example",
                Some(EntryId::random()),
            ));
        }
        let escalated = resolver.drain_escalations();
        assert_eq!(escalated.len(), 2);
        assert_eq!(escalated[0].entry_id(), first);
        assert_eq!(resolver.len(), 2);
    }
}
