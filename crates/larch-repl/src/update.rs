//! Replicated update messages.
//!
//! A closed tagged union over the four directory operations. Every variant
//! carries the target entry's immutable unique id, the DN at send time, and
//! the CSN stamped by the originating replica. The DN is advisory: by the
//! time a message replays, another replica may already have renamed the
//! entry, and the engine always resolves the target by unique id first.

use serde::{Deserialize, Serialize};

use crate::csn::Csn;
use larch_store::{Dn, EntryId, Modification, Rdn};

/// Add a new entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddMsg {
    /// CSN of the operation.
    pub csn: Csn,
    /// Unique id assigned to the new entry.
    pub entry_id: EntryId,
    /// DN the entry was created at on the originating replica.
    pub dn: Dn,
    /// Unique id of the parent entry; `None` for the domain root.
    pub parent_id: Option<EntryId>,
    /// Full attribute list as (type, value) pairs.
    pub attrs: Vec<(String, String)>,
}

/// Delete a single entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteMsg {
    /// CSN of the operation.
    pub csn: Csn,
    /// Unique id of the entry to delete.
    pub entry_id: EntryId,
    /// DN of the entry on the originating replica at send time.
    pub dn: Dn,
}

/// Modify an entry's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyMsg {
    /// CSN of the operation.
    pub csn: Csn,
    /// Unique id of the target entry.
    pub entry_id: EntryId,
    /// DN of the entry on the originating replica at send time.
    pub dn: Dn,
    /// Attribute modifications, in order.
    pub mods: Vec<Modification>,
}

/// Rename and/or move an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyDnMsg {
    /// CSN of the operation.
    pub csn: Csn,
    /// Unique id of the target entry.
    pub entry_id: EntryId,
    /// DN of the entry on the originating replica at send time.
    pub dn: Dn,
    /// The new leaf RDN.
    pub new_rdn: Rdn,
    /// Whether the old RDN value is removed from the entry's attributes.
    pub delete_old_rdn: bool,
    /// New superior DN, when the entry moves; `None` keeps the parent.
    pub new_superior: Option<Dn>,
    /// Unique id of the new superior, used to re-resolve a moved parent.
    pub new_superior_id: Option<EntryId>,
}

/// One replicated directory update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateMessage {
    /// Entry creation.
    Add(AddMsg),
    /// Entry deletion.
    Delete(DeleteMsg),
    /// Attribute modification.
    Modify(ModifyMsg),
    /// Rename / move.
    ModifyDn(ModifyDnMsg),
}

impl UpdateMessage {
    /// The operation's CSN.
    pub fn csn(&self) -> Csn {
        match self {
            UpdateMessage::Add(m) => m.csn,
            UpdateMessage::Delete(m) => m.csn,
            UpdateMessage::Modify(m) => m.csn,
            UpdateMessage::ModifyDn(m) => m.csn,
        }
    }

    /// The target entry's unique id.
    pub fn entry_id(&self) -> EntryId {
        match self {
            UpdateMessage::Add(m) => m.entry_id,
            UpdateMessage::Delete(m) => m.entry_id,
            UpdateMessage::Modify(m) => m.entry_id,
            UpdateMessage::ModifyDn(m) => m.entry_id,
        }
    }

    /// The DN carried by the message (possibly stale at replay time).
    pub fn dn(&self) -> &Dn {
        match self {
            UpdateMessage::Add(m) => &m.dn,
            UpdateMessage::Delete(m) => &m.dn,
            UpdateMessage::Modify(m) => &m.dn,
            UpdateMessage::ModifyDn(m) => &m.dn,
        }
    }

    /// Short operation name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateMessage::Add(_) => "add",
            UpdateMessage::Delete(_) => "delete",
            UpdateMessage::Modify(_) => "modify",
            UpdateMessage::ModifyDn(_) => "modify-dn",
        }
    }

    /// The replica that originated the update.
    pub fn replica_id(&self) -> i32 {
        self.csn().replica_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_store::ModKind;

    fn sample_add() -> UpdateMessage {
        UpdateMessage::Add(AddMsg {
            csn: Csn::new(1000, 0, 1),
            entry_id: EntryId::random(),
            dn: Dn::parse("uid=a,dc=example").unwrap(),
            parent_id: Some(EntryId::random()),
            attrs: vec![("uid".into(), "a".into())],
        })
    }

    #[test]
    fn accessors_dispatch_per_variant() {
        let add = sample_add();
        assert_eq!(add.kind(), "add");
        assert_eq!(add.csn(), Csn::new(1000, 0, 1));
        assert_eq!(add.replica_id(), 1);
        assert_eq!(add.dn().to_string(), "uid=a,dc=example");

        let del = UpdateMessage::Delete(DeleteMsg {
            csn: Csn::new(2000, 3, 4),
            entry_id: EntryId::random(),
            dn: Dn::parse("uid=b,dc=example").unwrap(),
        });
        assert_eq!(del.kind(), "delete");
        assert_eq!(del.replica_id(), 4);
    }

    #[test]
    fn bincode_roundtrip_all_variants() {
        let id = EntryId::random();
        let msgs = vec![
            sample_add(),
            UpdateMessage::Delete(DeleteMsg {
                csn: Csn::new(1, 2, 3),
                entry_id: id,
                dn: Dn::parse("uid=b,dc=example").unwrap(),
            }),
            UpdateMessage::Modify(ModifyMsg {
                csn: Csn::new(4, 5, 6),
                entry_id: id,
                dn: Dn::parse("uid=c,dc=example").unwrap(),
                mods: vec![Modification::new(
                    ModKind::Replace,
                    "cn",
                    vec!["x".into()],
                )],
            }),
            UpdateMessage::ModifyDn(ModifyDnMsg {
                csn: Csn::new(7, 8, 9),
                entry_id: id,
                dn: Dn::parse("uid=d,ou=people,dc=example").unwrap(),
                new_rdn: Rdn::new("uid", "e"),
                delete_old_rdn: true,
                new_superior: Some(Dn::parse("ou=staff,dc=example").unwrap()),
                new_superior_id: Some(id),
            }),
        ];
        for msg in msgs {
            let bytes = bincode::serialize(&msg).unwrap();
            let back: UpdateMessage = bincode::deserialize(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }
}
