//! Generation ids: fingerprints of a domain's replication baseline.
//!
//! Two replicas may exchange updates only while their histories share an
//! ancestry; the generation id detects divergence. It is a keyed BLAKE3
//! digest over the ordered baseline (entry count plus the first
//! `min(1000, n)` entries' id, DN, and attributes), truncated to 64 bits.

use serde::{Deserialize, Serialize};
use std::fmt;

use larch_store::DirectoryStore;

/// How many baseline entries feed the fingerprint. Bounded so recomputing
/// on a large domain stays cheap; the entry count still covers the rest.
const BASELINE_SAMPLE: usize = 1000;

const GENERATION_KEY: &[u8; 32] = b"larch-generation-id-fingerprint!";

/// 64-bit fingerprint of a domain's "data + history" starting point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct GenerationId(pub u64);

impl GenerationId {
    /// Sentinel for "empty domain, no baseline yet".
    pub const UNSET: GenerationId = GenerationId(u64::MAX);

    /// Returns true unless this is the [`Self::UNSET`] sentinel.
    pub fn is_set(&self) -> bool {
        *self != Self::UNSET
    }

    /// Compute the generation id of a store's current baseline.
    ///
    /// Two replicas with identical ancestry produce the same id; any
    /// independent re-initialization (import, restore) produces a new one.
    /// An empty store yields [`Self::UNSET`].
    pub fn compute(store: &dyn DirectoryStore) -> GenerationId {
        let baseline = store.baseline();
        if baseline.is_empty() {
            return Self::UNSET;
        }
        let mut hasher = blake3::Hasher::new_keyed(GENERATION_KEY);
        hasher.update(&(baseline.len() as u64).to_le_bytes());
        for entry in baseline.iter().take(BASELINE_SAMPLE) {
            hasher.update(entry.id.0.as_bytes());
            hasher.update(entry.dn.to_string().as_bytes());
            for (attr, values) in &entry.attrs {
                hasher.update(attr.as_bytes());
                for value in values {
                    hasher.update(value.as_bytes());
                }
            }
        }
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        let id = u64::from_le_bytes(word);
        // Keep the sentinel unreachable from real data.
        if id == u64::MAX {
            GenerationId(u64::MAX - 1)
        } else {
            GenerationId(id)
        }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{:016x}", self.0)
        } else {
            write!(f, "unset")
        }
    }
}

/// Standing replication status of a peer or domain with respect to its
/// generation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GenerationStatus {
    /// Generation ids match; updates replay normally.
    #[default]
    Normal,
    /// Generation ids diverged: updates are accepted into the changelog but
    /// not replayed, and the peer is excluded from fanout until re-init.
    BadGeneration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_store::{Dn, Entry, EntryId, MemoryStore, Modification};
    use uuid::Uuid;

    fn fixed_id(n: u128) -> EntryId {
        EntryId(Uuid::from_u128(n))
    }

    fn populated_store() -> MemoryStore {
        let suffix = Dn::parse("dc=example").unwrap();
        let store = MemoryStore::new(suffix.clone());
        store
            .add_entry(Entry::new(fixed_id(1), suffix, vec![]))
            .unwrap();
        store
            .add_entry(Entry::new(
                fixed_id(2),
                Dn::parse("uid=a,dc=example").unwrap(),
                vec![("cn".into(), "Alice".into())],
            ))
            .unwrap();
        store
    }

    #[test]
    fn empty_store_is_unset() {
        let store = MemoryStore::new(Dn::parse("dc=example").unwrap());
        assert_eq!(GenerationId::compute(&store), GenerationId::UNSET);
        assert!(!GenerationId::compute(&store).is_set());
    }

    #[test]
    fn identical_baselines_match() {
        let a = populated_store();
        let b = populated_store();
        assert_eq!(GenerationId::compute(&a), GenerationId::compute(&b));
        assert!(GenerationId::compute(&a).is_set());
    }

    #[test]
    fn content_change_changes_generation() {
        let a = populated_store();
        let b = populated_store();
        b.modify_entry(fixed_id(2), &[Modification::replace("cn", "Bob")])
            .unwrap();
        assert_ne!(GenerationId::compute(&a), GenerationId::compute(&b));
    }

    #[test]
    fn extra_entry_changes_generation() {
        let a = populated_store();
        let b = populated_store();
        b.add_entry(Entry::new(
            fixed_id(3),
            Dn::parse("uid=b,dc=example").unwrap(),
            vec![],
        ))
        .unwrap();
        assert_ne!(GenerationId::compute(&a), GenerationId::compute(&b));
    }

    #[test]
    fn display_forms() {
        assert_eq!(GenerationId::UNSET.to_string(), "unset");
        assert_eq!(GenerationId(0xabcd).to_string(), "000000000000abcd");
    }
}
