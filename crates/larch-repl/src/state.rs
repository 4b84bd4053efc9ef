//! Per-domain server state: the vector of latest CSNs seen per replica.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::csn::Csn;

/// Monotonic `replica_id -> latest CSN incorporated` vector.
///
/// One instance per (domain, local replica). Used to detect already-applied
/// messages cheaply (replay idempotence), to compute catch-up ranges on
/// reconnect, and to derive safe changelog trim points. Entries only ever
/// advance; the vector never regresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    by_replica: BTreeMap<i32, Csn>,
}

impl ServerState {
    /// An empty state vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` for its replica iff it advances the stored value.
    /// Returns true when the vector changed.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.by_replica.get(&csn.replica_id) {
            Some(stored) if *stored >= csn => false,
            _ => {
                self.by_replica.insert(csn.replica_id, csn);
                true
            }
        }
    }

    /// Returns true if `csn` is already covered (a CSN >= it from the same
    /// replica has been incorporated).
    pub fn covers(&self, csn: &Csn) -> bool {
        self.by_replica
            .get(&csn.replica_id)
            .map(|stored| *stored >= *csn)
            .unwrap_or(false)
    }

    /// The latest CSN incorporated from the given replica.
    pub fn csn_for(&self, replica_id: i32) -> Option<Csn> {
        self.by_replica.get(&replica_id).copied()
    }

    /// Replica ids present in the vector.
    pub fn replicas(&self) -> Vec<i32> {
        self.by_replica.keys().copied().collect()
    }

    /// Iterate over `(replica_id, latest CSN)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (i32, Csn)> + '_ {
        self.by_replica.iter().map(|(id, csn)| (*id, *csn))
    }

    /// Fold another vector in, keeping the maximum per replica.
    pub fn merge(&mut self, other: &ServerState) {
        for (_, csn) in other.iter() {
            self.update(csn);
        }
    }

    /// Per-replica minimum across `self` and `other`, restricted to
    /// replicas present in both. This is the safe trim vector across a set
    /// of peers: everything at or below it has been incorporated everywhere.
    pub fn floor_with(&self, other: &ServerState) -> ServerState {
        let mut floor = ServerState::new();
        for (replica_id, mine) in self.iter() {
            if let Some(theirs) = other.csn_for(replica_id) {
                floor.update(mine.min(theirs));
            }
        }
        floor
    }

    /// Returns true if the vector has no entries.
    pub fn is_empty(&self) -> bool {
        self.by_replica.is_empty()
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (replica_id, csn) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", replica_id, csn)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn update_advances_and_never_regresses() {
        let mut state = ServerState::new();
        assert!(state.update(Csn::new(100, 0, 1)));
        assert!(state.update(Csn::new(200, 0, 1)));
        assert!(!state.update(Csn::new(150, 0, 1)));
        assert_eq!(state.csn_for(1), Some(Csn::new(200, 0, 1)));
    }

    #[test]
    fn covers_is_per_replica() {
        let mut state = ServerState::new();
        state.update(Csn::new(200, 0, 1));
        assert!(state.covers(&Csn::new(150, 0, 1)));
        assert!(state.covers(&Csn::new(200, 0, 1)));
        assert!(!state.covers(&Csn::new(201, 0, 1)));
        assert!(!state.covers(&Csn::new(1, 0, 2)));
    }

    #[test]
    fn merge_keeps_maxima() {
        let mut a = ServerState::new();
        a.update(Csn::new(100, 0, 1));
        a.update(Csn::new(300, 0, 2));
        let mut b = ServerState::new();
        b.update(Csn::new(200, 0, 1));
        b.update(Csn::new(250, 0, 2));
        a.merge(&b);
        assert_eq!(a.csn_for(1), Some(Csn::new(200, 0, 1)));
        assert_eq!(a.csn_for(2), Some(Csn::new(300, 0, 2)));
    }

    #[test]
    fn floor_with_takes_minima_of_common_replicas() {
        let mut a = ServerState::new();
        a.update(Csn::new(100, 0, 1));
        a.update(Csn::new(300, 0, 2));
        let mut b = ServerState::new();
        b.update(Csn::new(200, 0, 1));
        let floor = a.floor_with(&b);
        assert_eq!(floor.csn_for(1), Some(Csn::new(100, 0, 1)));
        assert_eq!(floor.csn_for(2), None);
    }

    #[test]
    fn serde_roundtrip() {
        let mut state = ServerState::new();
        state.update(Csn::new(100, 5, 1));
        state.update(Csn::new(200, 0, 9));
        let bytes = bincode::serialize(&state).unwrap();
        let back: ServerState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, state);
    }

    proptest! {
        #[test]
        fn prop_update_is_monotonic(
            csns in proptest::collection::vec(
                (0i64..1_000_000, 0i32..100, 0i32..8), 1..100),
        ) {
            let mut state = ServerState::new();
            for (ts, seq, replica) in csns {
                let csn = Csn::new(ts, seq, replica);
                let before = state.csn_for(replica);
                state.update(csn);
                let after = state.csn_for(replica).unwrap();
                if let Some(prev) = before {
                    prop_assert!(after >= prev);
                }
                prop_assert!(state.covers(&csn));
            }
        }
    }
}
