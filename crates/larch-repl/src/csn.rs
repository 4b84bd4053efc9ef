//! Change sequence numbers: the logical clock of the replication core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A change sequence number: a totally ordered, collision-free logical
/// timestamp identifying one update.
///
/// Ordering is by timestamp, then sequence number, then replica id; the
/// replica id breaks same-millisecond ties between generators, so no two
/// CSNs from correctly behaving generators compare equal. Field order
/// matters: the derived `Ord` is the wire ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Csn {
    /// Milliseconds since the Unix epoch, as seen by the issuing generator.
    pub timestamp_ms: i64,
    /// Disambiguates same-millisecond bursts from one replica.
    pub seq_num: i32,
    /// The issuing replica.
    pub replica_id: i32,
}

impl Csn {
    /// Build a CSN from its parts.
    pub fn new(timestamp_ms: i64, seq_num: i32, replica_id: i32) -> Self {
        Self {
            timestamp_ms,
            seq_num,
            replica_id,
        }
    }
}

impl fmt::Display for Csn {
    /// Fixed-width hex rendering, sortable as a string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{:08x}",
            self.timestamp_ms as u64, self.seq_num as u32, self.replica_id as u32
        )
    }
}

impl FromStr for Csn {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ts = u64::from_str_radix(s.get(..16.min(s.len())).unwrap_or(""), 16)?;
        let seq = u32::from_str_radix(s.get(16..24).unwrap_or(""), 16)?;
        let replica = u32::from_str_radix(s.get(24..32).unwrap_or(""), 16)?;
        Ok(Self {
            timestamp_ms: ts as i64,
            seq_num: seq as i32,
            replica_id: replica as i32,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    timestamp_ms: i64,
    seq_num: i32,
}

/// Per-replica CSN generator.
///
/// `new_csn` returns a value strictly greater than any previously issued
/// value and any value passed to `adjust`. The internal clock is advanced
/// to at least the highest CSN observed from any peer, so causally later
/// local operations always sort after their externally observed causes,
/// regardless of wall-clock skew between nodes.
#[derive(Debug)]
pub struct CsnGenerator {
    replica_id: i32,
    state: Mutex<ClockState>,
}

impl CsnGenerator {
    /// Create a generator for the given replica.
    pub fn new(replica_id: i32) -> Self {
        Self {
            replica_id,
            state: Mutex::new(ClockState {
                timestamp_ms: 0,
                seq_num: -1,
            }),
        }
    }

    /// The replica this generator issues for.
    pub fn replica_id(&self) -> i32 {
        self.replica_id
    }

    /// Issue a fresh CSN, strictly above everything issued or adjusted.
    pub fn new_csn(&self) -> Csn {
        let mut state = self.state.lock().unwrap();
        let wall = now_ms();
        if wall > state.timestamp_ms {
            state.timestamp_ms = wall;
            state.seq_num = 0;
        } else if state.seq_num == i32::MAX {
            // Sequence exhausted within one logical millisecond.
            state.timestamp_ms += 1;
            state.seq_num = 0;
        } else {
            state.seq_num += 1;
        }
        Csn::new(state.timestamp_ms, state.seq_num, self.replica_id)
    }

    /// Advance the internal clock to at least the given CSN.
    ///
    /// Called for every CSN received from a peer, and whenever a local
    /// operation must be ordered after an externally known event. Never
    /// regresses the clock.
    pub fn adjust(&self, csn: &Csn) {
        let mut state = self.state.lock().unwrap();
        if csn.timestamp_ms > state.timestamp_ms {
            state.timestamp_ms = csn.timestamp_ms;
            state.seq_num = csn.seq_num;
        } else if csn.timestamp_ms == state.timestamp_ms && csn.seq_num > state.seq_num {
            state.seq_num = csn.seq_num;
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
