//! Full initialization: streaming a domain snapshot to a peer.
//!
//! The source serializes its baseline (entries in parent-before-child
//! order, each with its modification history attached) into fixed-size
//! batches, compresses each with lz4, and streams them as numbered chunks
//! followed by a final marker carrying the generation id, the state vector,
//! and the total entry count for validation.

use tracing::{debug, info};

use crate::error::ReplError;
use crate::generation::GenerationId;
use crate::session::ReplMsg;
use crate::state::ServerState;
use larch_store::Entry;

/// Entries per chunk. Chunks stay well under typical frame limits while
/// keeping per-chunk compression effective.
pub const ENTRIES_PER_CHUNK: usize = 64;

/// Encode a snapshot into the message sequence to stream at a peer:
/// `InitChunk` frames followed by one `InitDone`.
pub fn encode_snapshot(
    entries: &[Entry],
    generation: GenerationId,
    state: &ServerState,
) -> Result<Vec<ReplMsg>, ReplError> {
    let mut msgs = Vec::with_capacity(entries.len() / ENTRIES_PER_CHUNK + 2);
    for (seq, batch) in entries.chunks(ENTRIES_PER_CHUNK).enumerate() {
        let raw = bincode::serialize(batch)?;
        let payload = lz4_flex::compress_prepend_size(&raw);
        debug!(
            seq,
            entries = batch.len(),
            raw = raw.len(),
            compressed = payload.len(),
            "snapshot chunk encoded"
        );
        msgs.push(ReplMsg::InitChunk {
            seq: seq as u32,
            payload,
        });
    }
    msgs.push(ReplMsg::InitDone {
        generation,
        state: state.clone(),
        total_entries: entries.len() as u64,
    });
    Ok(msgs)
}

/// Accumulates init chunks on the receiving side.
#[derive(Debug, Default)]
pub struct SnapshotReceiver {
    chunks: Vec<(u32, Vec<u8>)>,
}

impl SnapshotReceiver {
    /// An empty receiver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks received so far.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true when no chunk has arrived yet.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Record one chunk. Out-of-order and duplicate sequence numbers are
    /// tolerated; `finish` validates completeness.
    pub fn push_chunk(&mut self, seq: u32, payload: Vec<u8>) {
        if self.chunks.iter().any(|(s, _)| *s == seq) {
            return;
        }
        self.chunks.push((seq, payload));
    }

    /// Decode the accumulated chunks into the entry list, validating the
    /// sequence numbering and the announced entry count.
    pub fn finish(mut self, total_entries: u64) -> Result<Vec<Entry>, ReplError> {
        self.chunks.sort_by_key(|(seq, _)| *seq);
        for (expected, (seq, _)) in self.chunks.iter().enumerate() {
            if *seq != expected as u32 {
                return Err(ReplError::Malformed {
                    msg: format!("init chunk gap: expected seq {expected}, got {seq}"),
                });
            }
        }
        let mut entries = Vec::with_capacity(total_entries as usize);
        for (seq, payload) in self.chunks {
            let raw = lz4_flex::decompress_size_prepended(&payload).map_err(|e| {
                ReplError::Malformed {
                    msg: format!("init chunk {seq} decompression failed: {e}"),
                }
            })?;
            let batch: Vec<Entry> = bincode::deserialize(&raw)?;
            entries.extend(batch);
        }
        if entries.len() as u64 != total_entries {
            return Err(ReplError::Malformed {
                msg: format!(
                    "init entry count mismatch: announced {total_entries}, received {}",
                    entries.len()
                ),
            });
        }
        info!(entries = entries.len(), "snapshot stream decoded");
        Ok(entries)
    }
}
