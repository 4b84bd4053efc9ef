//! Durable per-(domain, replica) changelog.
//!
//! Append-only sequence of update messages keyed by CSN. Records are
//! length-prefixed bincode with a trailing CRC32; `append` does not return
//! until the record is durable under the configured sync mode. On open,
//! every record is CRC-validated and a torn tail (crash mid-append) is
//! truncated rather than propagated.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::csn::Csn;
use crate::error::ReplError;
use crate::state::ServerState;
use crate::update::UpdateMessage;

/// Sync strategy for changelog persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncMode {
    /// fsync after every append (safest, the default).
    #[default]
    Sync,
    /// fsync after every N appends (group commit).
    Batch {
        /// Appends between syncs.
        every: usize,
    },
}

/// Configuration for a changelog store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChangelogConfig {
    /// Sync strategy.
    pub sync_mode: SyncMode,
}

/// Statistics for one changelog store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChangelogStats {
    /// Records appended since open.
    pub appends: u64,
    /// Records recovered from disk on open.
    pub recovered: u64,
    /// Torn-tail bytes truncated on open.
    pub truncated_bytes: u64,
    /// Records removed by purges.
    pub purged: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    csn: Csn,
    msg: UpdateMessage,
}

struct ReplicaLog {
    path: PathBuf,
    file: File,
    /// In-memory mirror, CSN-ordered. Serves reads without re-scanning disk.
    records: Vec<Record>,
    pending_sync: usize,
}

impl ReplicaLog {
    fn last_csn(&self) -> Option<Csn> {
        self.records.last().map(|r| r.csn)
    }
}

/// Durable changelog for one domain, holding one log per source replica.
pub struct ChangelogStore {
    domain_id: u32,
    dir: PathBuf,
    config: ChangelogConfig,
    logs: Mutex<HashMap<i32, ReplicaLog>>,
    stats: Mutex<ChangelogStats>,
}

impl ChangelogStore {
    /// Open (or create) the changelog for `domain_id` under `dir`,
    /// recovering any existing per-replica logs.
    pub fn open(
        dir: impl AsRef<Path>,
        domain_id: u32,
        config: ChangelogConfig,
    ) -> Result<Self, ReplError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut logs = HashMap::new();
        let mut stats = ChangelogStats::default();
        let prefix = format!("d{:08x}_r", domain_id);
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(id_part) = rest.strip_suffix(".log") else {
                continue;
            };
            let Ok(replica_id) = id_part.parse::<i32>() else {
                continue;
            };
            let log = recover_log(&dirent.path(), &mut stats)?;
            logs.insert(replica_id, log);
        }
        debug!(
            domain_id,
            replicas = logs.len(),
            recovered = stats.recovered,
            "changelog opened"
        );
        Ok(Self {
            domain_id,
            dir,
            config,
            logs: Mutex::new(logs),
            stats: Mutex::new(stats),
        })
    }

    fn log_path(&self, replica_id: i32) -> PathBuf {
        self.dir
            .join(format!("d{:08x}_r{}.log", self.domain_id, replica_id))
    }

    /// Durably append one update message to its source replica's log.
    ///
    /// Once this returns `Ok`, the message survives process restart. A
    /// message whose CSN is already present is a no-op (resend on
    /// reconnect is expected).
    pub fn append(&self, msg: &UpdateMessage) -> Result<(), ReplError> {
        let csn = msg.csn();
        let mut logs = self.logs.lock().unwrap();
        let log = match logs.entry(csn.replica_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = self.log_path(csn.replica_id);
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                e.insert(ReplicaLog {
                    path,
                    file,
                    records: Vec::new(),
                    pending_sync: 0,
                })
            }
        };
        // The mirror is CSN-sorted, so the duplicate check and the
        // insertion point come from one binary search.
        let pos = match log.records.binary_search_by_key(&csn, |r| r.csn) {
            Ok(_) => return Ok(()),
            Err(pos) => pos,
        };
        let record = Record {
            csn,
            msg: msg.clone(),
        };
        let body = bincode::serialize(&record)?;
        log.file.write_all(&(body.len() as u32).to_le_bytes())?;
        log.file.write_all(&body)?;
        log.file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        log.pending_sync += 1;
        let must_sync = match self.config.sync_mode {
            SyncMode::Sync => true,
            SyncMode::Batch { every } => log.pending_sync >= every.max(1),
        };
        if must_sync {
            log.file.sync_all()?;
            log.pending_sync = 0;
        }
        if pos == log.records.len() {
            log.records.push(record);
        } else {
            log.records.insert(pos, record);
        }
        self.stats.lock().unwrap().appends += 1;
        Ok(())
    }

    /// Force any batched-but-unsynced appends to disk.
    pub fn sync(&self) -> Result<(), ReplError> {
        let mut logs = self.logs.lock().unwrap();
        for log in logs.values_mut() {
            if log.pending_sync > 0 {
                log.file.sync_all()?;
                log.pending_sync = 0;
            }
        }
        Ok(())
    }

    /// Messages from one replica with CSN strictly greater than `after`
    /// (all of them when `after` is `None`), in CSN order.
    pub fn read_from(&self, replica_id: i32, after: Option<Csn>) -> Vec<UpdateMessage> {
        let logs = self.logs.lock().unwrap();
        let Some(log) = logs.get(&replica_id) else {
            return Vec::new();
        };
        log.records
            .iter()
            .filter(|r| after.map(|a| r.csn > a).unwrap_or(true))
            .map(|r| r.msg.clone())
            .collect()
    }

    /// Up to `max` messages not yet covered by `state`, merged across
    /// replicas in CSN order. Restartable: advance `state` with what was
    /// replayed and call again.
    pub fn read_after(&self, state: &ServerState, max: usize) -> Vec<UpdateMessage> {
        let logs = self.logs.lock().unwrap();
        let mut out: Vec<UpdateMessage> = Vec::new();
        for log in logs.values() {
            for r in &log.records {
                if !state.covers(&r.csn) {
                    out.push(r.msg.clone());
                }
            }
        }
        out.sort_by_key(|m| m.csn());
        out.truncate(max);
        out
    }

    /// The oldest retained CSN for a replica, if any.
    pub fn oldest_csn(&self, replica_id: i32) -> Option<Csn> {
        let logs = self.logs.lock().unwrap();
        logs.get(&replica_id)
            .and_then(|log| log.records.first().map(|r| r.csn))
    }

    /// The newest CSN per replica, as a state vector.
    pub fn newest_state(&self) -> ServerState {
        let logs = self.logs.lock().unwrap();
        let mut state = ServerState::new();
        for log in logs.values() {
            if let Some(csn) = log.last_csn() {
                state.update(csn);
            }
        }
        state
    }

    /// Total retained records across replicas.
    pub fn count(&self) -> usize {
        let logs = self.logs.lock().unwrap();
        logs.values().map(|log| log.records.len()).sum()
    }

    /// Remove every record covered by `floor` (per-replica minimum of all
    /// peers' acknowledged state). Each trimmed log is rewritten to a
    /// temporary file and atomically renamed into place.
    pub fn purge_before(&self, floor: &ServerState) -> Result<usize, ReplError> {
        let mut logs = self.logs.lock().unwrap();
        let mut removed = 0usize;
        for (replica_id, log) in logs.iter_mut() {
            let Some(cutoff) = floor.csn_for(*replica_id) else {
                continue;
            };
            let keep_from = log.records.partition_point(|r| r.csn <= cutoff);
            if keep_from == 0 {
                continue;
            }
            removed += keep_from;
            log.records.drain(..keep_from);
            rewrite_log(log)?;
        }
        if removed > 0 {
            self.stats.lock().unwrap().purged += removed as u64;
            debug!(domain_id = self.domain_id, removed, "changelog purged");
        }
        Ok(removed)
    }

    /// Snapshot of the store's statistics.
    pub fn stats(&self) -> ChangelogStats {
        *self.stats.lock().unwrap()
    }

    /// The domain this store serves.
    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }
}

fn recover_log(path: &Path, stats: &mut ChangelogStats) -> Result<ReplicaLog, ReplError> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut valid_end = 0usize;
    loop {
        if offset + 4 > buf.len() {
            break;
        }
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let body_start = offset + 4;
        let crc_start = body_start + len;
        if crc_start + 4 > buf.len() {
            break;
        }
        let body = &buf[body_start..crc_start];
        let stored_crc =
            u32::from_le_bytes(buf[crc_start..crc_start + 4].try_into().unwrap());
        if crc32fast::hash(body) != stored_crc {
            break;
        }
        let Ok(record) = bincode::deserialize::<Record>(body) else {
            break;
        };
        records.push(record);
        offset = crc_start + 4;
        valid_end = offset;
    }
    if valid_end < buf.len() {
        let torn = (buf.len() - valid_end) as u64;
        warn!(path = %path.display(), torn_bytes = torn, "truncating torn changelog tail");
        stats.truncated_bytes += torn;
        let f = OpenOptions::new().write(true).open(path)?;
        f.set_len(valid_end as u64)?;
        f.sync_all()?;
    }
    stats.recovered += records.len() as u64;
    records.sort_by_key(|r| r.csn);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(ReplicaLog {
        path: path.to_path_buf(),
        file,
        records,
        pending_sync: 0,
    })
}

fn rewrite_log(log: &mut ReplicaLog) -> Result<(), ReplError> {
    let tmp_path = log.path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for r in &log.records {
            let body = bincode::serialize(r)?;
            tmp.write_all(&(body.len() as u32).to_le_bytes())?;
            tmp.write_all(&body)?;
            tmp.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        }
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, &log.path)?;
    log.file = OpenOptions::new().create(true).append(true).open(&log.path)?;
    log.pending_sync = 0;
    Ok(())
}
