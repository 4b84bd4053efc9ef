//! The relay: hub side of the replication topology.
//!
//! Members connect to a relay, which journals every update durably before
//! fanning it out to the other members, serves changelog catch-up to
//! reconnecting members, enforces per-peer flow control, and trims the
//! changelog once every member has acknowledged replay. A member whose
//! generation id diverges (or whose catch-up position was already purged)
//! is acknowledged as degraded: its updates are journaled but it is
//! excluded from fanout until re-initialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::changelog::{ChangelogConfig, ChangelogStats, ChangelogStore};
use crate::error::ReplError;
use crate::generation::GenerationId;
use crate::session::{ReplMsg, Session};
use crate::state::ServerState;
use crate::update::UpdateMessage;
use crate::window::{AcquireOutcome, ReceiveWindow, SendWindow, WindowConfig};

/// Configuration for a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The replicated domain this relay serves.
    pub domain_id: u32,
    /// The relay's server id (distinct from member replica ids).
    pub server_id: i32,
    /// Flow-control settings (the window granted to each member).
    pub window: WindowConfig,
    /// Per-peer fanout queue capacity; overflow switches the peer to
    /// changelog catch-up.
    pub queue_capacity: usize,
    /// Updates per changelog catch-up batch.
    pub catch_up_batch: usize,
    /// Changelog persistence settings.
    pub changelog: ChangelogConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            domain_id: 1,
            server_id: 1000,
            window: WindowConfig::default(),
            queue_capacity: 5_000,
            catch_up_batch: 100,
            changelog: ChangelogConfig::default(),
        }
    }
}

/// Point-in-time status of one connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    /// The peer's replica id.
    pub replica_id: i32,
    /// True when excluded from fanout pending re-initialization.
    pub degraded: bool,
    /// True while the peer is fed from the changelog instead of the queue.
    pub catching_up: bool,
    /// Newest CSN per replica the peer acknowledged replaying.
    pub acked: String,
    /// Newest CSN per replica sent to the peer.
    pub sent: String,
}

/// Point-in-time status of a relay, for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatus {
    /// The relay's server id.
    pub server_id: i32,
    /// The domain served.
    pub domain_id: u32,
    /// The relay's generation id.
    pub generation: GenerationId,
    /// Connected peers.
    pub peers: Vec<PeerStatus>,
    /// Changelog statistics.
    pub changelog: ChangelogStats,
    /// Retained changelog records.
    pub retained: usize,
}

struct Peer {
    replica_id: i32,
    session: Session,
    send_window: SendWindow,
    recv_window: ReceiveWindow,
    acked: Mutex<ServerState>,
    sent: Mutex<ServerState>,
    degraded: AtomicBool,
    catching_up: AtomicBool,
    queue_tx: mpsc::Sender<UpdateMessage>,
}

/// Hub server for one replicated domain.
pub struct Relay {
    config: RelayConfig,
    changelog: ChangelogStore,
    generation: Mutex<GenerationId>,
    purged_floor: Mutex<ServerState>,
    peers: DashMap<i32, Arc<Peer>>,
}

impl Relay {
    /// Open a relay, recovering its changelog from `changelog_dir`.
    pub fn open(
        config: RelayConfig,
        changelog_dir: impl AsRef<std::path::Path>,
    ) -> Result<Self, ReplError> {
        let changelog =
            ChangelogStore::open(changelog_dir, config.domain_id, config.changelog.clone())?;
        info!(
            server_id = config.server_id,
            domain_id = config.domain_id,
            retained = changelog.count(),
            "relay opened"
        );
        Ok(Self {
            config,
            changelog,
            generation: Mutex::new(GenerationId::UNSET),
            purged_floor: Mutex::new(ServerState::new()),
            peers: DashMap::new(),
        })
    }

    /// The relay's current generation id.
    pub fn generation(&self) -> GenerationId {
        *self.generation.lock().unwrap()
    }

    /// Point-in-time status for monitoring.
    pub fn status_report(&self) -> RelayStatus {
        let peers = self
            .peers
            .iter()
            .map(|entry| {
                let peer = entry.value();
                PeerStatus {
                    replica_id: peer.replica_id,
                    degraded: peer.degraded.load(Ordering::Relaxed),
                    catching_up: peer.catching_up.load(Ordering::Relaxed),
                    acked: peer.acked.lock().unwrap().to_string(),
                    sent: peer.sent.lock().unwrap().to_string(),
                }
            })
            .collect();
        RelayStatus {
            server_id: self.config.server_id,
            domain_id: self.config.domain_id,
            generation: self.generation(),
            peers,
            changelog: self.changelog.stats(),
            retained: self.changelog.count(),
        }
    }

    /// Serve one member session for its lifetime: handshake, inbound loop,
    /// and the outbound fanout/catch-up task.
    pub async fn handle_peer(self: Arc<Self>, session: Session) -> Result<(), ReplError> {
        let hello = session.recv().await.ok_or(ReplError::Handshake {
            msg: "session closed before handshake".to_string(),
        })??;
        let ReplMsg::Handshake {
            replica_id,
            domain_id,
            generation: peer_generation,
            state: peer_state,
            window_size: peer_window,
        } = hello
        else {
            return Err(ReplError::Handshake {
                msg: format!("expected handshake, got {hello:?}"),
            });
        };
        if domain_id != self.config.domain_id {
            return Err(ReplError::Handshake {
                msg: format!(
                    "domain mismatch: relay serves {}, peer sent {domain_id}",
                    self.config.domain_id
                ),
            });
        }

        let degraded = self.assess_peer(replica_id, peer_generation, &peer_state);
        session
            .send(&ReplMsg::HandshakeAck {
                server_id: self.config.server_id,
                generation: self.generation(),
                state: self.changelog.newest_state(),
                window_size: self.config.window.size,
                degraded,
            })
            .await?;

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let peer = Arc::new(Peer {
            replica_id,
            session: session.clone(),
            send_window: SendWindow::new(peer_window),
            recv_window: ReceiveWindow::new(self.config.window.size),
            acked: Mutex::new(peer_state.clone()),
            sent: Mutex::new(peer_state.clone()),
            degraded: AtomicBool::new(degraded),
            // Healthy peers start in catch-up; the outbound task settles
            // them into queue mode only once a changelog read performed
            // after the peer is visible to fanout comes back empty.
            catching_up: AtomicBool::new(!degraded),
            queue_tx,
        });
        self.peers.insert(replica_id, Arc::clone(&peer));
        info!(
            replica_id,
            degraded,
            catching_up = peer.catching_up.load(Ordering::Relaxed),
            "peer connected"
        );

        let outbound = tokio::spawn(Self::run_outbound(
            Arc::clone(&self),
            Arc::clone(&peer),
            queue_rx,
        ));

        let result = self.run_inbound(&session, &peer).await;

        self.peers
            .remove_if(&replica_id, |_, p| Arc::ptr_eq(p, &peer));
        outbound.abort();
        info!(replica_id, "peer disconnected");
        result
    }

    /// Decide the peer's standing at handshake time: degraded on a
    /// generation mismatch, or when its catch-up position predates the
    /// purge horizon.
    fn assess_peer(
        &self,
        replica_id: i32,
        peer_generation: GenerationId,
        peer_state: &ServerState,
    ) -> bool {
        let mut generation = self.generation.lock().unwrap();
        if !generation.is_set() && peer_generation.is_set() {
            // First member with data establishes the relay's generation.
            *generation = peer_generation;
        }
        if generation.is_set()
            && peer_generation.is_set()
            && *generation != peer_generation
        {
            warn!(
                replica_id,
                relay = %*generation,
                peer = %peer_generation,
                "generation mismatch, peer degraded"
            );
            return true;
        }
        drop(generation);

        let purged = self.purged_floor.lock().unwrap();
        for (purged_replica, csn) in purged.iter() {
            if !peer_state.covers(&csn) {
                warn!(
                    replica_id,
                    error = %ReplError::NeedsReinit {
                        replica_id,
                        needed: csn,
                    },
                    purged_replica,
                    "peer behind purge horizon, degraded"
                );
                return true;
            }
        }
        false
    }

    async fn run_inbound(&self, session: &Session, peer: &Arc<Peer>) -> Result<(), ReplError> {
        loop {
            let Some(result) = session.recv().await else {
                return Ok(());
            };
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(replica_id = peer.replica_id, error = %e, "skipping malformed frame");
                    continue;
                }
            };
            match msg {
                ReplMsg::Update(update) => {
                    // Journal before anything else: once acknowledged via
                    // credit, the update must survive a relay restart.
                    self.changelog.append(&update)?;
                    if let Some(credits) = peer.recv_window.on_replayed() {
                        session
                            .send(&ReplMsg::WindowUpdate {
                                credits: credits as u32,
                            })
                            .await?;
                    }
                    if !peer.degraded.load(Ordering::Relaxed) {
                        self.fanout(peer.replica_id, &update);
                    }
                }
                ReplMsg::WindowUpdate { credits } => {
                    peer.send_window.release(credits as usize);
                }
                ReplMsg::WindowProbe => {
                    let owed = peer.recv_window.drain();
                    session
                        .send(&ReplMsg::WindowUpdate {
                            credits: owed as u32,
                        })
                        .await?;
                }
                ReplMsg::Heartbeat => {}
                ReplMsg::StateUpdate(state) => {
                    *peer.acked.lock().unwrap() = state;
                    if let Err(e) = self.maybe_purge() {
                        warn!(error = %e, "changelog purge failed");
                    }
                }
                ReplMsg::ResetGeneration { generation } => {
                    *self.generation.lock().unwrap() = generation;
                    self.clear_degraded();
                    self.broadcast(peer.replica_id, &ReplMsg::ResetGeneration { generation })
                        .await;
                }
                msg @ ReplMsg::InitChunk { .. } => {
                    self.broadcast(peer.replica_id, &msg).await;
                }
                msg @ ReplMsg::InitDone { generation, .. } => {
                    // Every member now shares the source's baseline.
                    *self.generation.lock().unwrap() = generation;
                    self.clear_degraded();
                    self.broadcast(peer.replica_id, &msg).await;
                }
                other @ (ReplMsg::Handshake { .. } | ReplMsg::HandshakeAck { .. }) => {
                    warn!(
                        replica_id = peer.replica_id,
                        msg = ?other,
                        "unexpected handshake frame mid-session"
                    );
                }
            }
        }
    }

    /// Enqueue an update to every other healthy peer, including peers in
    /// catch-up: the outbound side drops anything the changelog already
    /// delivered via the sent cursor. A full queue flips the peer into
    /// changelog catch-up; nothing is lost because the update is already
    /// journaled.
    fn fanout(&self, origin: i32, msg: &UpdateMessage) {
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.replica_id == origin || peer.degraded.load(Ordering::Relaxed) {
                continue;
            }
            match peer.queue_tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        replica_id = peer.replica_id,
                        "fanout queue full, switching peer to catch-up"
                    );
                    peer.catching_up.store(true, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Send a frame to every peer except the origin, outside flow control
    /// (used for init streams and generation resets).
    async fn broadcast(&self, origin: i32, msg: &ReplMsg) {
        let targets: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|entry| entry.value().replica_id != origin)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for peer in targets {
            if let Err(e) = peer.session.send(msg).await {
                warn!(replica_id = peer.replica_id, error = %e, "broadcast send failed");
            }
        }
    }

    fn clear_degraded(&self) {
        for entry in self.peers.iter() {
            entry.value().degraded.store(false, Ordering::Relaxed);
        }
    }

    /// Trim the changelog below the per-replica floor every healthy peer
    /// has acknowledged. Purging with a single connected peer trims what
    /// that peer acknowledged; a disconnected member that falls behind the
    /// horizon is degraded at its next handshake and re-initialized.
    fn maybe_purge(&self) -> Result<usize, ReplError> {
        let mut floor: Option<ServerState> = None;
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.degraded.load(Ordering::Relaxed) {
                continue;
            }
            let acked = peer.acked.lock().unwrap().clone();
            floor = Some(match floor {
                None => acked,
                Some(f) => f.floor_with(&acked),
            });
        }
        let Some(floor) = floor else {
            return Ok(0);
        };
        let removed = self.changelog.purge_before(&floor)?;
        if removed > 0 {
            self.purged_floor.lock().unwrap().merge(&floor);
            debug!(removed, floor = %floor, "changelog trimmed");
        }
        Ok(removed)
    }

    async fn run_outbound(
        relay: Arc<Relay>,
        peer: Arc<Peer>,
        mut queue_rx: mpsc::Receiver<UpdateMessage>,
    ) {
        let probe_after = Duration::from_millis(relay.config.window.probe_after_ms);
        loop {
            if peer.degraded.load(Ordering::Relaxed) {
                // Degraded peers receive nothing; keep draining the queue
                // so the channel never wedges.
                match queue_rx.recv().await {
                    Some(_) => continue,
                    None => return,
                }
            }
            if peer.catching_up.load(Ordering::Relaxed) {
                let cursor = peer.sent.lock().unwrap().clone();
                let batch = relay
                    .changelog
                    .read_after(&cursor, relay.config.catch_up_batch);
                if batch.is_empty() {
                    // Flip first, then re-read: an update journaled between
                    // the read and the flip must not fall between the
                    // changelog and the queue.
                    peer.catching_up.store(false, Ordering::Relaxed);
                    if !relay.changelog.read_after(&cursor, 1).is_empty() {
                        peer.catching_up.store(true, Ordering::Relaxed);
                        continue;
                    }
                    debug!(replica_id = peer.replica_id, "peer caught up");
                    continue;
                }
                for msg in batch {
                    // A peer never needs its own updates back.
                    if msg.csn().replica_id == peer.replica_id {
                        peer.sent.lock().unwrap().update(msg.csn());
                        continue;
                    }
                    if Self::send_update(&peer, &msg, probe_after).await.is_err() {
                        return;
                    }
                }
            } else {
                match queue_rx.recv().await {
                    None => return,
                    Some(msg) => {
                        if peer.sent.lock().unwrap().covers(&msg.csn()) {
                            continue;
                        }
                        if Self::send_update(&peer, &msg, probe_after).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn send_update(
        peer: &Peer,
        msg: &UpdateMessage,
        probe_after: Duration,
    ) -> Result<(), ReplError> {
        loop {
            match peer.send_window.acquire(probe_after).await? {
                AcquireOutcome::Granted => break,
                AcquireOutcome::Starved => {
                    peer.session.send(&ReplMsg::WindowProbe).await?;
                }
            }
        }
        peer.session.send(&ReplMsg::Update(msg.clone())).await?;
        peer.sent.lock().unwrap().update(msg.csn());
        Ok(())
    }
}
