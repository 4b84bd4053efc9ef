//! Peer sessions: the ordered, reliable transport seam.
//!
//! In production deployments a session wraps a TCP/TLS connection; here it
//! is a pair of bounded tokio mpsc channels carrying bincode-framed
//! [`ReplMsg`]s, which keeps the replication core testable in-process while
//! preserving the wire contract (framing, ordering, close semantics, and
//! decode failures surfacing per message instead of killing the stream).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::ReplError;
use crate::generation::GenerationId;
use crate::state::ServerState;
use crate::update::UpdateMessage;

/// Messages exchanged between a broker and a relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplMsg {
    /// Opens a session: the broker introduces itself.
    Handshake {
        /// The broker's replica id.
        replica_id: i32,
        /// The replicated domain.
        domain_id: u32,
        /// The broker's current generation id.
        generation: GenerationId,
        /// The broker's server state, for catch-up computation.
        state: ServerState,
        /// The window size the broker grants the relay.
        window_size: usize,
    },
    /// The relay's reply to a handshake.
    HandshakeAck {
        /// The relay's server id.
        server_id: i32,
        /// The relay's generation id for the domain.
        generation: GenerationId,
        /// The newest CSNs the relay holds, per replica.
        state: ServerState,
        /// The window size the relay grants the broker.
        window_size: usize,
        /// True when the generation ids diverged (degraded status).
        degraded: bool,
    },
    /// One replicated update.
    Update(UpdateMessage),
    /// Returns send credits after local replay.
    WindowUpdate {
        /// Number of credits returned.
        credits: u32,
    },
    /// Sender starved of credit asks the receiver to restate its window.
    WindowProbe,
    /// Liveness signal on idle connections.
    Heartbeat,
    /// Periodic replay progress report, drives changelog trimming.
    StateUpdate(ServerState),
    /// One chunk of a full-initialization snapshot (lz4-compressed).
    InitChunk {
        /// Chunk sequence number, from 0.
        seq: u32,
        /// Compressed bincode payload.
        payload: Vec<u8>,
    },
    /// End of a full-initialization stream.
    InitDone {
        /// Generation id the target must adopt.
        generation: GenerationId,
        /// State vector the target must adopt.
        state: ServerState,
        /// Entry count, validated against the received chunks.
        total_entries: u64,
    },
    /// Forces a new shared generation id on the receiving member.
    ResetGeneration {
        /// The generation id to adopt.
        generation: GenerationId,
    },
}

/// Configuration for one session endpoint.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Channel capacity (frames buffered per direction).
    pub capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug)]
struct SessionStatsInner {
    msgs_sent: AtomicU64,
    msgs_received: AtomicU64,
    updates_sent: AtomicU64,
    updates_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl SessionStatsInner {
    fn new() -> Self {
        Self {
            msgs_sent: AtomicU64::new(0),
            msgs_received: AtomicU64::new(0),
            updates_sent: AtomicU64::new(0),
            updates_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }
}

/// Statistics for one session endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames sent.
    pub msgs_sent: u64,
    /// Frames received and decoded.
    pub msgs_received: u64,
    /// Update messages sent.
    pub updates_sent: u64,
    /// Update messages received.
    pub updates_received: u64,
    /// Frames that failed to decode (skipped, not fatal).
    pub decode_errors: u64,
}

/// One endpoint of a peer session.
pub struct Session {
    sender: mpsc::Sender<Bytes>,
    receiver: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    stats: Arc<SessionStatsInner>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: Arc::clone(&self.receiver),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Session {
    /// Create a connected pair of endpoints.
    pub fn new_pair(config: SessionConfig) -> (Session, Session) {
        let (tx_a, rx_a) = mpsc::channel::<Bytes>(config.capacity);
        let (tx_b, rx_b) = mpsc::channel::<Bytes>(config.capacity);
        let a = Session {
            sender: tx_a,
            receiver: Arc::new(Mutex::new(rx_b)),
            stats: Arc::new(SessionStatsInner::new()),
        };
        let b = Session {
            sender: tx_b,
            receiver: Arc::new(Mutex::new(rx_a)),
            stats: Arc::new(SessionStatsInner::new()),
        };
        (a, b)
    }

    /// Send one message. Fails when the peer endpoint is gone.
    pub async fn send(&self, msg: &ReplMsg) -> Result<(), ReplError> {
        let frame = Bytes::from(bincode::serialize(msg)?);
        self.sender
            .send(frame)
            .await
            .map_err(|_| ReplError::Session {
                msg: "peer closed".to_string(),
            })?;
        self.stats.msgs_sent.fetch_add(1, Ordering::Relaxed);
        if matches!(msg, ReplMsg::Update(_)) {
            self.stats.updates_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Inject a raw frame, bypassing encoding. Exercises the
    /// malformed-message path.
    pub async fn send_raw(&self, frame: Bytes) -> Result<(), ReplError> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| ReplError::Session {
                msg: "peer closed".to_string(),
            })?;
        self.stats.msgs_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Receive the next message. `None` means the peer closed the session.
    /// A frame that fails to decode yields `Some(Err(..))`; the session
    /// stays usable (skip-and-continue).
    pub async fn recv(&self) -> Option<Result<ReplMsg, ReplError>> {
        let frame = {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await?
        };
        match bincode::deserialize::<ReplMsg>(&frame) {
            Ok(msg) => {
                self.stats.msgs_received.fetch_add(1, Ordering::Relaxed);
                if matches!(msg, ReplMsg::Update(_)) {
                    self.stats.updates_received.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(msg))
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                Some(Err(ReplError::Malformed { msg: e.to_string() }))
            }
        }
    }

    /// Receive without waiting. `Ok(None)` means no frame is queued.
    pub fn try_recv(&self) -> Result<Option<Result<ReplMsg, ReplError>>, ReplError> {
        let mut receiver = self
            .receiver
            .try_lock()
            .map_err(|_| ReplError::Session {
                msg: "receiver busy".to_string(),
            })?;
        match receiver.try_recv() {
            Ok(frame) => match bincode::deserialize::<ReplMsg>(&frame) {
                Ok(msg) => {
                    self.stats.msgs_received.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(Ok(msg)))
                }
                Err(e) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(Err(ReplError::Malformed { msg: e.to_string() })))
                }
            },
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ReplError::Session {
                msg: "peer closed".to_string(),
            }),
        }
    }

    /// Snapshot of the endpoint's statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            msgs_sent: self.stats.msgs_sent.load(Ordering::Relaxed),
            msgs_received: self.stats.msgs_received.load(Ordering::Relaxed),
            updates_sent: self.stats.updates_sent.load(Ordering::Relaxed),
            updates_received: self.stats.updates_received.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;
    use crate::update::DeleteMsg;
    use larch_store::{Dn, EntryId};

    fn update() -> ReplMsg {
        ReplMsg::Update(UpdateMessage::Delete(DeleteMsg {
            csn: Csn::new(1, 0, 1),
            entry_id: EntryId::random(),
            dn: Dn::parse("uid=x,dc=example").unwrap(),
        }))
    }

    #[tokio::test]
    async fn send_and_recv_roundtrip() {
        let (a, b) = Session::new_pair(SessionConfig::default());
        a.send(&ReplMsg::Heartbeat).await.unwrap();
        a.send(&update()).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), ReplMsg::Heartbeat);
        assert!(matches!(
            b.recv().await.unwrap().unwrap(),
            ReplMsg::Update(_)
        ));

        let stats = a.stats();
        assert_eq!(stats.msgs_sent, 2);
        assert_eq!(stats.updates_sent, 1);
        let stats = b.stats();
        assert_eq!(stats.msgs_received, 2);
        assert_eq!(stats.updates_received, 1);
    }

    #[tokio::test]
    async fn order_preserved() {
        let (a, b) = Session::new_pair(SessionConfig::default());
        for credits in 1..=5u32 {
            a.send(&ReplMsg::WindowUpdate { credits }).await.unwrap();
        }
        for expected in 1..=5u32 {
            match b.recv().await.unwrap().unwrap() {
                ReplMsg::WindowUpdate { credits } => assert_eq!(credits, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn recv_none_after_peer_drop() {
        let (a, b) = Session::new_pair(SessionConfig::default());
        a.send(&ReplMsg::Heartbeat).await.unwrap();
        drop(a);
        assert!(b.recv().await.unwrap().is_ok());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_surfaces_error_but_keeps_session() {
        let (a, b) = Session::new_pair(SessionConfig::default());
        a.send_raw(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0xff]))
            .await
            .unwrap();
        a.send(&ReplMsg::Heartbeat).await.unwrap();

        assert!(b.recv().await.unwrap().is_err());
        assert_eq!(b.recv().await.unwrap().unwrap(), ReplMsg::Heartbeat);
        assert_eq!(b.stats().decode_errors, 1);
    }

    #[tokio::test]
    async fn handshake_roundtrip_carries_state() {
        let (a, b) = Session::new_pair(SessionConfig::default());
        let mut state = ServerState::new();
        state.update(Csn::new(500, 2, 3));
        a.send(&ReplMsg::Handshake {
            replica_id: 3,
            domain_id: 1,
            generation: GenerationId(42),
            state: state.clone(),
            window_size: 100,
        })
        .await
        .unwrap();
        match b.recv().await.unwrap().unwrap() {
            ReplMsg::Handshake {
                replica_id,
                state: got,
                ..
            } => {
                assert_eq!(replica_id, 3);
                assert_eq!(got, state);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
