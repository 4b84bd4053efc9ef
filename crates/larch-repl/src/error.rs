//! Error types for the replication core.

use thiserror::Error;

use crate::csn::Csn;
use crate::generation::GenerationId;

/// Errors that can occur in the replication core.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Changelog read/write error.
    #[error("changelog error: {msg}")]
    Changelog {
        /// Error message describing the issue.
        msg: String,
    },

    /// A changelog record failed CRC validation past the recoverable tail.
    #[error("changelog corrupted: {msg}")]
    ChangelogCorrupted {
        /// Error message describing the corruption.
        msg: String,
    },

    /// Session handshake failed or arrived malformed.
    #[error("handshake failed: {msg}")]
    Handshake {
        /// Error message describing the failure.
        msg: String,
    },

    /// Generation id mismatch between two peers of the same domain.
    #[error("generation mismatch: local {local}, peer {peer}")]
    GenerationMismatch {
        /// The local generation id.
        local: GenerationId,
        /// The peer's generation id.
        peer: GenerationId,
    },

    /// A received frame could not be decoded.
    #[error("malformed message: {msg}")]
    Malformed {
        /// Error message describing the decoding failure.
        msg: String,
    },

    /// Peer session channel error (closed or full past its bound).
    #[error("session error: {msg}")]
    Session {
        /// Error message describing the session issue.
        msg: String,
    },

    /// A peer is not (or no longer) registered.
    #[error("unknown peer replica {replica_id}")]
    UnknownPeer {
        /// The unknown replica id.
        replica_id: i32,
    },

    /// The peer fell behind the changelog purge horizon and must be
    /// fully re-initialized before it can receive updates again.
    #[error("replica {replica_id} needs re-initialization (next needed CSN {needed} purged)")]
    NeedsReinit {
        /// The replica that fell behind.
        replica_id: i32,
        /// The first CSN the replica still needs.
        needed: Csn,
    },

    /// A local directory operation was refused by the store.
    #[error(transparent)]
    Store(#[from] larch_store::StoreError),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The component was shut down.
    #[error("replication shut down")]
    Shutdown,
}
