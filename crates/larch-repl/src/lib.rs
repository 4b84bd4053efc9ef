#![warn(missing_docs)]

//! Larch replication core: multi-master replication for a directory service.
//!
//! Independent writable replicas stamp local updates with change sequence
//! numbers (CSNs), persist them to a durable changelog, and exchange them
//! through relay servers under windowed flow control. A dependency resolver
//! orders inbound updates, and a deterministic conflict-resolution engine
//! guarantees that all replicas converge to the same data set regardless of
//! delivery order.

pub mod broker;
pub mod changelog;
pub mod config;
pub mod conflict;
pub mod csn;
pub mod domain;
pub mod error;
pub mod generation;
pub mod historical;
pub mod init;
pub mod monitor;
pub mod pending;
pub mod relay;
pub mod session;
pub mod state;
pub mod update;
pub mod window;

pub use csn::{Csn, CsnGenerator};
pub use error::ReplError;
pub use generation::GenerationId;
pub use state::ServerState;
pub use update::UpdateMessage;
