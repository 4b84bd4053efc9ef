#![warn(missing_docs)]

//! Larch directory data model: distinguished names, entries with immutable
//! unique identifiers, and an in-memory directory information tree.
//!
//! This crate is the local-data-store collaborator consumed by the
//! replication core. It exposes add/modify/delete/rename plus lookup by
//! unique id or DN, and deliberately knows nothing about replication.

pub mod dn;
pub mod entry;
pub mod error;
pub mod store;

pub use dn::{Dn, Rdn};
pub use entry::{Entry, EntryId, ModKind, Modification};
pub use error::StoreError;
pub use store::{DirectoryStore, MemoryStore};
