//! Error types for the directory store.

use crate::dn::Dn;
use crate::entry::EntryId;
use thiserror::Error;

/// Errors reported by a [`crate::store::DirectoryStore`].
///
/// The replication engine dispatches on these variants when classifying a
/// failed replay into a conflict-resolution rule, so each carries enough
/// context to decide the outcome without a second lookup.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No entry exists with the given unique identifier.
    #[error("no entry with id {id}")]
    NoSuchId {
        /// The unique identifier that was looked up.
        id: EntryId,
    },

    /// No entry exists at the given DN.
    #[error("no entry at {dn}")]
    NoSuchEntry {
        /// The DN that was looked up.
        dn: Dn,
    },

    /// The target DN is already occupied by another entry.
    #[error("entry already exists at {dn} (existing id {existing_id})")]
    AlreadyExists {
        /// The occupied DN.
        dn: Dn,
        /// Unique identifier of the entry currently holding the DN.
        existing_id: EntryId,
    },

    /// The parent of the target DN does not exist.
    #[error("parent of {dn} does not exist")]
    NoSuchParent {
        /// The DN whose parent is missing.
        dn: Dn,
    },

    /// The operation requires a leaf entry but the target has children.
    #[error("entry {dn} has children")]
    NotAllowedOnNonLeaf {
        /// The non-leaf entry's DN.
        dn: Dn,
    },

    /// The DN string could not be parsed.
    #[error("invalid DN: {input:?}")]
    InvalidDn {
        /// The rejected input.
        input: String,
    },

    /// The target DN is outside the store's suffix.
    #[error("{dn} is outside suffix {suffix}")]
    OutsideSuffix {
        /// The out-of-scope DN.
        dn: Dn,
        /// The store's suffix.
        suffix: Dn,
    },
}
