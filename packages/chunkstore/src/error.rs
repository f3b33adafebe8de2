//! Errors produced by the storage engine.

use thiserror::Error;

use crate::entity::Entity;

/// Errors that can occur while manipulating entity storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A type set or type registration was malformed.
    ///
    /// Raised for empty, unsorted or duplicate type sets, and for component
    /// types that cannot be stored.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The entity handle is stale or its index is outside the entity table.
    #[error("invalid entity handle {0:?}")]
    InvalidHandle(Entity),

    /// An index into a chunk, archetype or type list was out of bounds.
    ///
    /// This signals a broken internal invariant rather than a user error.
    #[error("{what} index {index} out of range (len {len})")]
    OutOfRange {
        /// The kind of index which was rejected.
        what: &'static str,
        /// The rejected index.
        index: usize,
        /// The number of valid entries.
        len: usize,
    },

    /// A fixed ceiling was reached.
    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded {
        /// The resource which ran out.
        what: &'static str,
        /// The configured limit.
        limit: usize,
    },

    /// The allocator could not provide a chunk buffer.
    #[error("failed to allocate {size} bytes")]
    AllocationFailure {
        /// The requested allocation size.
        size: usize,
    },
}

impl StorageError {
    pub(crate) fn out_of_range(what: &'static str, index: usize, len: usize) -> StorageError {
        StorageError::OutOfRange { what, index, len }
    }

    pub(crate) fn capacity(what: &'static str, limit: usize) -> StorageError {
        log::warn!("{} capacity exceeded (limit {})", what, limit);
        StorageError::CapacityExceeded { what, limit }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
