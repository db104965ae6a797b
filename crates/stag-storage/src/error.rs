// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Storage error types for the stag store.
//
// One unified enum covers every failure mode the embedded engine can
// surface: I/O, missing or colliding keys, serialization failures, backend
// faults, and file-lock contention.

use thiserror::Error;

/// The logical table a key belongs to, used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Graph,
    Anchor,
    Version,
    Stats,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Graph => write!(f, "graph"),
            ResourceKind::Anchor => write!(f, "anchor"),
            ResourceKind::Version => write!(f, "version"),
            ResourceKind::Stats => write!(f, "stats"),
        }
    }
}

/// Errors that can occur when interacting with the spatial store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred in the underlying storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed entity does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    /// A create collided with an existing key.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: ResourceKind, id: String },

    /// Failed to serialize or deserialize a record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The embedded engine reported a fault (transaction, table or commit).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The database file lock could not be acquired within the bounded wait.
    #[error("database busy: {0}")]
    Busy(String),
}

impl StorageError {
    /// Shorthand for a [`StorageError::NotFound`].
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a [`StorageError::AlreadyExists`].
    pub fn already_exists(kind: ResourceKind, id: impl Into<String>) -> Self {
        StorageError::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error is a missing-entity error, regardless of kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
