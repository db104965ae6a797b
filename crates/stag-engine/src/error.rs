// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Engine-level error types.
//
// Storage failures pass through unchanged; the engine adds the kinds that
// only exist above the store: malformed events, malformed read requests,
// configuration violations and shutdown.

use stag_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the versioning engine and its read API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The event's payload variant is missing or inconsistent with its
    /// `event_type`.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Malformed pagination or out-of-range request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A configuration value is outside its permitted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shutdown is in progress; the operation was not performed.
    #[error("shutdown in progress")]
    Cancelled,

    /// A storage failure, passed through from the store.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Whether this error is a missing-entity error from the store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Storage(err) if err.is_not_found())
    }
}
