// SPDX-License-Identifier: PMPL-1.0-or-later
//! Embedded store for the stag spatial graph.
//!
//! Persists the versioned spatial graph in a single redb file split across
//! four logical tables (`graphs`, `anchors`, `versions`, `stats`) with
//! `:`-separated ASCII keys. Keys sort lexicographically, so listing and
//! cascade deletes are ordered prefix scans, and version ids are chosen so
//! that key order equals insertion order.
//!
//! # Modules
//!
//! - [`types`] -- The spatial data model: events, payload variants, anchors,
//!   graphs and statistics records.
//! - [`keys`] -- Key layout helpers shared by the store and its callers.
//! - [`error`] -- The [`StorageError`] enum covering all store failure modes.
//! - [`store`] -- The [`SpatialStore`] itself plus the [`StoreTxn`]
//!   write-transaction view used by the versioning engine.

pub mod error;
pub mod keys;
pub mod store;
pub mod types;

pub use error::{ResourceKind, StorageError};
pub use store::{SpatialStore, StoreTxn};
pub use types::{
    Anchor, AnchorHistory, AnchorVersion, CameraData, ChangeType, DepthData, EventKind,
    EventPayload, GraphStats, IngestAck, IngestBatch, LightingData, MeshData, Metadata, PoseData,
    PointCloudData, ProcessingInfo, SpatialEvent, SpatialGraph, SystemStats, Transform,
};
