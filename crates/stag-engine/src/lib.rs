// SPDX-License-Identifier: PMPL-1.0-or-later
//! The stag spatial-graph versioning engine.
//!
//! Turns an unordered stream of spatial events into content-addressed,
//! per-anchor version chains. The decision core deduplicates by content
//! hash (plus a coarser geometric signature for meshes) and appends a new
//! version only when content actually changed, updating per-anchor,
//! per-graph and system statistics inside the same write transaction.
//!
//! # Modules
//!
//! - [`engine`] -- The [`VersioningEngine`] dedup + append decision core.
//! - [`batch`] -- The [`BatchProcessor`]: bounded queue and single drain
//!   worker with size-or-deadline flushing.
//! - [`read`] -- The read-only [`ReadApi`] over the store.
//! - [`service`] -- The [`StagService`] ingest facade wiring the pieces
//!   together.
//! - [`config`] -- Validated engine configuration.
//! - [`error`] -- The [`EngineError`] enum.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod read;
pub mod service;

pub use batch::{BatchProcessor, EnqueueStatus};
pub use config::{EngineConfig, LogLevel};
pub use engine::{BatchOutcome, EventOutcome, SkipReason, VersioningEngine};
pub use error::EngineError;
pub use read::ReadApi;
pub use service::StagService;
