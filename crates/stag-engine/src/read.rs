// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Read-only surface over the store.
//
// Reads bypass the batch queue entirely; every operation is one read
// transaction underneath, so callers see either the pre- or post-state of
// any in-flight event, never a torn mix.

use std::sync::Arc;

use stag_storage::types::{Anchor, AnchorHistory, GraphStats, SpatialGraph, SystemStats};
use stag_storage::SpatialStore;

use crate::error::EngineError;

/// Default page size for anchor history when the caller leaves it unset.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Hard cap on the anchor-history page size.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Strictly read-only access to the spatial graph.
pub struct ReadApi {
    store: Arc<SpatialStore>,
}

impl ReadApi {
    pub fn new(store: Arc<SpatialStore>) -> Self {
        Self { store }
    }

    /// All graphs in key order, each with its anchor set and version chains
    /// materialised.
    pub async fn list_graphs(&self) -> Result<Vec<SpatialGraph>, EngineError> {
        Ok(self.store.list_graphs().await?)
    }

    /// One graph, fully materialised.
    pub async fn get_graph(&self, graph_id: &str) -> Result<SpatialGraph, EngineError> {
        Ok(self.store.get_graph(graph_id).await?)
    }

    /// All anchors of a graph with their full version chains.
    pub async fn list_anchors(&self, graph_id: &str) -> Result<Vec<Anchor>, EngineError> {
        Ok(self.store.list_anchors(graph_id).await?)
    }

    /// One anchor with its full version chain.
    pub async fn get_anchor(
        &self,
        graph_id: &str,
        anchor_id: &str,
    ) -> Result<Anchor, EngineError> {
        Ok(self.store.get_anchor(graph_id, anchor_id).await?)
    }

    /// One page of an anchor's version chain in insertion order.
    ///
    /// `limit` defaults to 50 and is clamped to at most 1000; zero is
    /// rejected. An offset at or past the total yields an empty page with
    /// the total still accurate.
    pub async fn get_anchor_history(
        &self,
        graph_id: &str,
        anchor_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<AnchorHistory, EngineError> {
        let limit = match limit {
            None => DEFAULT_HISTORY_LIMIT,
            Some(0) => {
                return Err(EngineError::InvalidRequest(
                    "limit must be positive".to_string(),
                ))
            }
            Some(requested) => requested.min(MAX_HISTORY_LIMIT),
        };

        let (versions, total) = self
            .store
            .anchor_history(graph_id, anchor_id, offset, limit)
            .await?;

        Ok(AnchorHistory {
            anchor_id: anchor_id.to_string(),
            graph_id: graph_id.to_string(),
            versions,
            total,
            offset,
            limit,
        })
    }

    /// Current system totals; `database_size` is refreshed at call time.
    pub async fn get_system_stats(&self) -> Result<SystemStats, EngineError> {
        Ok(self.store.get_system_stats().await?)
    }

    /// The stats subrecord of one graph.
    pub async fn get_graph_stats(&self, graph_id: &str) -> Result<GraphStats, EngineError> {
        Ok(self.store.get_graph(graph_id).await?.stats)
    }
}
