// SPDX-License-Identifier: PMPL-1.0-or-later
//
// The ingest facade tying store, fingerprint pool, engine, batch processor
// and read API together. Embedding transports (HTTP, WebSocket) hand
// `IngestBatch`es to `ingest` and serve reads through `read()`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use stag_fingerprint::FingerprintPool;
use stag_storage::types::{IngestAck, IngestBatch};
use stag_storage::SpatialStore;

use crate::batch::{BatchProcessor, EnqueueStatus};
use crate::config::EngineConfig;
use crate::engine::{derive_anchor_id, VersioningEngine};
use crate::error::EngineError;
use crate::read::ReadApi;

/// Process-wide service owning the store and all engine components.
///
/// Constructed once at startup and passed to the embedding transport; there
/// are no module-level singletons, so tests can stand up isolated instances
/// against temporary store paths.
pub struct StagService {
    store: Arc<SpatialStore>,
    batch: BatchProcessor,
    read: ReadApi,
    start_time: DateTime<Utc>,
}

impl std::fmt::Debug for StagService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagService").finish_non_exhaustive()
    }
}

impl StagService {
    /// Validate the configuration, open the store and spawn the batch
    /// worker.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let path = config.database_path.clone();
        let store = tokio::task::spawn_blocking(move || SpatialStore::open(path))
            .await
            .map_err(|e| {
                EngineError::Storage(stag_storage::StorageError::Backend(format!(
                    "blocking task join: {e}"
                )))
            })??;
        let store = Arc::new(store);

        let pool = Arc::new(FingerprintPool::new());
        let engine = Arc::new(VersioningEngine::new(Arc::clone(&store), pool));
        let batch = BatchProcessor::new(engine, config.batch_size, config.flush_interval());

        info!(
            database_path = %config.database_path.display(),
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "stag service started"
        );

        Ok(Self {
            read: ReadApi::new(Arc::clone(&store)),
            store,
            batch,
            start_time: Utc::now(),
        })
    }

    /// The read-only query surface.
    pub fn read(&self) -> &ReadApi {
        &self.read
    }

    /// Direct store access, for maintenance tooling.
    pub fn store(&self) -> &Arc<SpatialStore> {
        &self.store
    }

    /// When this service instance started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Accept a batch for asynchronous processing.
    ///
    /// Events are validated for payload-variant presence and queued either
    /// way: `errors` counts the events that failed validation (they will be
    /// logged again with full context when the engine rejects them), while
    /// `processed` counts the events queued. Receipt timestamps are stamped
    /// when the relay left them unset.
    #[instrument(skip_all, fields(batch_id = %batch.batch_id))]
    pub async fn ingest(&self, batch: IngestBatch) -> IngestAck {
        let now = Utc::now();
        info!(
            event_count = batch.events.len(),
            relay_id = %batch.relay_id,
            "received ingest batch"
        );

        let mut processed = 0;
        let mut errors = 0;
        for mut event in batch.events {
            if event.processing_info.received_at.is_none() {
                event.processing_info.received_at = Some(now);
            }
            if event.processing_info.processed_at.is_none() {
                event.processing_info.processed_at = Some(now);
            }

            let invalid = derive_anchor_id(&event).is_err();
            match self.batch.enqueue(event).await {
                EnqueueStatus::Queued => {
                    processed += 1;
                    if invalid {
                        errors += 1;
                    }
                }
                EnqueueStatus::Dropped => errors += 1,
            }
        }

        let ack = IngestAck {
            batch_id: batch.batch_id,
            processed,
            errors,
            queued: true,
            trace_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        };
        info!(
            processed = ack.processed,
            errors = ack.errors,
            trace_id = %ack.trace_id,
            "queued ingest batch"
        );
        ack
    }

    /// Delete a graph and everything under it.
    pub async fn delete_graph(&self, graph_id: &str) -> Result<(), EngineError> {
        Ok(self.store.delete_graph(graph_id).await?)
    }

    /// Delete an anchor and its version chain.
    pub async fn delete_anchor(&self, graph_id: &str, anchor_id: &str) -> Result<(), EngineError> {
        Ok(self.store.delete_anchor(graph_id, anchor_id).await?)
    }

    /// Maintenance: wipe every graph. Returns the number removed.
    pub async fn clear_graphs(&self) -> Result<usize, EngineError> {
        Ok(self.store.clear_graphs().await?)
    }

    /// Close the enqueue door, flush everything still queued and wait for
    /// the worker to exit. The final flush completes before this returns.
    pub async fn shutdown(&self) {
        self.batch.shutdown().await;
        info!("stag service shut down");
    }
}
