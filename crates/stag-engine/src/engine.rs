// SPDX-License-Identifier: PMPL-1.0-or-later
//
// The dedup + append decision core.
//
// For each event the engine locates or creates the target graph and anchor,
// consults the fingerprinter, appends a new version iff content changed,
// and updates anchor, graph and system statistics — all inside one write
// transaction. A batch is a plain sequence of such decisions: one event
// failing is logged and counted, never fatal to the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument};

use stag_fingerprint::{geometry_signature, FingerprintPool};
use stag_storage::keys;
use stag_storage::types::{
    Anchor, AnchorVersion, ChangeType, EventKind, GraphStats, Metadata, SpatialEvent,
    SpatialGraph,
};
use stag_storage::{SpatialStore, StoreTxn};

use crate::error::EngineError;

/// Anchor-metadata key holding the mesh geometric signature.
const GEOMETRY_SIGNATURE_KEY: &str = "geometry_signature";

/// Per-batch result: how many events were handled and how many failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub errors: usize,
}

/// Why an event produced no version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The content hash equals the anchor's current hash.
    UnchangedHash,
    /// The mesh geometric signature equals the stored one.
    UnchangedGeometry,
}

/// What a single event did to the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// A version was appended.
    Versioned {
        version_id: String,
        change_type: ChangeType,
        created_graph: bool,
        created_anchor: bool,
    },
    /// Dedup decided the content was unchanged.
    Skipped(SkipReason),
}

/// The versioning decision core. Invoked from the batch worker; safe to
/// share behind an `Arc`.
pub struct VersioningEngine {
    store: Arc<SpatialStore>,
    pool: Arc<FingerprintPool>,
}

impl VersioningEngine {
    pub fn new(store: Arc<SpatialStore>, pool: Arc<FingerprintPool>) -> Self {
        Self { store, pool }
    }

    pub fn store(&self) -> &Arc<SpatialStore> {
        &self.store
    }

    /// Apply a drained batch event by event.
    ///
    /// Failures are logged with event context and counted; they do not
    /// abort subsequent events.
    #[instrument(skip_all, fields(batch_size = events.len()))]
    pub async fn apply_batch(&self, events: Vec<SpatialEvent>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            outcome.processed += 1;
            let event_id = event.event_id.clone();
            let event_type = event.event_type.clone();
            if let Err(err) = self.apply_event(event).await {
                outcome.errors += 1;
                error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %err,
                    "failed to process event"
                );
            }
        }
        outcome
    }

    /// Apply one event: dedup or append, inside a single write transaction.
    pub async fn apply_event(&self, event: SpatialEvent) -> Result<EventOutcome, EngineError> {
        let graph_id = if event.session_id.is_empty() {
            "default".to_string()
        } else {
            event.session_id.clone()
        };
        let anchor_id = derive_anchor_id(&event)?;
        let event_type = event.event_type.clone();

        // Fingerprint outside the transaction; the digest needs no store
        // state.
        let mut fingerprinter = self.pool.acquire();
        let hash = fingerprinter.content_hash(&event);
        self.pool.release(fingerprinter);
        let signature = event
            .payload
            .as_ref()
            .and_then(|payload| payload.as_mesh())
            .map(geometry_signature);

        let txn_graph_id = graph_id.clone();
        let txn_anchor_id = anchor_id.clone();
        let txn_hash = hash.clone();
        let outcome = self
            .store
            .with_write(move |txn| {
                apply_in_txn(txn, &event, &txn_graph_id, &txn_anchor_id, &txn_hash, signature)
            })
            .await?;

        match &outcome {
            EventOutcome::Versioned {
                version_id,
                change_type,
                created_graph,
                created_anchor,
            } => {
                if *created_graph {
                    info!(graph_id = %graph_id, "created new graph");
                }
                if *created_anchor {
                    info!(
                        graph_id = %graph_id,
                        anchor_id = %anchor_id,
                        event_type = %event_type,
                        "created new anchor"
                    );
                }
                info!(
                    graph_id = %graph_id,
                    anchor_id = %anchor_id,
                    event_type = %event_type,
                    version_id = %version_id,
                    change_type = %change_type,
                    "updated anchor"
                );
            }
            EventOutcome::Skipped(reason) => {
                debug!(
                    graph_id = %graph_id,
                    anchor_id = %anchor_id,
                    hash = %hash,
                    reason = ?reason,
                    "anchor content unchanged, skipping version"
                );
            }
        }

        Ok(outcome)
    }
}

/// Derive the anchor id for an event, failing with `InvalidEvent` when the
/// payload variant named by `event_type` is absent.
pub(crate) fn derive_anchor_id(event: &SpatialEvent) -> Result<String, EngineError> {
    let kind = event.kind();

    // Known kinds must carry their payload; `Generic` never has one.
    if kind != EventKind::Generic && event.payload.is_none() {
        return Err(EngineError::InvalidEvent(format!(
            "{} event missing {} data",
            event.event_type, event.event_type
        )));
    }

    Ok(match kind {
        EventKind::Mesh => {
            let mesh = event
                .payload
                .as_ref()
                .and_then(|payload| payload.as_mesh())
                .ok_or_else(|| {
                    EngineError::InvalidEvent("mesh event missing mesh data".to_string())
                })?;
            if mesh.anchor_id.is_empty() {
                format!("mesh_{}_{}", event.client_id, event.frame_number)
            } else {
                mesh.anchor_id.clone()
            }
        }
        EventKind::Pose => format!("pose_{}", event.client_id),
        EventKind::Camera => format!("camera_{}", event.client_id),
        EventKind::Depth => format!("depth_{}", event.client_id),
        EventKind::PointCloud => format!("pointcloud_{}_{}", event.client_id, event.frame_number),
        EventKind::Lighting => format!("lighting_{}", event.client_id),
        EventKind::Generic => format!("generic_{}_{}", event.client_id, event.frame_number),
    })
}

/// The transactional body of the per-event algorithm. Everything here either
/// commits as a whole or leaves no trace.
fn apply_in_txn(
    txn: &mut StoreTxn<'_>,
    event: &SpatialEvent,
    graph_id: &str,
    anchor_id: &str,
    hash: &str,
    signature: Option<String>,
) -> Result<EventOutcome, stag_storage::StorageError> {
    let now = Utc::now();

    let (mut graph, created_graph) = match txn.get_graph(graph_id)? {
        Some(graph) => (graph, false),
        None => {
            let graph = SpatialGraph {
                id: graph_id.to_string(),
                name: format!("Session {graph_id}"),
                description: format!("Automatically created from session {graph_id}"),
                created_at: now,
                updated_at: now,
                anchors: BTreeMap::new(),
                stats: GraphStats {
                    first_activity: Some(now),
                    ..GraphStats::default()
                },
                metadata: Metadata::new(),
            };
            txn.insert_graph(&graph)?;
            (graph, true)
        }
    };

    let (mut anchor, created_anchor) = match txn.get_anchor(graph_id, anchor_id)? {
        Some(anchor) => (anchor, false),
        None => (
            Anchor {
                id: anchor_id.to_string(),
                graph_id: graph_id.to_string(),
                current_hash: hash.to_string(),
                versions: Vec::new(),
                created_at: now,
                updated_at: now,
                last_session_id: event.session_id.clone(),
                last_client_id: event.client_id.clone(),
                last_device_id: event.device_id.clone(),
                version_seq: 0,
                metadata: Metadata::new(),
            },
            true,
        ),
    };

    // Dedup compares only against pre-existing state; the first event of a
    // fresh anchor always appends its create version.
    if !created_anchor {
        if anchor.current_hash == hash {
            return Ok(EventOutcome::Skipped(SkipReason::UnchangedHash));
        }
        if let Some(signature) = signature.as_deref() {
            let stored = anchor
                .metadata
                .get(GEOMETRY_SIGNATURE_KEY)
                .and_then(|value| value.as_str());
            if stored == Some(signature) {
                // Unchanged geometry: the stored signature stays as-is.
                return Ok(EventOutcome::Skipped(SkipReason::UnchangedGeometry));
            }
        }
    }
    if let Some(signature) = signature {
        anchor
            .metadata
            .insert(GEOMETRY_SIGNATURE_KEY.to_string(), signature.into());
    }

    let seq = anchor.version_seq + 1;
    let change_type = if seq == 1 {
        ChangeType::Create
    } else {
        ChangeType::Update
    };
    let version = AnchorVersion {
        version_id: keys::version_id(seq),
        hash: hash.to_string(),
        timestamp: event.timestamp,
        change_type,
        transform: event.transform.clone(),
        payload: event.payload.clone(),
        event_id: event.event_id.clone(),
        session_id: event.session_id.clone(),
        client_id: event.client_id.clone(),
        device_id: event.device_id.clone(),
        frame_number: event.frame_number,
        metadata: event.metadata.clone(),
    };
    txn.insert_version(graph_id, anchor_id, &version)?;

    anchor.current_hash = hash.to_string();
    anchor.last_session_id = event.session_id.clone();
    anchor.last_client_id = event.client_id.clone();
    anchor.last_device_id = event.device_id.clone();
    anchor.updated_at = now;
    anchor.version_seq = seq;
    txn.put_anchor(&anchor)?;

    let stats = &mut graph.stats;
    stats.last_activity = Some(now);
    if stats.first_activity.is_none() {
        stats.first_activity = Some(now);
    }
    stats.event_count += 1;
    stats.version_count += 1;
    if created_anchor {
        stats.anchor_count += 1;
    }
    note_seen(
        &mut graph.metadata,
        "seen_sessions",
        &event.session_id,
        &mut graph.stats.session_count,
    );
    note_seen(
        &mut graph.metadata,
        "seen_clients",
        &event.client_id,
        &mut graph.stats.client_count,
    );
    note_seen(
        &mut graph.metadata,
        "seen_devices",
        &event.device_id,
        &mut graph.stats.device_count,
    );
    graph.updated_at = now;
    txn.put_graph(&graph)?;

    let mut system = txn.system_stats()?;
    if created_graph {
        system.graph_count += 1;
    }
    if created_anchor {
        system.anchor_count += 1;
    }
    system.version_count += 1;
    system.event_count += 1;
    system.last_ingest_time = Some(now);
    txn.put_system_stats(&system)?;

    Ok(EventOutcome::Versioned {
        version_id: version.version_id,
        change_type,
        created_graph,
        created_anchor,
    })
}

/// Record `id` in the named seen-set inside the graph metadata, bumping the
/// cardinality counter on first sighting.
fn note_seen(metadata: &mut Metadata, set_key: &str, id: &str, count: &mut u64) {
    let set = metadata
        .entry(set_key.to_string())
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(members) = set {
        if !members.contains_key(id) {
            members.insert(id.to_string(), serde_json::Value::Bool(true));
            *count += 1;
        }
    }
}
