// SPDX-License-Identifier: PMPL-1.0-or-later
//! Batch-processor and service-level tests: size and deadline flushing,
//! graceful shutdown, and ingest acknowledgement semantics.

use std::sync::Arc;
use std::time::Duration;

use stag_engine::{
    BatchProcessor, EngineConfig, EngineError, EnqueueStatus, ReadApi, StagService,
    VersioningEngine,
};
use stag_fingerprint::FingerprintPool;
use stag_storage::types::{
    EventPayload, IngestBatch, Metadata, PoseData, SpatialEvent, Transform,
};
use stag_storage::SpatialStore;
use tempfile::TempDir;

fn setup(batch_size: usize, flush_interval: Duration) -> (BatchProcessor, ReadApi, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SpatialStore::open(dir.path().join("stag-data")).unwrap());
    let engine = Arc::new(VersioningEngine::new(
        Arc::clone(&store),
        Arc::new(FingerprintPool::new()),
    ));
    let processor = BatchProcessor::new(engine, batch_size, flush_interval);
    (processor, ReadApi::new(store), dir)
}

fn pose_event(client_id: &str, frame: u64) -> SpatialEvent {
    SpatialEvent {
        event_id: format!("pose-{client_id}-{frame}"),
        event_type: "pose".to_string(),
        timestamp: chrono::Utc::now(),
        server_timestamp: None,
        session_id: "S1".to_string(),
        client_id: client_id.to_string(),
        device_id: "D1".to_string(),
        frame_number: frame,
        transform: None,
        payload: Some(EventPayload::Pose(PoseData {
            transform: Some(Transform {
                translation: [frame as f64, 0.0, 0.0],
                ..Transform::default()
            }),
            velocity: [0.0; 3],
            acceleration: [0.0; 3],
            angular_velocity: [0.0; 3],
            confidence: 1.0,
        })),
        metadata: Metadata::new(),
        processing_info: Default::default(),
    }
}

/// Poll the read API until the anchor reaches `versions` versions.
async fn wait_for_versions(read: &ReadApi, anchor_id: &str, versions: usize) {
    for _ in 0..200 {
        if let Ok(anchor) = read.get_anchor("S1", anchor_id).await {
            if anchor.versions.len() >= versions {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("anchor {anchor_id} never reached {versions} versions");
}

#[tokio::test]
async fn test_flush_on_batch_size() {
    // Deadline far away: only the size trigger can flush.
    let (processor, read, _dir) = setup(2, Duration::from_secs(60));

    assert_eq!(processor.enqueue(pose_event("C1", 1)).await, EnqueueStatus::Queued);
    assert_eq!(processor.enqueue(pose_event("C1", 2)).await, EnqueueStatus::Queued);

    wait_for_versions(&read, "pose_C1", 2).await;
    processor.shutdown().await;
}

#[tokio::test]
async fn test_flush_on_deadline() {
    // Buffer far larger than the event count: only the deadline can flush.
    let (processor, read, _dir) = setup(100, Duration::from_millis(20));

    processor.enqueue(pose_event("C1", 1)).await;

    wait_for_versions(&read, "pose_C1", 1).await;
    processor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_remaining_events() {
    // Neither trigger can fire before shutdown does.
    let (processor, read, _dir) = setup(100, Duration::from_secs(60));

    for frame in 1..=3 {
        processor.enqueue(pose_event("C1", frame)).await;
    }
    processor.shutdown().await;

    // The final flush completed before shutdown returned.
    let anchor = read.get_anchor("S1", "pose_C1").await.unwrap();
    assert_eq!(anchor.versions.len(), 3);
}

#[tokio::test]
async fn test_enqueue_after_shutdown_is_dropped() {
    let (processor, read, _dir) = setup(10, Duration::from_millis(20));

    processor.shutdown().await;
    assert_eq!(
        processor.enqueue(pose_event("C1", 1)).await,
        EnqueueStatus::Dropped
    );

    // Nothing was processed.
    assert!(read.get_anchor("S1", "pose_C1").await.is_err());
}

#[tokio::test]
async fn test_events_processed_in_enqueue_order() {
    let (processor, read, _dir) = setup(4, Duration::from_millis(20));

    for frame in 1..=8 {
        processor.enqueue(pose_event("C1", frame)).await;
    }
    processor.shutdown().await;

    let anchor = read.get_anchor("S1", "pose_C1").await.unwrap();
    let frames: Vec<u64> = anchor.versions.iter().map(|v| v.frame_number).collect();
    assert_eq!(frames, vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

fn service_config(dir: &TempDir, batch_size: usize, flush_interval_ms: u64) -> EngineConfig {
    EngineConfig {
        database_path: dir.path().join("stag-data"),
        batch_size,
        flush_interval_ms,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_service_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = service_config(&dir, 50, 100);
    config.batch_size = 0;

    let err = StagService::new(config).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_service_ingest_ack_counts_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let service = StagService::new(service_config(&dir, 50, 20)).await.unwrap();

    // Middle event declares a pose but carries no payload.
    let mut broken = pose_event("C1", 2);
    broken.payload = None;

    let ack = service
        .ingest(IngestBatch {
            batch_id: "batch-1".to_string(),
            events: vec![pose_event("C1", 1), broken, pose_event("C1", 3)],
            timestamp: chrono::Utc::now(),
            relay_id: "relay-1".to_string(),
            processing_info: Default::default(),
        })
        .await;

    assert_eq!(ack.batch_id, "batch-1");
    assert_eq!(ack.processed, 3);
    assert_eq!(ack.errors, 1);
    assert!(ack.queued);
    assert!(!ack.trace_id.is_empty());

    service.shutdown().await;

    // The invalid event failed in the engine without blocking the third.
    let anchor = service.read().get_anchor("S1", "pose_C1").await.unwrap();
    assert_eq!(anchor.versions.len(), 2);
    let frames: Vec<u64> = anchor.versions.iter().map(|v| v.frame_number).collect();
    assert_eq!(frames, vec![1, 3]);
}

#[tokio::test]
async fn test_service_delete_operations() {
    let dir = tempfile::tempdir().unwrap();
    let service = StagService::new(service_config(&dir, 50, 20)).await.unwrap();

    service
        .ingest(IngestBatch {
            batch_id: "batch-1".to_string(),
            events: vec![pose_event("C1", 1), pose_event("C2", 1)],
            timestamp: chrono::Utc::now(),
            relay_id: "relay-1".to_string(),
            processing_info: Default::default(),
        })
        .await;
    service.shutdown().await;

    service.delete_anchor("S1", "pose_C1").await.unwrap();
    assert!(service.read().get_anchor("S1", "pose_C1").await.is_err());
    assert_eq!(service.read().list_anchors("S1").await.unwrap().len(), 1);

    service.delete_graph("S1").await.unwrap();
    assert!(service.read().list_graphs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_service_clear_graphs() {
    let dir = tempfile::tempdir().unwrap();
    let service = StagService::new(service_config(&dir, 50, 20)).await.unwrap();

    let mut s2 = pose_event("C1", 1);
    s2.session_id = "S2".to_string();
    service
        .ingest(IngestBatch {
            batch_id: "batch-1".to_string(),
            events: vec![pose_event("C1", 1), s2],
            timestamp: chrono::Utc::now(),
            relay_id: "relay-1".to_string(),
            processing_info: Default::default(),
        })
        .await;
    service.shutdown().await;

    assert_eq!(service.clear_graphs().await.unwrap(), 2);
    assert!(service.read().list_graphs().await.unwrap().is_empty());
    let stats = service.read().get_system_stats().await.unwrap();
    assert_eq!(stats.graph_count, 0);
    assert_eq!(stats.version_count, 0);
}
