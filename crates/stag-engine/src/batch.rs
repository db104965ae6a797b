// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Bounded queue + single drain worker.
//
// Producers enqueue events; one worker task drains them into a buffer that
// is flushed to the versioning engine when it reaches `batch_size` or when
// `flush_interval` elapses, whichever comes first. The buffer is touched
// only by the worker.
//
// Queue-full policy: `enqueue` blocks the caller until capacity frees, so
// backpressure propagates to producers. After shutdown is signalled,
// `enqueue` is a no-op returning `Dropped` with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use stag_storage::types::SpatialEvent;

use crate::engine::VersioningEngine;

/// What happened to an enqueued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// The event was accepted onto the queue.
    Queued,
    /// Shutdown is in progress; the event was discarded.
    Dropped,
}

/// Decouples ingestion latency from engine throughput.
///
/// Dropping the processor without calling [`shutdown`](Self::shutdown)
/// closes the queue; the worker drains what remains and exits on its own,
/// but only `shutdown` guarantees the final flush completed.
pub struct BatchProcessor {
    tx: mpsc::Sender<SpatialEvent>,
    shutdown_tx: watch::Sender<bool>,
    accepting: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    /// Spawn the drain worker. The queue holds `2 * batch_size` events.
    pub fn new(engine: Arc<VersioningEngine>, batch_size: usize, flush_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size * 2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(drain_loop(engine, rx, shutdown_rx, batch_size, flush_interval));
        Self {
            tx,
            shutdown_tx,
            accepting: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue one event for asynchronous processing.
    ///
    /// Suspends only while the queue is at capacity. Once shutdown has been
    /// signalled the event is dropped instead.
    pub async fn enqueue(&self, event: SpatialEvent) -> EnqueueStatus {
        if !self.accepting.load(Ordering::Acquire) {
            warn!(event_id = %event.event_id, "batch processor stopped, dropping event");
            return EnqueueStatus::Dropped;
        }
        match self.tx.send(event).await {
            Ok(()) => EnqueueStatus::Queued,
            Err(mpsc::error::SendError(event)) => {
                warn!(event_id = %event.event_id, "batch processor stopped, dropping event");
                EnqueueStatus::Dropped
            }
        }
    }

    /// Stop accepting events, drain the queue, run a final flush, and wait
    /// for the worker to exit. The final flush completes before this
    /// returns. Idempotent.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "batch worker task failed");
            }
        }
    }
}

async fn drain_loop(
    engine: Arc<VersioningEngine>,
    mut rx: mpsc::Receiver<SpatialEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<SpatialEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush(&engine, &mut buffer).await;
                    }
                }
                // All senders dropped: nothing more can arrive.
                None => break,
            },
            _ = ticker.tick() => {
                flush(&engine, &mut buffer).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // Drain whatever is still queued, then force the final flush.
    while let Ok(event) = rx.try_recv() {
        buffer.push(event);
        if buffer.len() >= batch_size {
            flush(&engine, &mut buffer).await;
        }
    }
    flush(&engine, &mut buffer).await;
    debug!("batch worker exited");
}

/// Snapshot the buffer (clearing it first) and hand the batch to the engine.
async fn flush(engine: &VersioningEngine, buffer: &mut Vec<SpatialEvent>) {
    if buffer.is_empty() {
        return;
    }
    let batch: Vec<SpatialEvent> = buffer.drain(..).collect();
    let size = batch.len();

    let started = Instant::now();
    let outcome = engine.apply_batch(batch).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    if outcome.errors > 0 {
        warn!(
            batch_size = size,
            processed = outcome.processed,
            errors = outcome.errors,
            duration_ms,
            "batch flush completed with errors"
        );
    } else {
        debug!(
            batch_size = size,
            processed = outcome.processed,
            duration_ms,
            "batch flush completed"
        );
    }
}
