// SPDX-License-Identifier: PMPL-1.0-or-later
//
// redb-backed store for the stag spatial graph.
//
// A single redb file holds four tables (`graphs`, `anchors`, `versions`,
// `stats`). Records are JSON-encoded via serde; keys follow the layout in
// [`crate::keys`]. All blocking redb work runs on the tokio blocking pool so
// the async surface never stalls an executor thread.
//
// # Transactions
//
// - Every materialising read (`get_graph`, `list_graphs`, `get_anchor`,
//   `anchor_history`, ...) executes inside one read transaction, so callers
//   see a consistent snapshot.
// - Multi-table writes go through [`SpatialStore::with_write`]: the closure
//   receives a [`StoreTxn`] view over all four tables and either commits as
//   a whole or leaves no trace.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use redb::{
    Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ResourceKind, StorageError};
use crate::keys;
use crate::types::{Anchor, AnchorVersion, SpatialGraph, SystemStats};

const GRAPHS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("graphs");
const ANCHORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("anchors");
const VERSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");
const STATS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");

/// Bounded wait for the database file lock.
const LOCK_WAIT: Duration = Duration::from_secs(1);
const LOCK_RETRY: Duration = Duration::from_millis(50);
/// Default bound on a single store operation.
const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// The embedded spatial-graph store. One instance owns the database file
/// exclusively for the lifetime of the process.
pub struct SpatialStore {
    db: Arc<Database>,
    path: PathBuf,
    op_timeout: Duration,
}

impl std::fmt::Debug for SpatialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialStore").field("path", &self.path).finish()
    }
}

impl SpatialStore {
    /// Open or create the database file at `path`.
    ///
    /// The parent directory is created (mode 0755) if absent and the file is
    /// restricted to the owning user (mode 0600). Lock acquisition waits at
    /// most ~1 second before yielding [`StorageError::Busy`]. The four
    /// tables are created eagerly and the system-stats record is seeded on
    /// first open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755))?;
                }
            }
        }

        let deadline = Instant::now() + LOCK_WAIT;
        let db = loop {
            match Database::create(&path) {
                Ok(db) => break db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::Busy(format!(
                            "timed out waiting for lock on {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => {
                    return Err(StorageError::Backend(format!(
                        "failed to open database at {}: {err}",
                        path.display()
                    )));
                }
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        // Create all tables up front and seed the system-stats record so
        // readers never observe a missing table.
        let txn = db
            .begin_write()
            .map_err(|e| backend_err("init write txn", e))?;
        {
            let _ = txn
                .open_table(GRAPHS_TABLE)
                .map_err(|e| backend_err("open graphs table", e))?;
            let _ = txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?;
            let _ = txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?;
            let mut stats = txn
                .open_table(STATS_TABLE)
                .map_err(|e| backend_err("open stats table", e))?;
            let missing = stats
                .get(keys::SYSTEM_STATS_KEY)
                .map_err(|e| backend_err("read system stats", e))?
                .is_none();
            if missing {
                let seed = encode(&SystemStats::new(Utc::now()))?;
                stats
                    .insert(keys::SYSTEM_STATS_KEY, seed.as_slice())
                    .map_err(|e| backend_err("seed system stats", e))?;
            }
        }
        txn.commit().map_err(|e| backend_err("init commit", e))?;

        info!(path = %path.display(), "opened spatial store");

        Ok(Self {
            db: Arc::new(db),
            path,
            op_timeout: OP_TIMEOUT,
        })
    }

    /// Bound each store operation to `timeout` instead of the 30 s default.
    ///
    /// A timed-out write is abandoned by the caller but still commits or
    /// aborts on its own; transactions are never cancelled mid-flight.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Filesystem path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the database file in bytes.
    pub fn database_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let task = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(joined) => joined
                .map_err(|e| StorageError::Backend(format!("blocking task join: {e}")))?,
            Err(_) => Err(StorageError::Busy(format!(
                "store operation timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    /// Run `f` inside a single write transaction spanning all four tables.
    ///
    /// The transaction commits iff `f` returns `Ok`; on `Err` every change
    /// made through the [`StoreTxn`] is rolled back. The closure runs on the
    /// blocking pool and is never cancelled mid-flight.
    pub async fn with_write<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |db| {
            let txn = db
                .begin_write()
                .map_err(|e| backend_err("write txn", e))?;
            let outcome = {
                let mut view = StoreTxn::open(&txn)?;
                f(&mut view)
            };
            match outcome {
                Ok(value) => {
                    txn.commit().map_err(|e| backend_err("commit", e))?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = txn.abort();
                    Err(err)
                }
            }
        })
        .await
    }

    // Graph operations

    /// Create a graph record. Fails with `AlreadyExists` if the id is taken.
    pub async fn create_graph(&self, mut graph: SpatialGraph) -> Result<SpatialGraph, StorageError> {
        let now = Utc::now();
        graph.created_at = now;
        graph.updated_at = now;
        let record = graph.clone();
        self.with_write(move |txn| txn.insert_graph(&record)).await?;
        Ok(graph)
    }

    /// Update an existing graph record. Fails with `NotFound` if absent.
    pub async fn update_graph(&self, mut graph: SpatialGraph) -> Result<SpatialGraph, StorageError> {
        graph.updated_at = Utc::now();
        let record = graph.clone();
        self.with_write(move |txn| {
            if txn.get_graph(&record.id)?.is_none() {
                return Err(StorageError::not_found(ResourceKind::Graph, &record.id));
            }
            txn.put_graph(&record)
        })
        .await?;
        Ok(graph)
    }

    /// Fetch a graph with its anchors and their version chains materialised.
    pub async fn get_graph(&self, graph_id: &str) -> Result<SpatialGraph, StorageError> {
        let graph_id = graph_id.to_string();
        self.run(move |db| {
            let txn = db.begin_read().map_err(|e| backend_err("read txn", e))?;
            let graphs = txn
                .open_table(GRAPHS_TABLE)
                .map_err(|e| backend_err("open graphs table", e))?;
            let anchors = txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?;
            let versions = txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?;
            load_graph(&graphs, &anchors, &versions, &graph_id)?
                .ok_or_else(|| StorageError::not_found(ResourceKind::Graph, &graph_id))
        })
        .await
    }

    /// List all graphs in key order, each fully materialised.
    pub async fn list_graphs(&self) -> Result<Vec<SpatialGraph>, StorageError> {
        self.run(move |db| {
            let txn = db.begin_read().map_err(|e| backend_err("read txn", e))?;
            let graphs = txn
                .open_table(GRAPHS_TABLE)
                .map_err(|e| backend_err("open graphs table", e))?;
            let anchors = txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?;
            let versions = txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?;

            let records: Vec<SpatialGraph> = scan_values(&graphs, "")?;
            let mut out = Vec::with_capacity(records.len());
            for record in records {
                // The record was just scanned, so the reload cannot miss.
                if let Some(graph) = load_graph(&graphs, &anchors, &versions, &record.id)? {
                    out.push(graph);
                }
            }
            Ok(out)
        })
        .await
    }

    /// Delete a graph and cascade to its anchors and versions, adjusting the
    /// system totals in the same transaction.
    pub async fn delete_graph(&self, graph_id: &str) -> Result<(), StorageError> {
        let id = graph_id.to_string();
        let (anchors_removed, versions_removed) = self
            .with_write(move |txn| txn.remove_graph_cascade(&id))
            .await?;
        info!(
            graph_id,
            anchors = anchors_removed,
            versions = versions_removed,
            "deleted graph"
        );
        Ok(())
    }

    /// Delete an anchor and its versions, adjusting graph and system stats
    /// in the same transaction.
    pub async fn delete_anchor(&self, graph_id: &str, anchor_id: &str) -> Result<(), StorageError> {
        let gid = graph_id.to_string();
        let aid = anchor_id.to_string();
        let versions_removed = self
            .with_write(move |txn| txn.remove_anchor_cascade(&gid, &aid))
            .await?;
        info!(graph_id, anchor_id, versions = versions_removed, "deleted anchor");
        Ok(())
    }

    /// Delete every graph in the store, resetting totals. Returns the number
    /// of graphs removed.
    pub async fn clear_graphs(&self) -> Result<usize, StorageError> {
        let removed = self
            .with_write(|txn| {
                let ids = keys_with_prefix(&txn.graphs, "")?;
                for id in &ids {
                    txn.remove_graph_cascade(id)?;
                }
                Ok(ids.len())
            })
            .await?;
        info!(graphs = removed, "cleared all graphs");
        Ok(removed)
    }

    // Anchor operations

    /// Fetch an anchor with its full version chain.
    pub async fn get_anchor(&self, graph_id: &str, anchor_id: &str) -> Result<Anchor, StorageError> {
        let graph_id = graph_id.to_string();
        let anchor_id = anchor_id.to_string();
        self.run(move |db| {
            let txn = db.begin_read().map_err(|e| backend_err("read txn", e))?;
            let anchors = txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?;
            let versions = txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?;

            let key = keys::anchor_key(&graph_id, &anchor_id);
            let mut anchor: Anchor = get_value(&anchors, &key)?
                .ok_or_else(|| StorageError::not_found(ResourceKind::Anchor, &key))?;
            anchor.versions = scan_values(&versions, &keys::version_prefix(&graph_id, &anchor_id))?;
            Ok(anchor)
        })
        .await
    }

    /// List all anchors of a graph with their full version chains.
    /// Fails with `NotFound` if the graph itself is absent.
    pub async fn list_anchors(&self, graph_id: &str) -> Result<Vec<Anchor>, StorageError> {
        let graph_id = graph_id.to_string();
        self.run(move |db| {
            let txn = db.begin_read().map_err(|e| backend_err("read txn", e))?;
            let graphs = txn
                .open_table(GRAPHS_TABLE)
                .map_err(|e| backend_err("open graphs table", e))?;
            if graphs
                .get(graph_id.as_str())
                .map_err(|e| backend_err("get graph", e))?
                .is_none()
            {
                return Err(StorageError::not_found(ResourceKind::Graph, &graph_id));
            }

            let anchors = txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?;
            let versions = txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?;

            let mut out: Vec<Anchor> = scan_values(&anchors, &keys::anchor_prefix(&graph_id))?;
            for anchor in &mut out {
                anchor.versions =
                    scan_values(&versions, &keys::version_prefix(&graph_id, &anchor.id))?;
            }
            Ok(out)
        })
        .await
    }

    /// One page of an anchor's version chain in key (= insertion) order.
    ///
    /// Returns the window plus the total chain length, computed by a full
    /// prefix scan. An offset at or past the total yields an empty window
    /// with the total still accurate.
    pub async fn anchor_history(
        &self,
        graph_id: &str,
        anchor_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<AnchorVersion>, usize), StorageError> {
        let graph_id = graph_id.to_string();
        let anchor_id = anchor_id.to_string();
        self.run(move |db| {
            let txn = db.begin_read().map_err(|e| backend_err("read txn", e))?;
            let anchors = txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?;
            let key = keys::anchor_key(&graph_id, &anchor_id);
            if anchors
                .get(key.as_str())
                .map_err(|e| backend_err("get anchor", e))?
                .is_none()
            {
                return Err(StorageError::not_found(ResourceKind::Anchor, &key));
            }

            let versions = txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?;
            let prefix = keys::version_prefix(&graph_id, &anchor_id);

            let mut total = 0usize;
            let mut window = Vec::new();
            let iter = versions
                .range(prefix.as_str()..)
                .map_err(|e| backend_err("range scan", e))?;
            for entry in iter {
                let (k, v) = entry.map_err(|e| backend_err("scan entry", e))?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                if total >= offset && window.len() < limit {
                    window.push(decode(v.value())?);
                }
                total += 1;
            }
            Ok((window, total))
        })
        .await
    }

    // Statistics operations

    /// Current system totals with `database_size` refreshed from the file.
    pub async fn get_system_stats(&self) -> Result<SystemStats, StorageError> {
        let mut stats = self
            .run(move |db| {
                let txn = db.begin_read().map_err(|e| backend_err("read txn", e))?;
                let table = txn
                    .open_table(STATS_TABLE)
                    .map_err(|e| backend_err("open stats table", e))?;
                Ok(get_value::<SystemStats>(&table, keys::SYSTEM_STATS_KEY)?
                    .unwrap_or_else(|| SystemStats::new(Utc::now())))
            })
            .await?;
        stats.database_size = self.database_size();
        Ok(stats)
    }

    /// Overwrite the system totals, stamping the current database size.
    pub async fn update_system_stats(&self, mut stats: SystemStats) -> Result<(), StorageError> {
        stats.database_size = self.database_size();
        self.with_write(move |txn| {
            txn.put_system_stats(&stats)?;
            Ok(())
        })
        .await
    }
}

/// Typed view over the four tables inside one write transaction.
///
/// Handed to [`SpatialStore::with_write`] closures; every mutation made
/// through it commits or rolls back atomically.
pub struct StoreTxn<'t> {
    graphs: Table<'t, &'static str, &'static [u8]>,
    anchors: Table<'t, &'static str, &'static [u8]>,
    versions: Table<'t, &'static str, &'static [u8]>,
    stats: Table<'t, &'static str, &'static [u8]>,
}

impl<'t> StoreTxn<'t> {
    fn open(txn: &'t WriteTransaction) -> Result<Self, StorageError> {
        Ok(Self {
            graphs: txn
                .open_table(GRAPHS_TABLE)
                .map_err(|e| backend_err("open graphs table", e))?,
            anchors: txn
                .open_table(ANCHORS_TABLE)
                .map_err(|e| backend_err("open anchors table", e))?,
            versions: txn
                .open_table(VERSIONS_TABLE)
                .map_err(|e| backend_err("open versions table", e))?,
            stats: txn
                .open_table(STATS_TABLE)
                .map_err(|e| backend_err("open stats table", e))?,
        })
    }

    pub fn get_graph(&self, graph_id: &str) -> Result<Option<SpatialGraph>, StorageError> {
        get_value(&self.graphs, graph_id)
    }

    /// Insert a new graph record; `AlreadyExists` on key collision.
    pub fn insert_graph(&mut self, graph: &SpatialGraph) -> Result<(), StorageError> {
        if self
            .graphs
            .get(graph.id.as_str())
            .map_err(|e| backend_err("get graph", e))?
            .is_some()
        {
            return Err(StorageError::already_exists(ResourceKind::Graph, &graph.id));
        }
        self.put_graph(graph)
    }

    /// Write a graph record, stripping the materialised anchor map.
    pub fn put_graph(&mut self, graph: &SpatialGraph) -> Result<(), StorageError> {
        let mut record = graph.clone();
        record.anchors.clear();
        let bytes = encode(&record)?;
        self.graphs
            .insert(graph.id.as_str(), bytes.as_slice())
            .map_err(|e| backend_err("insert graph", e))?;
        Ok(())
    }

    pub fn get_anchor(&self, graph_id: &str, anchor_id: &str) -> Result<Option<Anchor>, StorageError> {
        get_value(&self.anchors, &keys::anchor_key(graph_id, anchor_id))
    }

    /// Insert a new anchor record; `AlreadyExists` on key collision.
    pub fn insert_anchor(&mut self, anchor: &Anchor) -> Result<(), StorageError> {
        let key = keys::anchor_key(&anchor.graph_id, &anchor.id);
        if self
            .anchors
            .get(key.as_str())
            .map_err(|e| backend_err("get anchor", e))?
            .is_some()
        {
            return Err(StorageError::already_exists(ResourceKind::Anchor, key));
        }
        self.put_anchor(anchor)
    }

    /// Write an anchor record, stripping the materialised version chain.
    pub fn put_anchor(&mut self, anchor: &Anchor) -> Result<(), StorageError> {
        let key = keys::anchor_key(&anchor.graph_id, &anchor.id);
        let mut record = anchor.clone();
        record.versions.clear();
        let bytes = encode(&record)?;
        self.anchors
            .insert(key.as_str(), bytes.as_slice())
            .map_err(|e| backend_err("insert anchor", e))?;
        Ok(())
    }

    pub fn get_version(
        &self,
        graph_id: &str,
        anchor_id: &str,
        version_id: &str,
    ) -> Result<Option<AnchorVersion>, StorageError> {
        get_value(&self.versions, &keys::version_key(graph_id, anchor_id, version_id))
    }

    /// Append a version record; `AlreadyExists` on key collision.
    pub fn insert_version(
        &mut self,
        graph_id: &str,
        anchor_id: &str,
        version: &AnchorVersion,
    ) -> Result<(), StorageError> {
        let key = keys::version_key(graph_id, anchor_id, &version.version_id);
        if self
            .versions
            .get(key.as_str())
            .map_err(|e| backend_err("get version", e))?
            .is_some()
        {
            return Err(StorageError::already_exists(ResourceKind::Version, key));
        }
        let bytes = encode(version)?;
        self.versions
            .insert(key.as_str(), bytes.as_slice())
            .map_err(|e| backend_err("insert version", e))?;
        Ok(())
    }

    /// Number of versions stored for an anchor (full prefix scan).
    pub fn version_count(&self, graph_id: &str, anchor_id: &str) -> Result<u64, StorageError> {
        let prefix = keys::version_prefix(graph_id, anchor_id);
        let mut count = 0u64;
        let iter = self
            .versions
            .range(prefix.as_str()..)
            .map_err(|e| backend_err("range scan", e))?;
        for entry in iter {
            let (k, _) = entry.map_err(|e| backend_err("scan entry", e))?;
            if !k.value().starts_with(prefix.as_str()) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn system_stats(&self) -> Result<SystemStats, StorageError> {
        Ok(get_value::<SystemStats>(&self.stats, keys::SYSTEM_STATS_KEY)?
            .unwrap_or_else(|| SystemStats::new(Utc::now())))
    }

    pub fn put_system_stats(&mut self, stats: &SystemStats) -> Result<(), StorageError> {
        let bytes = encode(stats)?;
        self.stats
            .insert(keys::SYSTEM_STATS_KEY, bytes.as_slice())
            .map_err(|e| backend_err("insert system stats", e))?;
        Ok(())
    }

    /// Remove a graph, its anchors and versions, and subtract the removed
    /// records from graph-independent totals. Returns (anchors, versions)
    /// removed.
    fn remove_graph_cascade(&mut self, graph_id: &str) -> Result<(usize, usize), StorageError> {
        if self
            .graphs
            .remove(graph_id)
            .map_err(|e| backend_err("remove graph", e))?
            .is_none()
        {
            return Err(StorageError::not_found(ResourceKind::Graph, graph_id));
        }

        let version_keys = keys_with_prefix(&self.versions, &keys::anchor_prefix(graph_id))?;
        for key in &version_keys {
            self.versions
                .remove(key.as_str())
                .map_err(|e| backend_err("remove version", e))?;
        }

        let anchor_keys = keys_with_prefix(&self.anchors, &keys::anchor_prefix(graph_id))?;
        for key in &anchor_keys {
            self.anchors
                .remove(key.as_str())
                .map_err(|e| backend_err("remove anchor", e))?;
        }

        let mut stats = self.system_stats()?;
        stats.graph_count = stats.graph_count.saturating_sub(1);
        stats.anchor_count = stats.anchor_count.saturating_sub(anchor_keys.len() as u64);
        stats.version_count = stats.version_count.saturating_sub(version_keys.len() as u64);
        stats.event_count = stats.event_count.saturating_sub(version_keys.len() as u64);
        self.put_system_stats(&stats)?;

        debug!(
            graph_id,
            anchors = anchor_keys.len(),
            versions = version_keys.len(),
            "cascaded graph delete"
        );
        Ok((anchor_keys.len(), version_keys.len()))
    }

    /// Remove an anchor and its versions, updating the owning graph's stats
    /// and the system totals. Returns the number of versions removed.
    fn remove_anchor_cascade(
        &mut self,
        graph_id: &str,
        anchor_id: &str,
    ) -> Result<usize, StorageError> {
        let key = keys::anchor_key(graph_id, anchor_id);
        if self
            .anchors
            .remove(key.as_str())
            .map_err(|e| backend_err("remove anchor", e))?
            .is_none()
        {
            return Err(StorageError::not_found(ResourceKind::Anchor, key));
        }

        let version_keys = keys_with_prefix(&self.versions, &keys::version_prefix(graph_id, anchor_id))?;
        for vkey in &version_keys {
            self.versions
                .remove(vkey.as_str())
                .map_err(|e| backend_err("remove version", e))?;
        }
        let removed = version_keys.len() as u64;

        if let Some(mut graph) = self.get_graph(graph_id)? {
            graph.stats.anchor_count = graph.stats.anchor_count.saturating_sub(1);
            graph.stats.version_count = graph.stats.version_count.saturating_sub(removed);
            graph.stats.event_count = graph.stats.event_count.saturating_sub(removed);
            graph.updated_at = Utc::now();
            self.put_graph(&graph)?;
        }

        let mut stats = self.system_stats()?;
        stats.anchor_count = stats.anchor_count.saturating_sub(1);
        stats.version_count = stats.version_count.saturating_sub(removed);
        stats.event_count = stats.event_count.saturating_sub(removed);
        self.put_system_stats(&stats)?;

        Ok(version_keys.len())
    }
}

fn backend_err(context: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(format!("{context}: {err}"))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization(format!("encode: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(format!("decode: {e}")))
}

fn get_value<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match table.get(key).map_err(|e| backend_err("get", e))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every value whose key starts with `prefix`, in key order.
fn scan_values<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    let iter = table
        .range(prefix..)
        .map_err(|e| backend_err("range scan", e))?;
    for entry in iter {
        let (k, v) = entry.map_err(|e| backend_err("scan entry", e))?;
        if !k.value().starts_with(prefix) {
            break;
        }
        out.push(decode(v.value())?);
    }
    Ok(out)
}

/// Collect every key starting with `prefix`, in key order.
fn keys_with_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<String>, StorageError> {
    let mut out = Vec::new();
    let iter = table
        .range(prefix..)
        .map_err(|e| backend_err("range scan", e))?;
    for entry in iter {
        let (k, _) = entry.map_err(|e| backend_err("scan entry", e))?;
        if !k.value().starts_with(prefix) {
            break;
        }
        out.push(k.value().to_string());
    }
    Ok(out)
}

fn load_graph(
    graphs: &impl ReadableTable<&'static str, &'static [u8]>,
    anchors: &impl ReadableTable<&'static str, &'static [u8]>,
    versions: &impl ReadableTable<&'static str, &'static [u8]>,
    graph_id: &str,
) -> Result<Option<SpatialGraph>, StorageError> {
    let Some(mut graph) = get_value::<SpatialGraph>(graphs, graph_id)? else {
        return Ok(None);
    };
    for mut anchor in scan_values::<Anchor>(anchors, &keys::anchor_prefix(graph_id))? {
        anchor.versions = scan_values(versions, &keys::version_prefix(graph_id, &anchor.id))?;
        graph.anchors.insert(anchor.id.clone(), anchor);
    }
    Ok(Some(graph))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeType, GraphStats, Metadata};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn temp_store() -> (SpatialStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SpatialStore::open(dir.path().join("stag-data")).unwrap();
        (store, dir)
    }

    fn graph(id: &str) -> SpatialGraph {
        SpatialGraph {
            id: id.to_string(),
            name: format!("Session {id}"),
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            anchors: BTreeMap::new(),
            stats: GraphStats::default(),
            metadata: Metadata::new(),
        }
    }

    fn anchor(graph_id: &str, id: &str, hash: &str) -> Anchor {
        Anchor {
            id: id.to_string(),
            graph_id: graph_id.to_string(),
            current_hash: hash.to_string(),
            versions: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_session_id: graph_id.to_string(),
            last_client_id: "C1".to_string(),
            last_device_id: "D1".to_string(),
            version_seq: 0,
            metadata: Metadata::new(),
        }
    }

    fn version(seq: u64, hash: &str) -> AnchorVersion {
        AnchorVersion {
            version_id: keys::version_id(seq),
            hash: hash.to_string(),
            timestamp: Utc::now(),
            change_type: if seq == 1 {
                ChangeType::Create
            } else {
                ChangeType::Update
            },
            transform: None,
            payload: None,
            event_id: format!("e-{seq}"),
            session_id: "S1".to_string(),
            client_id: "C1".to_string(),
            device_id: "D1".to_string(),
            frame_number: seq,
            metadata: Metadata::new(),
        }
    }

    /// Write an anchor and `n` versions through a single transaction.
    async fn seed_anchor(store: &SpatialStore, graph_id: &str, anchor_id: &str, n: u64) {
        let graph_id = graph_id.to_string();
        let anchor_id = anchor_id.to_string();
        store
            .with_write(move |txn| {
                let mut a = anchor(&graph_id, &anchor_id, "h");
                a.version_seq = n;
                a.current_hash = format!("h{n}");
                txn.insert_anchor(&a)?;
                for seq in 1..=n {
                    txn.insert_version(&graph_id, &anchor_id, &version(seq, &format!("h{seq}")))?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_seeds_system_stats() {
        let (store, _dir) = temp_store();
        let stats = store.get_system_stats().await.unwrap();
        assert_eq!(stats.graph_count, 0);
        assert_eq!(stats.version_count, 0);
        assert!(stats.database_size > 0);
    }

    #[tokio::test]
    async fn test_graph_crud() {
        let (store, _dir) = temp_store();

        let missing = store.get_graph("S1").await;
        assert!(matches!(missing, Err(StorageError::NotFound { .. })));

        store.create_graph(graph("S1")).await.unwrap();
        let err = store.create_graph(graph("S1")).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        let mut g = store.get_graph("S1").await.unwrap();
        assert_eq!(g.name, "Session S1");
        assert!(g.anchors.is_empty());

        g.description = "updated".to_string();
        store.update_graph(g).await.unwrap();
        let g = store.get_graph("S1").await.unwrap();
        assert_eq!(g.description, "updated");

        let err = store.update_graph(graph("nope")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_graphs_in_key_order() {
        let (store, _dir) = temp_store();
        for id in ["zeta", "alpha", "mid"] {
            store.create_graph(graph(id)).await.unwrap();
        }
        let ids: Vec<String> = store
            .list_graphs()
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_anchor_and_versions_materialise_in_order() {
        let (store, _dir) = temp_store();
        store.create_graph(graph("S1")).await.unwrap();
        seed_anchor(&store, "S1", "A", 3).await;

        let anchor = store.get_anchor("S1", "A").await.unwrap();
        assert_eq!(anchor.versions.len(), 3);
        let ids: Vec<&str> = anchor.versions.iter().map(|v| v.version_id.as_str()).collect();
        assert_eq!(ids, vec!["v0000000001", "v0000000002", "v0000000003"]);
        assert_eq!(anchor.versions[0].change_type, ChangeType::Create);

        let g = store.get_graph("S1").await.unwrap();
        assert_eq!(g.anchors.len(), 1);
        assert_eq!(g.anchors["A"].versions.len(), 3);
    }

    #[tokio::test]
    async fn test_list_anchors_requires_graph() {
        let (store, _dir) = temp_store();
        let err = store.list_anchors("ghost").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_anchor_history_pagination() {
        let (store, _dir) = temp_store();
        store.create_graph(graph("S1")).await.unwrap();
        seed_anchor(&store, "S1", "A", 25).await;

        let (window, total) = store.anchor_history("S1", "A", 10, 5).await.unwrap();
        assert_eq!(total, 25);
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].version_id, keys::version_id(11));
        assert_eq!(window[4].version_id, keys::version_id(15));

        // Offset past the end: empty window, accurate total.
        let (window, total) = store.anchor_history("S1", "A", 25, 5).await.unwrap();
        assert!(window.is_empty());
        assert_eq!(total, 25);

        let err = store.anchor_history("S1", "ghost", 0, 5).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_graph_cascades() {
        let (store, _dir) = temp_store();
        store.create_graph(graph("S1")).await.unwrap();
        seed_anchor(&store, "S1", "A", 2).await;
        seed_anchor(&store, "S1", "B", 1).await;

        store.delete_graph("S1").await.unwrap();

        assert!(store.get_graph("S1").await.is_err());
        assert!(store.get_anchor("S1", "A").await.is_err());
        assert!(store.list_graphs().await.unwrap().is_empty());

        let err = store.delete_graph("S1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_anchor_adjusts_graph_stats() {
        let (store, _dir) = temp_store();
        let mut g = graph("S1");
        g.stats.anchor_count = 2;
        g.stats.version_count = 3;
        g.stats.event_count = 3;
        store.create_graph(g).await.unwrap();
        seed_anchor(&store, "S1", "A", 2).await;
        seed_anchor(&store, "S1", "B", 1).await;

        store.delete_anchor("S1", "A").await.unwrap();

        assert!(store.get_anchor("S1", "A").await.is_err());
        let g = store.get_graph("S1").await.unwrap();
        assert_eq!(g.stats.anchor_count, 1);
        assert_eq!(g.stats.version_count, 1);
        assert_eq!(g.anchors.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_graphs_resets_store() {
        let (store, _dir) = temp_store();
        store.create_graph(graph("S1")).await.unwrap();
        store.create_graph(graph("S2")).await.unwrap();
        seed_anchor(&store, "S1", "A", 2).await;

        let removed = store.clear_graphs().await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.list_graphs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_with_write_rolls_back_on_error() {
        let (store, _dir) = temp_store();
        store.create_graph(graph("S1")).await.unwrap();

        let result: Result<(), StorageError> = store
            .with_write(|txn| {
                txn.insert_anchor(&anchor("S1", "A", "h1"))?;
                txn.insert_version("S1", "A", &version(1, "h1"))?;
                Err(StorageError::Backend("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        // Nothing from the aborted transaction is visible.
        assert!(store.get_anchor("S1", "A").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_version_collision() {
        let (store, _dir) = temp_store();
        store.create_graph(graph("S1")).await.unwrap();
        seed_anchor(&store, "S1", "A", 1).await;

        let err = store
            .with_write(|txn| {
                txn.insert_version("S1", "A", &version(1, "other"))?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stag-data");
        {
            let store = SpatialStore::open(&path).unwrap();
            store.create_graph(graph("S1")).await.unwrap();
            seed_anchor(&store, "S1", "A", 2).await;
        }
        {
            let store = SpatialStore::open(&path).unwrap();
            let g = store.get_graph("S1").await.unwrap();
            assert_eq!(g.anchors["A"].versions.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_second_open_is_busy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stag-data");
        let _store = SpatialStore::open(&path).unwrap();

        let contender = path.clone();
        let err = tokio::task::spawn_blocking(move || SpatialStore::open(contender))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("stag-data");
        let _store = SpatialStore::open(&path).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o755);
    }
}
