use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backup::{self, BackupReport, RestoreReport};
use super::cluster::Cluster;
use crate::peer::PeerNode;
use crate::table::{ClusterTable, MaintenanceReport, Table};
use crate::value::TableValue;

/// A background loop and the token that stops it.
struct Worker {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Process-wide directory of tables, built once at startup and shared with
/// the HTTP handlers and every background loop.
pub struct ClusterRegistry {
    cluster: Arc<Cluster>,
    data_dir: PathBuf,
    tables: DashMap<String, Arc<dyn ClusterTable>>,
    workers: Mutex<Vec<Worker>>,
    closing: CancellationToken,
}

impl ClusterRegistry {
    pub fn new(cluster: Arc<Cluster>, data_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            data_dir: data_dir.into(),
            tables: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            closing: CancellationToken::new(),
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Cancelled when [`shutdown`](Self::shutdown) starts; long-lived
    /// responses end with it.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Opens the table `name` under the data directory and registers it.
    pub fn open_table<V: TableValue>(&self, name: &str, min_version: u32) -> Result<Arc<Table<V>>> {
        let table = Table::<V>::open(
            name,
            self.data_dir.join(name),
            min_version,
            self.cluster.clone(),
        )?;
        self.register(table.clone())?;
        Ok(table)
    }

    pub fn register<V: TableValue>(&self, table: Arc<Table<V>>) -> Result<()> {
        let name = table.name().to_string();
        if self.tables.contains_key(&name) {
            anyhow::bail!("Table {} is already registered", name);
        }
        tracing::info!("Registered table {}", name);
        self.tables.insert(name, table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<Arc<dyn ClusterTable>> {
        self.tables.get(name).map(|t| t.value().clone())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    fn all_tables(&self) -> Vec<Arc<dyn ClusterTable>> {
        let mut tables: Vec<Arc<dyn ClusterTable>> =
            self.tables.iter().map(|t| t.value().clone()).collect();
        tables.sort_by(|a, b| a.table_name().cmp(b.table_name()));
        tables
    }

    /// Identifies this process among the configured nodes.
    pub async fn mark_self(&self) {
        self.cluster.mark_self().await;
    }

    // --- Liveness monitors ---

    /// Starts one liveness monitor per reachable node. Every (re)connection
    /// triggers a full sync of the tables that node serves.
    pub fn start_monitors(self: &Arc<Self>) {
        if !self.cluster.is_enabled() {
            tracing::info!("Clustering disabled, no liveness monitors started");
            return;
        }
        let mut workers = self.workers.lock();
        for node in self.cluster.nodes() {
            if !node.is_reachable() {
                continue;
            }
            let cancel = CancellationToken::new();
            let registry: Weak<ClusterRegistry> = Arc::downgrade(self);
            let on_connected = move |peer: Arc<PeerNode>| {
                let Some(registry) = registry.upgrade() else { return };
                tokio::spawn(async move {
                    registry.sync_all_from(&peer).await;
                });
            };
            let handle = tokio::spawn(node.clone().monitor_connection(cancel.clone(), on_connected));
            workers.push(Worker {
                name: format!("monitor {}", node.host()),
                cancel,
                handle,
            });
        }
        tracing::info!("Started {} liveness monitors", workers.len());
    }

    /// Pulls every table `peer` serves from it.
    pub async fn sync_all_from(&self, peer: &Arc<PeerNode>) -> usize {
        let mut applied = 0;
        for table in self.all_tables() {
            if !peer.serves_table(table.table_name()) {
                continue;
            }
            match table.sync_with(peer).await {
                Ok(count) => applied += count,
                Err(e) => tracing::warn!(
                    "Sync of {} from {} failed: {}",
                    table.table_name(),
                    peer.host(),
                    e
                ),
            }
        }
        applied
    }

    // --- Maintenance & backup ---

    /// Runs the maintenance sweep over every table.
    pub async fn check_and_fix_all(&self) -> MaintenanceReport {
        let mut total = MaintenanceReport::default();
        for table in self.all_tables() {
            match table.maintain().await {
                Ok(report) => total.merge(&report),
                Err(e) => tracing::error!("Maintenance of {} failed: {}", table.table_name(), e),
            }
        }
        total
    }

    /// Schedules [`check_and_fix_all`](Self::check_and_fix_all), followed by a
    /// backup when `backup_dir` is set, every `interval`.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, backup_dir: Option<PathBuf>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(super::maintenance::run(
            Arc::downgrade(self),
            interval,
            backup_dir,
            cancel.clone(),
        ));
        self.workers.lock().push(Worker {
            name: "maintenance".to_string(),
            cancel,
            handle,
        });
    }

    pub async fn backup_all(&self, backup_root: &Path) -> Result<BackupReport> {
        let tables = self.all_tables();
        let root = backup_root.to_path_buf();
        tokio::task::spawn_blocking(move || backup::backup_tables(&tables, &root)).await?
    }

    /// Replays a backup onto the live tables. `increment` picks a past
    /// backup; `None` restores the latest one.
    ///
    /// Restored entries keep their backed-up timestamps and are not pushed to
    /// peers, so the next sync hands back any newer peer copy and re-creates
    /// purged entries. Restore every node from the same backup, or restore a
    /// node that stays isolated from the cluster.
    pub async fn restore_all(&self, backup_root: &Path, increment: Option<&str>) -> Result<RestoreReport> {
        backup::restore_tables(&self.all_tables(), backup_root, increment).await
    }

    // --- Shutdown ---

    /// Stops every background loop, then waits for pending pushes.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.cancel.cancel();
        }
        for worker in workers {
            if let Err(e) = worker.handle.await {
                tracing::warn!("{} ended abnormally: {}", worker.name, e);
            }
        }
        for table in self.all_tables() {
            table.wait_for_pushes().await;
        }
        tracing::info!("Cluster registry shut down");
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("cluster", &self.cluster)
            .field("tables", &self.table_names())
            .finish()
    }
}
