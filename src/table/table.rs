use anyhow::Result;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use super::files;
use super::index::{Index, KeyFn};
use crate::cluster::Cluster;
use crate::error::StoreError;
use crate::locking::{LockQueue, TimestampRwLock, WriteGuard};
use crate::storage::{EntryFile, TableLayout, recover};
use crate::value::{MinimalTableValue, Record, TableValue};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Where a change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A transaction committed on this node.
    Local,
    /// Pushed by or synced from the peer with this host.
    Peer(String),
    /// Replaced from a peer while repairing corruption, or removed once
    /// every peer confirmed a deletion.
    Maintenance,
    /// Replayed from a backup.
    Restore,
}

/// Notification sent to [`Table::subscribe`] receivers after every durable
/// mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub id: String,
    pub timestamp: i64,
    pub deleted: bool,
    pub origin: ChangeOrigin,
}

/// One slot of the entry dictionary.
///
/// `file` is `None` for a placeholder: an ID that only exists because a
/// transaction or a peer's lock claim needed somewhere to hang its locks.
pub(crate) struct Entry {
    pub(crate) id: String,
    pub(crate) file: Mutex<Option<EntryFile>>,
    pub(crate) lock: TimestampRwLock,
    pub(crate) requests: Arc<LockQueue>,
}

impl Entry {
    fn new(id: &str, file: Option<EntryFile>, cluster: &Cluster) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            file: Mutex::new(file),
            lock: TimestampRwLock::new(),
            requests: LockQueue::new(id, cluster.lock_expiration()),
        })
    }

    pub(crate) fn minimal(&self) -> Option<MinimalTableValue> {
        self.file.lock().as_ref().and_then(|f| f.minimal().ok())
    }

    pub(crate) fn timestamp(&self) -> Option<i64> {
        self.minimal().map(|m| m.timestamp)
    }
}

/// A named collection of entries of one payload type.
pub struct Table<V: TableValue> {
    pub(crate) name: String,
    pub(crate) layout: TableLayout,
    pub(crate) min_version: u32,
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) entries: DashMap<String, Arc<Entry>>,
    creation_lock: tokio::sync::Mutex<()>,
    indices: RwLock<HashMap<String, Index<V>>>,
    changes: broadcast::Sender<TableChange>,
    pub(crate) pushes: Mutex<JoinSet<()>>,
}

impl<V: TableValue> Table<V> {
    /// Opens (or creates) the table rooted at `root`.
    ///
    /// Leftovers of an interrupted write are recovered before any entry is
    /// loaded. `min_version` is the lowest schema version a peer must speak
    /// to read from this table.
    pub fn open(
        name: &str,
        root: impl Into<PathBuf>,
        min_version: u32,
        cluster: Arc<Cluster>,
    ) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(StoreError::UnknownTable(name.to_string()).into());
        }
        let layout = TableLayout::new(root);
        layout.create_dirs()?;
        recover(&layout)?;

        let entries = DashMap::new();
        for id in layout.list_entry_ids()? {
            if let Some(file) = EntryFile::load(&layout, &id)? {
                entries.insert(id.clone(), Entry::new(&id, Some(file), &cluster));
            }
        }
        tracing::info!(
            "Opened table {} with {} entries at {}",
            name,
            entries.len(),
            layout.root().display()
        );

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            name: name.to_string(),
            layout,
            min_version,
            cluster,
            entries,
            creation_lock: tokio::sync::Mutex::new(()),
            indices: RwLock::new(HashMap::new()),
            changes,
            pushes: Mutex::new(JoinSet::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_version(&self) -> u32 {
        self.min_version
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    // --- Reads ---

    pub async fn get_by_id(&self, id: &str) -> Result<V> {
        self.get_by_id_nullable(id)
            .await?
            .ok_or_else(|| StoreError::not_found(&self.name, id).into())
    }

    /// The live value of `id`; `None` for missing entries and tombstones.
    pub async fn get_by_id_nullable(&self, id: &str) -> Result<Option<V>> {
        let Some(entry) = self.entry(id) else {
            return Ok(None);
        };
        let _read = entry.lock.read(self.cluster.now_ticks()).await;
        let record = self.read_record(&entry)?;
        Ok(record.and_then(|r| if r.deleted { None } else { r.value }))
    }

    /// Every live entry, ordered by ID. Tombstones are skipped.
    pub async fn list_all(&self) -> Result<Vec<(String, V)>> {
        let mut out = Vec::new();
        for id in self.ids() {
            if let Some(value) = self.get_by_id_nullable(&id).await? {
                out.push((id, value));
            }
        }
        Ok(out)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry(id)
            .and_then(|e| e.minimal())
            .map(|m| !m.deleted)
            .unwrap_or(false)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.minimal().map(|m| !m.deleted).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attachment bytes of a live entry.
    pub async fn read_file(&self, id: &str, file_id: &str) -> Result<Vec<u8>> {
        let entry = self
            .entry(id)
            .ok_or_else(|| StoreError::not_found(&self.name, id))?;
        let _read = entry.lock.read(self.cluster.now_ticks()).await;
        let missing = || StoreError::FileNotFound {
            table: self.name.clone(),
            id: id.to_string(),
            file: file_id.to_string(),
        };
        let known = entry
            .minimal()
            .map(|m| !m.deleted && m.files.contains_key(file_id))
            .unwrap_or(false);
        if !known {
            return Err(missing().into());
        }
        files::read(&self.layout, id, file_id)?.ok_or_else(|| missing().into())
    }

    /// On-disk location of a committed attachment, if it exists.
    pub fn file_path(&self, id: &str, file_id: &str) -> Option<PathBuf> {
        let path = self.layout.file_path(id, file_id);
        path.exists().then_some(path)
    }

    /// Receiver of every durable change made to this table from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }

    // --- Secondary indices ---

    /// Registers an index and builds it from the current entries.
    pub fn add_index<F>(&self, name: &str, key_fn: F) -> Result<()>
    where
        F: Fn(&V) -> Vec<String> + Send + Sync + 'static,
    {
        let key_fn: KeyFn<V> = Box::new(key_fn);
        let mut index = Index::new(key_fn);
        for item in self.entries.iter() {
            let guard = item.file.lock();
            let Some(file) = guard.as_ref() else { continue };
            match file.deserialize::<V>() {
                Ok(record) if !record.deleted => index.update(item.key(), record.value.as_ref()),
                Ok(_) => {}
                Err(e) => tracing::warn!("Index {} skips unreadable {}: {}", name, item.key(), e),
            }
        }
        tracing::info!("Index {} on {} built with {} keys", name, self.name, index.key_count());
        self.indices.write().insert(name.to_string(), index);
        Ok(())
    }

    /// IDs whose value maps to `key` in index `name`.
    pub fn find_by_index(&self, name: &str, key: &str) -> Result<Vec<String>> {
        let indices = self.indices.read();
        let index = indices
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown index {} on table {}", name, self.name))?;
        Ok(index.find(key))
    }

    // --- Push tracking ---

    /// Waits for every change push spawned so far.
    pub async fn flush_pushes(&self) {
        let mut pending = std::mem::take(&mut *self.pushes.lock());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Push task on {} failed: {}", self.name, e);
            }
        }
    }

    pub(crate) fn spawn_push<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut pushes = self.pushes.lock();
        while pushes.try_join_next().is_some() {}
        pushes.spawn(task);
    }

    // --- Entry dictionary ---

    pub(crate) fn entry(&self, id: &str) -> Option<Arc<Entry>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// The entry for `id`, inserting a placeholder when there is none.
    pub(crate) async fn get_or_create_entry(&self, id: &str) -> Arc<Entry> {
        if let Some(entry) = self.entry(id) {
            return entry;
        }
        let _creating = self.creation_lock.lock().await;
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(id, None, &self.cluster))
            .value()
            .clone()
    }

    /// Write-locks the entry currently registered under `id`.
    ///
    /// A placeholder can be dropped from the dictionary while a caller waits
    /// on its lock; the caller then retries against the live slot.
    pub(crate) async fn lock_for_write(&self, id: &str) -> (Arc<Entry>, WriteGuard) {
        loop {
            let entry = self.get_or_create_entry(id).await;
            let guard = entry.lock.write(self.cluster.now_ticks()).await;
            let current = self
                .entries
                .get(id)
                .map(|e| Arc::ptr_eq(e.value(), &entry))
                .unwrap_or(false);
            if current {
                return (entry, guard);
            }
        }
    }

    /// Drops `entry` if it is still an unused placeholder.
    pub(crate) fn discard_placeholder(&self, entry: &Arc<Entry>) {
        self.entries.remove_if(&entry.id, |_, current| {
            Arc::ptr_eq(current, entry)
                && current.file.lock().is_none()
                && current.requests.is_empty()
        });
    }

    pub(crate) fn read_record(&self, entry: &Entry) -> Result<Option<Record<V>>> {
        entry
            .file
            .lock()
            .as_ref()
            .map(|f| f.deserialize::<V>())
            .transpose()
    }

    /// Writes `bytes` as the entry's content, then updates indices and
    /// notifies subscribers. The caller holds `file`'s lock.
    pub(crate) fn store(
        &self,
        entry: &Entry,
        file: &mut Option<EntryFile>,
        record: &Record<V>,
        bytes: Vec<u8>,
        origin: ChangeOrigin,
    ) -> Result<()> {
        match file {
            Some(existing) => existing.set_bytes(bytes)?,
            None => *file = Some(EntryFile::create(&self.layout, &entry.id, bytes)?),
        }
        self.reindex(&entry.id, record);
        self.notify(&entry.id, record.timestamp, record.deleted, origin);
        Ok(())
    }

    pub(crate) fn reindex(&self, id: &str, record: &Record<V>) {
        let value = if record.deleted { None } else { record.value.as_ref() };
        for index in self.indices.write().values_mut() {
            index.update(id, value);
        }
    }

    pub(crate) fn unindex(&self, id: &str) {
        for index in self.indices.write().values_mut() {
            index.update(id, None);
        }
    }

    pub(crate) fn notify(&self, id: &str, timestamp: i64, deleted: bool, origin: ChangeOrigin) {
        // No receivers is fine.
        let _ = self.changes.send(TableChange {
            id: id.to_string(),
            timestamp,
            deleted,
            origin,
        });
    }
}

impl<V: TableValue> std::fmt::Debug for Table<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("root", &self.layout.root())
            .field("entries", &self.entries.len())
            .finish()
    }
}
