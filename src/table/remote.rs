//! Peer-facing side of a table.
//!
//! [`ClusterTable`] erases the payload type so the registry and the HTTP
//! handlers can hold every table in one directory. It carries what peers ask
//! of a table (state, entries, files, lock claims, pushed changes) plus the
//! raw operations backup and restore need.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::files::{self, StagedFile};
use super::sync::MaintenanceReport;
use super::table::{ChangeOrigin, Entry, Table};
use crate::locking::LockKey;
use crate::peer::PeerNode;
use crate::storage::entry_file::remove_if_exists;
use crate::value::{MinimalTableValue, Record, TableValue};

#[async_trait]
pub trait ClusterTable: Send + Sync {
    fn table_name(&self) -> &str;

    /// Lowest schema version a reader must accept.
    fn required_version(&self) -> u32;

    /// Schema version of the payload type compiled into this process.
    fn type_version(&self) -> u32;

    /// Minimal projection of every stored entry, tombstones included.
    fn state(&self) -> BTreeMap<String, MinimalTableValue>;

    fn entry_bytes(&self, id: &str) -> Option<Vec<u8>>;

    fn committed_file(&self, id: &str, file_id: &str) -> Option<PathBuf>;

    /// Registers a peer's claim and returns every claim known here.
    async fn receive_lock(&self, id: &str, key: LockKey) -> Vec<LockKey>;

    async fn receive_cancel(&self, id: &str, key: &LockKey);

    /// Applies a pushed change and finishes the claim that produced it.
    async fn receive_change(
        &self,
        from: Option<Arc<PeerNode>>,
        id: &str,
        key: &LockKey,
        bytes: Vec<u8>,
    ) -> Result<bool>;

    async fn sync_with(&self, peer: &Arc<PeerNode>) -> Result<usize>;

    async fn maintain(&self) -> Result<MaintenanceReport>;

    /// Overwrites an entry with backed-up bytes, bypassing timestamps.
    async fn restore_entry(&self, id: &str, bytes: Vec<u8>) -> Result<()>;

    /// Copies a backed-up attachment into place.
    async fn restore_file(&self, id: &str, file_id: &str, source: &Path) -> Result<()>;

    /// Physically removes an entry that a backup does not contain.
    async fn purge_entry(&self, id: &str) -> Result<()>;

    /// Physically removes an attachment that a backup does not contain.
    async fn purge_file(&self, id: &str, file_id: &str) -> Result<()>;

    async fn wait_for_pushes(&self);
}

impl<V: TableValue> Table<V> {
    /// Finds the live slot for `id` and registers `key` on it.
    async fn register_claim(&self, id: &str, key: LockKey) -> Arc<Entry> {
        loop {
            let entry = self.get_or_create_entry(id).await;
            entry.requests.register_remote(key.clone());
            let live = self
                .entries
                .get(id)
                .map(|e| Arc::ptr_eq(e.value(), &entry))
                .unwrap_or(false);
            if live {
                return entry;
            }
        }
    }
}

#[async_trait]
impl<V: TableValue> ClusterTable for Table<V> {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn required_version(&self) -> u32 {
        self.min_version
    }

    fn type_version(&self) -> u32 {
        V::VERSION
    }

    fn state(&self) -> BTreeMap<String, MinimalTableValue> {
        self.entries
            .iter()
            .filter_map(|item| item.minimal().map(|m| (item.key().clone(), m)))
            .collect()
    }

    fn entry_bytes(&self, id: &str) -> Option<Vec<u8>> {
        let entry = self.entry(id)?;
        let file = entry.file.lock();
        file.as_ref().map(|f| f.bytes().to_vec())
    }

    fn committed_file(&self, id: &str, file_id: &str) -> Option<PathBuf> {
        let entry = self.entry(id)?;
        let minimal = entry.minimal()?;
        if minimal.deleted || !minimal.files.contains_key(file_id) {
            return None;
        }
        self.file_path(id, file_id)
    }

    async fn receive_lock(&self, id: &str, key: LockKey) -> Vec<LockKey> {
        tracing::debug!("Lock {} on {}/{} announced by a peer", key, self.name, id);
        let entry = self.register_claim(id, key).await;
        entry.requests.outstanding()
    }

    async fn receive_cancel(&self, id: &str, key: &LockKey) {
        let Some(entry) = self.entry(id) else { return };
        entry.requests.delete(key);
        self.discard_placeholder(&entry);
    }

    async fn receive_change(
        &self,
        from: Option<Arc<PeerNode>>,
        id: &str,
        key: &LockKey,
        bytes: Vec<u8>,
    ) -> Result<bool> {
        let entry = self.get_or_create_entry(id).await;
        let host = from.as_ref().map(|p| p.host().to_string()).unwrap_or_default();
        let result = self
            .install(from.as_deref(), &entry, bytes, false, ChangeOrigin::Peer(host))
            .await;
        entry.requests.set_finished(key);
        if !matches!(result, Ok(true)) {
            self.discard_placeholder(&entry);
        }
        result
    }

    async fn sync_with(&self, peer: &Arc<PeerNode>) -> Result<usize> {
        self.sync_from(peer).await
    }

    async fn maintain(&self) -> Result<MaintenanceReport> {
        self.check_and_fix().await
    }

    async fn restore_entry(&self, id: &str, bytes: Vec<u8>) -> Result<()> {
        let record = Record::<V>::from_bytes(&bytes)?;
        let (entry, _write) = self.lock_for_write(id).await;
        let mut file = entry.file.lock();
        if record.deleted {
            files::purge(&self.layout, id)?;
        } else {
            files::remove_unreferenced(&self.layout, id, &record.files)?;
        }
        self.store(&entry, &mut file, &record, bytes, ChangeOrigin::Restore)
    }

    async fn restore_file(&self, id: &str, file_id: &str, source: &Path) -> Result<()> {
        let (entry, _write) = self.lock_for_write(id).await;
        let staged = files::staging_path(&self.layout, id, file_id);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let length = std::fs::copy(source, &staged)?;
        let placed = {
            let _file = entry.file.lock();
            files::move_into_place(
                &self.layout,
                id,
                vec![StagedFile {
                    file_id: file_id.to_string(),
                    staged,
                    length,
                }],
            )
        };
        self.discard_placeholder(&entry);
        placed.map(|_| ())
    }

    async fn purge_entry(&self, id: &str) -> Result<()> {
        let (entry, _write) = self.lock_for_write(id).await;
        let timestamp = {
            let mut file = entry.file.lock();
            let timestamp = file.as_ref().and_then(|f| f.minimal().ok()).map(|m| m.timestamp);
            if let Some(file) = file.take() {
                file.remove()?;
            }
            files::purge(&self.layout, id)?;
            timestamp
        };
        self.entries.remove_if(id, |_, current| Arc::ptr_eq(current, &entry));
        self.unindex(id);
        if let Some(timestamp) = timestamp {
            self.notify(id, timestamp, true, ChangeOrigin::Restore);
        }
        Ok(())
    }

    async fn purge_file(&self, id: &str, file_id: &str) -> Result<()> {
        let (entry, _write) = self.lock_for_write(id).await;
        let removed = {
            let _file = entry.file.lock();
            remove_if_exists(&self.layout.file_path(id, file_id))
        };
        self.discard_placeholder(&entry);
        removed
    }

    async fn wait_for_pushes(&self) {
        self.flush_pushes().await;
    }
}
