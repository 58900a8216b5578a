//! Synchronization & Maintenance
//!
//! ## Responsibilities
//! - **Last-writer-wins sync**: a peer's entry replaces the local one only
//!   when its timestamp is strictly greater.
//! - **Attachment transfer**: files referenced by an incoming entry are
//!   downloaded into the buffer before the entry is switched over.
//! - **Corruption sweep**: the three-way check of every entry, with a
//!   wholesale peer replacement when no two local copies agree.
//! - **Conservative deletion**: a tombstone is dropped only once every
//!   reachable peer reports the entry deleted or gone.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::files::{self, StagedFile, Staging};
use super::table::{ChangeOrigin, Entry, Table};
use crate::error::StoreError;
use crate::peer::PeerNode;
use crate::storage::Integrity;
use crate::value::{MinimalTableValue, Record, TableValue};

/// Counters of one [`Table::check_and_fix`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub checked: usize,
    pub repaired_locally: usize,
    pub repaired_from_peer: usize,
    pub unrecoverable: usize,
    pub synced: usize,
    pub tombstones_removed: usize,
    pub orphan_files_removed: usize,
    pub placeholders_dropped: usize,
}

impl MaintenanceReport {
    pub fn merge(&mut self, other: &MaintenanceReport) {
        self.checked += other.checked;
        self.repaired_locally += other.repaired_locally;
        self.repaired_from_peer += other.repaired_from_peer;
        self.unrecoverable += other.unrecoverable;
        self.synced += other.synced;
        self.tombstones_removed += other.tombstones_removed;
        self.orphan_files_removed += other.orphan_files_removed;
        self.placeholders_dropped += other.placeholders_dropped;
    }

    fn changed_anything(&self) -> bool {
        let idle = MaintenanceReport {
            checked: self.checked,
            ..Default::default()
        };
        *self != idle
    }
}

impl<V: TableValue> Table<V> {
    /// Full maintenance sweep: integrity, sync from every reachable peer,
    /// tombstone removal, orphan files and idle placeholders.
    pub async fn check_and_fix(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        self.check_integrity(&mut report).await?;

        let reachable = self.cluster.reachable_peers(&self.name);
        let mut states = Vec::with_capacity(reachable.len());
        for peer in &reachable {
            match peer.pull_state(&self.name, V::VERSION).await {
                Some(state) => {
                    report.synced += self.sync_from_state(peer, &state).await;
                    states.push(state);
                }
                None => tracing::debug!("No state of {} from {}", self.name, peer.host()),
            }
        }

        if states.len() == reachable.len() {
            report.tombstones_removed = self.remove_confirmed_tombstones(&states).await?;
        } else {
            tracing::debug!(
                "Keeping tombstones of {}: {} of {} reachable peers answered",
                self.name,
                states.len(),
                reachable.len()
            );
        }

        report.orphan_files_removed = self.purge_orphan_files().await?;
        report.placeholders_dropped = self.drop_idle_placeholders();

        if report.changed_anything() {
            tracing::info!("Maintenance of {}: {:?}", self.name, report);
        }
        Ok(report)
    }

    /// Pulls the peer's state and applies every newer entry.
    pub async fn sync_from(&self, peer: &Arc<PeerNode>) -> Result<usize> {
        let Some(state) = peer.pull_state(&self.name, V::VERSION).await else {
            return Ok(0);
        };
        let applied = self.sync_from_state(peer, &state).await;
        if applied > 0 {
            tracing::info!("Synced {} entries of {} from {}", applied, self.name, peer.host());
        }
        Ok(applied)
    }

    /// Applies the entries of `state` that are newer than the local copy.
    /// Entries at the same timestamp only get their missing files fetched.
    pub(crate) async fn sync_from_state(
        &self,
        peer: &Arc<PeerNode>,
        state: &BTreeMap<String, MinimalTableValue>,
    ) -> usize {
        let mut applied = 0;
        for (id, remote) in state {
            if let Some(local) = self.entry(id).and_then(|e| e.minimal()) {
                if remote.timestamp < local.timestamp {
                    continue;
                }
                if remote.timestamp == local.timestamp {
                    if !local.deleted {
                        self.fetch_missing_files(peer, id, &local).await;
                    }
                    continue;
                }
            }

            let Some(bytes) = peer.pull_entry(&self.name, V::VERSION, id).await else {
                continue;
            };
            let entry = self.get_or_create_entry(id).await;
            let origin = ChangeOrigin::Peer(peer.host().to_string());
            match self.install(Some(peer.as_ref()), &entry, bytes, false, origin).await {
                Ok(true) => applied += 1,
                Ok(false) => self.discard_placeholder(&entry),
                Err(e) => {
                    tracing::warn!("Entry {}/{} from {} rejected: {}", self.name, id, peer.host(), e);
                    self.discard_placeholder(&entry);
                }
            }
        }
        applied
    }

    /// Writes a peer's copy of an entry.
    ///
    /// Unless `force` is set the copy must be strictly newer than the local
    /// one, both before the attachments are downloaded and again right before
    /// the switch.
    pub(crate) async fn install(
        &self,
        peer: Option<&PeerNode>,
        entry: &Entry,
        bytes: Vec<u8>,
        force: bool,
        origin: ChangeOrigin,
    ) -> Result<bool> {
        let record = Record::<V>::from_bytes(&bytes)?;
        if record.id != entry.id {
            return Err(StoreError::InvalidId(record.id).into());
        }
        let newer = |local: Option<i64>| force || local.map(|t| record.timestamp > t).unwrap_or(true);
        if !newer(entry.timestamp()) {
            return Ok(false);
        }

        let local_files = entry.minimal().map(|m| m.files).unwrap_or_default();
        let mut staging = Staging::default();
        let mut stale = Vec::new();
        if !record.deleted {
            for (file_id, meta) in &record.files {
                let current = local_files
                    .get(file_id)
                    .map(|local| local.timestamp == meta.timestamp)
                    .unwrap_or(false)
                    && self.layout.file_path(&entry.id, file_id).exists();
                if current {
                    continue;
                }
                let staged = files::staging_path(&self.layout, &entry.id, file_id);
                let fetched = match peer {
                    Some(peer) => {
                        peer.pull_file(&self.name, V::VERSION, &entry.id, file_id, &staged)
                            .await
                    }
                    None => false,
                };
                if fetched {
                    staging.files.push(StagedFile {
                        file_id: file_id.clone(),
                        staged,
                        length: meta.length,
                    });
                } else {
                    tracing::warn!(
                        "File {}/{}/{} unavailable, it will be fetched on a later sync",
                        self.name,
                        entry.id,
                        file_id
                    );
                    stale.push(file_id.clone());
                }
            }
        }

        let mut file = entry.file.lock();
        let local = file.as_ref().and_then(|f| f.minimal().ok()).map(|m| m.timestamp);
        if !newer(local) {
            staging.discard();
            return Ok(false);
        }

        if record.deleted {
            files::purge(&self.layout, &entry.id)?;
        } else {
            files::move_into_place(&self.layout, &entry.id, staging.files)?;
            for file_id in &stale {
                crate::storage::entry_file::remove_if_exists(
                    &self.layout.file_path(&entry.id, file_id),
                )?;
            }
            files::remove_unreferenced(&self.layout, &entry.id, &record.files)?;
        }
        self.store(entry, &mut file, &record, bytes, origin)?;
        tracing::debug!("Installed {}/{} at {}", self.name, entry.id, record.timestamp);
        Ok(true)
    }

    /// Downloads attachments the entry references but the disk lacks.
    async fn fetch_missing_files(&self, peer: &PeerNode, id: &str, local: &MinimalTableValue) {
        let Some(entry) = self.entry(id) else { return };
        for (file_id, meta) in &local.files {
            if self.layout.file_path(id, file_id).exists() {
                continue;
            }
            let staged = files::staging_path(&self.layout, id, file_id);
            if !peer.pull_file(&self.name, V::VERSION, id, file_id, &staged).await {
                continue;
            }
            let staged = vec![StagedFile {
                file_id: file_id.clone(),
                staged,
                length: meta.length,
            }];
            let guard = entry.file.lock();
            let still_current = entry_file_timestamp(&guard, file_id) == Some(meta.timestamp);
            let outcome = if still_current {
                files::move_into_place(&self.layout, id, staged).map(|_| ())
            } else {
                Staging {
                    files: staged,
                    removals: Vec::new(),
                }
                .discard();
                Ok(())
            };
            match outcome {
                Ok(()) if still_current => {
                    tracing::info!("Fetched missing file {}/{}/{}", self.name, id, file_id)
                }
                Ok(()) => {}
                Err(e) => tracing::warn!("File {}/{}/{} not placed: {}", self.name, id, file_id, e),
            }
        }
    }

    async fn check_integrity(&self, report: &mut MaintenanceReport) -> Result<()> {
        for id in self.ids() {
            let Some(entry) = self.entry(&id) else { continue };
            let _write = entry.lock.write(self.cluster.now_ticks()).await;
            let outcome = {
                let mut file = entry.file.lock();
                match file.as_mut() {
                    Some(file) => file.check()?,
                    None => continue,
                }
            };
            report.checked += 1;
            match outcome {
                Integrity::Intact => {}
                Integrity::RepairedMemory => {
                    report.repaired_locally += 1;
                    if let Ok(Some(record)) = self.read_record(&entry) {
                        self.reindex(&id, &record);
                    }
                }
                Integrity::RepairedDisk | Integrity::RepairedHash => report.repaired_locally += 1,
                Integrity::Unrecoverable => {
                    if self.repair_from_peers(&entry).await? {
                        report.repaired_from_peer += 1;
                    } else {
                        report.unrecoverable += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replaces a corrupt entry with the first valid copy a peer hands out.
    /// The caller holds the entry's write lock.
    async fn repair_from_peers(&self, entry: &Entry) -> Result<bool> {
        if let Some(file) = entry.file.lock().as_ref() {
            file.quarantine()?;
        }

        for peer in self.cluster.connected_peers(&self.name) {
            let Some(bytes) = peer.pull_entry(&self.name, V::VERSION, &entry.id).await else {
                continue;
            };
            match self
                .install(Some(peer.as_ref()), entry, bytes, true, ChangeOrigin::Maintenance)
                .await
            {
                Ok(true) => {
                    if let Some(file) = entry.file.lock().as_ref() {
                        file.release_quarantine()?;
                    }
                    tracing::warn!(
                        "Entry {}/{} was corrupt and has been replaced from {}",
                        self.name,
                        entry.id,
                        peer.host()
                    );
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    "Copy of {}/{} from {} unusable: {}",
                    self.name,
                    entry.id,
                    peer.host(),
                    e
                ),
            }
        }

        if let Some(file) = entry.file.lock().as_ref() {
            file.release_quarantine()?;
        }
        tracing::error!(
            "VERY IMPORTANT: entry {}/{} is corrupt and could not be fixed. Restore it from a backup.",
            self.name,
            entry.id
        );
        Ok(false)
    }

    async fn remove_confirmed_tombstones(
        &self,
        states: &[BTreeMap<String, MinimalTableValue>],
    ) -> Result<usize> {
        let mut removed = 0;
        for id in self.ids() {
            let Some(entry) = self.entry(&id) else { continue };
            let Some(local) = entry.minimal() else { continue };
            if !local.deleted {
                continue;
            }
            let confirmed = states
                .iter()
                .all(|state| state.get(&id).map(|remote| remote.deleted).unwrap_or(true));
            if !confirmed {
                continue;
            }

            let _write = entry.lock.write(self.cluster.now_ticks()).await;
            if !entry.requests.is_empty() {
                continue;
            }
            {
                let mut file = entry.file.lock();
                let unchanged = file
                    .as_ref()
                    .and_then(|f| f.minimal().ok())
                    .map(|m| m.deleted && m.timestamp == local.timestamp)
                    .unwrap_or(false);
                if !unchanged {
                    continue;
                }
                if let Some(file) = file.take() {
                    file.remove()?;
                }
                files::purge(&self.layout, &id)?;
            }
            self.entries.remove_if(&id, |_, current| Arc::ptr_eq(current, &entry));
            self.unindex(&id);
            self.notify(&id, local.timestamp, true, ChangeOrigin::Maintenance);
            removed += 1;
        }
        Ok(removed)
    }

    /// Removes attachment directories without a live entry and files the
    /// entry no longer references.
    async fn purge_orphan_files(&self) -> Result<usize> {
        let mut removed = 0;
        for owner in self.layout.list_file_owner_ids()? {
            let entry = self.get_or_create_entry(&owner).await;
            {
                let file = entry.file.lock();
                match file.as_ref().and_then(|f| f.minimal().ok()) {
                    Some(m) if !m.deleted => {
                        removed += files::remove_unreferenced(&self.layout, &owner, &m.files)?;
                    }
                    _ => {
                        removed += self.layout.list_file_ids(&owner)?.len();
                        crate::storage::entry_file::remove_dir_if_exists(
                            &self.layout.file_dir(&owner),
                        )?;
                    }
                }
            }
            self.discard_placeholder(&entry);
        }
        Ok(removed)
    }

    fn drop_idle_placeholders(&self) -> usize {
        let mut dropped = 0;
        for id in self.ids() {
            let removed = self.entries.remove_if(&id, |_, entry| {
                entry.file.lock().is_none()
                    && entry.requests.is_empty()
                    && !entry.lock.is_write_locked()
                    && entry.lock.reader_count() == 0
                    && entry.lock.waiting_count() == 0
            });
            if removed.is_some() {
                dropped += 1;
            }
        }
        dropped
    }
}

fn entry_file_timestamp(
    file: &Option<crate::storage::EntryFile>,
    file_id: &str,
) -> Option<i64> {
    file.as_ref()
        .and_then(|f| f.minimal().ok())
        .and_then(|m| m.file_timestamp(file_id))
}
