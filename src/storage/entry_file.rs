//! Durable storage of one entry's serialized bytes.
//!
//! Writes go through the buffer directory: the new bytes are written and
//! synced to `Buffer/Entries/<id>.json`, the old canonical file is removed,
//! then the buffer file is renamed into `Entries/`. A crash at any point
//! leaves either the old canonical file or a complete buffer copy, which
//! [`recover`] promotes on the next start.
//!
//! Each entry keeps three copies that can be compared: the in-memory bytes,
//! the hash recorded when those bytes were set, and the file on disk.

use anyhow::Result;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::Path;

use super::hash::ContentHash;
use super::layout::{EntryPaths, TableLayout};
use crate::error::StoreError;
use crate::value::{MinimalTableValue, Record};

/// Outcome of the three-way corruption check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Intact,
    /// Memory and hash agreed; the disk file was rewritten.
    RepairedDisk,
    /// Disk and hash agreed; memory was reloaded.
    RepairedMemory,
    /// Memory and disk agreed; the recorded hash was recomputed.
    RepairedHash,
    /// No two copies agree, or the agreeing copy does not parse.
    Unrecoverable,
}

pub struct EntryFile {
    id: String,
    paths: EntryPaths,
    bytes: Vec<u8>,
    hash: ContentHash,
}

impl std::fmt::Debug for EntryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryFile")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .field("hash", &self.hash)
            .finish()
    }
}

impl EntryFile {
    /// Loads the committed file for `id`, if there is one.
    pub fn load(layout: &TableLayout, id: &str) -> Result<Option<Self>> {
        let paths = layout.entry_paths(id);
        let bytes = match std::fs::read(&paths.canonical) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = MinimalTableValue::from_bytes(&bytes) {
            tracing::warn!("Entry {} loaded with unreadable content: {}", id, e);
        }
        let hash = ContentHash::of(&bytes);
        Ok(Some(Self {
            id: id.to_string(),
            paths,
            bytes,
            hash,
        }))
    }

    /// Persists a brand-new entry.
    pub fn create(layout: &TableLayout, id: &str, bytes: Vec<u8>) -> Result<Self> {
        validate(id, &bytes)?;
        let paths = layout.entry_paths(id);
        write_through(&paths, &bytes)?;
        let hash = ContentHash::of(&bytes);
        Ok(Self {
            id: id.to_string(),
            paths,
            bytes,
            hash,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn paths(&self) -> &EntryPaths {
        &self.paths
    }

    /// Replaces the entry's bytes, on disk first and then in memory.
    pub fn set_bytes(&mut self, bytes: Vec<u8>) -> Result<()> {
        validate(&self.id, &bytes)?;
        write_through(&self.paths, &bytes)?;
        self.hash = ContentHash::of(&bytes);
        self.bytes = bytes;
        Ok(())
    }

    pub fn minimal(&self) -> Result<MinimalTableValue> {
        MinimalTableValue::from_bytes(&self.bytes)
    }

    pub fn deserialize<V: DeserializeOwned>(&self) -> Result<Record<V>> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    /// Compares memory, recorded hash and disk, repairing whichever copy is
    /// the odd one out.
    pub fn check(&mut self) -> Result<Integrity> {
        let disk = match std::fs::read(&self.paths.canonical) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let memory_ok = ContentHash::of(&self.bytes) == self.hash;
        let disk_ok = disk
            .as_deref()
            .map(|d| ContentHash::of(d) == self.hash)
            .unwrap_or(false);
        let disk_matches_memory = disk.as_deref() == Some(self.bytes.as_slice());

        let outcome = match (memory_ok, disk_ok, disk_matches_memory) {
            (true, true, _) => Integrity::Intact,
            (true, false, _) => {
                tracing::warn!("Entry {}: disk copy corrupt, rewriting from memory", self.id);
                write_through(&self.paths, &self.bytes)?;
                Integrity::RepairedDisk
            }
            (false, true, _) => {
                tracing::warn!("Entry {}: memory copy corrupt, reloading from disk", self.id);
                if let Some(disk) = disk {
                    self.bytes = disk;
                }
                Integrity::RepairedMemory
            }
            (false, false, true) => {
                tracing::warn!("Entry {}: recorded hash corrupt, recomputing", self.id);
                self.hash = ContentHash::of(&self.bytes);
                Integrity::RepairedHash
            }
            (false, false, false) => return Ok(Integrity::Unrecoverable),
        };

        if let Err(e) = validate(&self.id, &self.bytes) {
            tracing::warn!("Entry {}: agreeing copy is unreadable: {}", self.id, e);
            return Ok(Integrity::Unrecoverable);
        }
        Ok(outcome)
    }

    /// Moves the disk copy to `Trash/Entries/` while a replacement is fetched.
    pub fn quarantine(&self) -> Result<()> {
        if self.paths.canonical.exists() {
            std::fs::rename(&self.paths.canonical, &self.paths.trash)?;
        }
        Ok(())
    }

    /// Undoes [`quarantine`](Self::quarantine) when no replacement was written,
    /// otherwise drops the quarantined copy.
    pub fn release_quarantine(&self) -> Result<()> {
        if !self.paths.trash.exists() {
            return Ok(());
        }
        if self.paths.canonical.exists() {
            std::fs::remove_file(&self.paths.trash)?;
        } else {
            std::fs::rename(&self.paths.trash, &self.paths.canonical)?;
        }
        Ok(())
    }

    /// Physically removes every copy of the entry.
    pub fn remove(self) -> Result<()> {
        for path in [&self.paths.canonical, &self.paths.buffer, &self.paths.trash] {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn overwrite_memory(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    #[cfg(test)]
    pub(crate) fn overwrite_hash(&mut self, bytes: &[u8]) {
        self.hash = ContentHash::of(bytes);
    }
}

fn validate(id: &str, bytes: &[u8]) -> Result<MinimalTableValue> {
    let minimal = MinimalTableValue::from_bytes(bytes)?;
    if minimal.id != id {
        return Err(StoreError::InvalidId(minimal.id).into());
    }
    if minimal.timestamp < 0 {
        anyhow::bail!("Entry {} has negative timestamp {}", id, minimal.timestamp);
    }
    Ok(minimal)
}

fn write_through(paths: &EntryPaths, bytes: &[u8]) -> Result<()> {
    write_synced(&paths.buffer, bytes)?;
    remove_if_exists(&paths.canonical)?;
    std::fs::rename(&paths.buffer, &paths.canonical)?;
    Ok(())
}

pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// What [`recover`] did with leftovers from a previous run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub promoted_buffers: usize,
    pub discarded_buffers: usize,
    pub restored_from_trash: usize,
    pub discarded_trash: usize,
}

/// Cleans up staging and quarantine directories before a table loads.
///
/// A buffered entry is only promoted when the canonical file is gone (the
/// crash happened between delete and rename) and the buffer parses; any other
/// buffer is an unconfirmed write and is dropped. Quarantined copies come back
/// when nothing replaced them.
pub fn recover(layout: &TableLayout) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for item in std::fs::read_dir(layout.buffer_entries_dir())? {
        let path = item?.path();
        let Some(name) = path.file_name() else { continue };
        let canonical = layout.entries_dir().join(name);
        let complete = std::fs::read(&path)
            .ok()
            .map(|bytes| MinimalTableValue::from_bytes(&bytes).is_ok())
            .unwrap_or(false);
        if !canonical.exists() && complete {
            std::fs::rename(&path, &canonical)?;
            report.promoted_buffers += 1;
        } else {
            remove_if_exists(&path)?;
            report.discarded_buffers += 1;
        }
    }

    for item in std::fs::read_dir(layout.trash_entries_dir())? {
        let path = item?.path();
        let Some(name) = path.file_name() else { continue };
        let canonical = layout.entries_dir().join(name);
        if canonical.exists() {
            remove_if_exists(&path)?;
            report.discarded_trash += 1;
        } else {
            std::fs::rename(&path, &canonical)?;
            report.restored_from_trash += 1;
        }
    }

    for item in std::fs::read_dir(layout.buffer_files_dir())? {
        remove_dir_if_exists(&item?.path())?;
    }

    for owner in std::fs::read_dir(layout.trash_files_dir())? {
        let owner = owner?.path();
        let Some(owner_name) = owner.file_name() else { continue };
        let target_dir = layout.files_dir().join(owner_name);
        std::fs::create_dir_all(&target_dir)?;
        for file in std::fs::read_dir(&owner)? {
            let file = file?.path();
            let Some(file_name) = file.file_name() else { continue };
            let target = target_dir.join(file_name);
            if target.exists() {
                remove_if_exists(&file)?;
            } else {
                std::fs::rename(&file, &target)?;
            }
        }
        remove_dir_if_exists(&owner)?;
    }

    if report != RecoveryReport::default() {
        tracing::info!(
            "Recovered {}: promoted={} discarded_buffers={} restored_trash={} discarded_trash={}",
            layout.root().display(),
            report.promoted_buffers,
            report.discarded_buffers,
            report.restored_from_trash,
            report.discarded_trash
        );
    }
    Ok(report)
}
