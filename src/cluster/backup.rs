//! Incremental Backups
//!
//! ## Layout
//! ```text
//! <backup root>/
//!   state.json                      manifest of the latest backup
//!   increments/<000001>/
//!     manifest.json                 full manifest as of this increment
//!     <table>/Entries/<id>.json     entries changed since the previous one
//!     <table>/Files/<id>/<file>     attachments changed since the previous one
//! ```
//!
//! Every manifest lists all entries and files with the increment that holds
//! their bytes, so any increment can be restored on its own root.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::encode_id;
use crate::storage::entry_file::write_synced;
use crate::table::ClusterTable;
use crate::value::MinimalTableValue;

pub const STATE_FILE: &str = "state.json";
pub const INCREMENTS_DIR: &str = "increments";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub increment: String,
    pub created_ms: u64,
    /// table -> entry ID -> entry
    pub tables: BTreeMap<String, BTreeMap<String, BackedUpEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpEntry {
    pub timestamp: i64,
    pub deleted: bool,
    /// Increment holding the entry bytes.
    pub stored_in: String,
    #[serde(default)]
    pub files: BTreeMap<String, BackedUpFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpFile {
    pub timestamp: i64,
    pub stored_in: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub increment: String,
    pub entries_total: usize,
    pub entries_copied: usize,
    pub files_copied: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub increment: String,
    pub entries_restored: usize,
    pub entries_unchanged: usize,
    pub entries_removed: usize,
    pub files_restored: usize,
    pub files_removed: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn increment_dir(root: &Path, increment: &str) -> PathBuf {
    root.join(INCREMENTS_DIR).join(increment)
}

fn entry_path(root: &Path, increment: &str, table: &str, id: &str) -> PathBuf {
    increment_dir(root, increment)
        .join(encode_id(table))
        .join("Entries")
        .join(format!("{}.json", encode_id(id)))
}

fn file_path(root: &Path, increment: &str, table: &str, id: &str, file_id: &str) -> PathBuf {
    increment_dir(root, increment)
        .join(encode_id(table))
        .join("Files")
        .join(encode_id(id))
        .join(encode_id(file_id))
}

pub fn load_manifest(path: &Path) -> Result<Option<BackupManifest>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Increment names are zero-padded sequence numbers so they sort by age.
pub fn list_increments(root: &Path) -> Result<Vec<String>> {
    let dir = root.join(INCREMENTS_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        if let Some(name) = item.file_name().to_str()
            && name.parse::<u64>().is_ok()
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn next_increment(root: &Path) -> Result<String> {
    let last = list_increments(root)?
        .last()
        .and_then(|name| name.parse::<u64>().ok())
        .unwrap_or(0);
    Ok(format!("{:06}", last + 1))
}

/// Copies every entry and attachment that changed since the last backup into
/// a new increment. Blocking; run it off the async workers.
pub fn backup_tables(tables: &[Arc<dyn ClusterTable>], root: &Path) -> Result<BackupReport> {
    let previous = load_manifest(&root.join(STATE_FILE))?.unwrap_or_default();
    let increment = next_increment(root)?;
    std::fs::create_dir_all(increment_dir(root, &increment))?;

    let mut manifest = BackupManifest {
        increment: increment.clone(),
        created_ms: now_ms(),
        tables: BTreeMap::new(),
    };
    let mut report = BackupReport {
        increment: increment.clone(),
        ..Default::default()
    };

    for table in tables {
        let name = table.table_name();
        let before = previous.tables.get(name);
        let mut entries = BTreeMap::new();

        for id in table.state().into_keys() {
            let Some(bytes) = table.entry_bytes(&id) else { continue };
            let minimal = match MinimalTableValue::from_bytes(&bytes) {
                Ok(minimal) => minimal,
                Err(e) => {
                    tracing::warn!("Backup skips unreadable entry {}/{}: {}", name, id, e);
                    continue;
                }
            };
            let prior = before.and_then(|entries| entries.get(&id));

            let stored_in = match prior {
                Some(p) if p.timestamp == minimal.timestamp && p.deleted == minimal.deleted => {
                    p.stored_in.clone()
                }
                _ => {
                    write_synced(&entry_path(root, &increment, name, &id), &bytes)?;
                    report.entries_copied += 1;
                    increment.clone()
                }
            };

            let mut files = BTreeMap::new();
            for (file_id, meta) in minimal.files.iter().filter(|_| !minimal.deleted) {
                let prior_file = prior.and_then(|p| p.files.get(file_id));
                let stored_in = match prior_file {
                    Some(f) if f.timestamp == meta.timestamp => f.stored_in.clone(),
                    _ => {
                        let Some(source) = table.committed_file(&id, file_id) else {
                            tracing::warn!("Backup skips missing file {}/{}/{}", name, id, file_id);
                            continue;
                        };
                        let target = file_path(root, &increment, name, &id, file_id);
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::copy(&source, &target)?;
                        report.files_copied += 1;
                        increment.clone()
                    }
                };
                files.insert(
                    file_id.clone(),
                    BackedUpFile {
                        timestamp: meta.timestamp,
                        stored_in,
                    },
                );
            }

            entries.insert(
                id,
                BackedUpEntry {
                    timestamp: minimal.timestamp,
                    deleted: minimal.deleted,
                    stored_in,
                    files,
                },
            );
            report.entries_total += 1;
        }
        manifest.tables.insert(name.to_string(), entries);
    }

    let json = serde_json::to_vec_pretty(&manifest)?;
    write_synced(&increment_dir(root, &increment).join(MANIFEST_FILE), &json)?;
    let staged_state = root.join(format!("{}.tmp", STATE_FILE));
    write_synced(&staged_state, &json)?;
    std::fs::rename(&staged_state, root.join(STATE_FILE))?;

    tracing::info!(
        "Backup increment {}: {} entries, {} copied, {} files copied",
        increment,
        report.entries_total,
        report.entries_copied,
        report.files_copied
    );
    Ok(report)
}

/// Makes the live tables match a backup manifest: changed entries and files
/// are copied back, entries and files the manifest lacks are removed.
/// Nothing is pushed to peers; see [`ClusterRegistry::restore_all`](crate::cluster::ClusterRegistry::restore_all).
pub async fn restore_tables(
    tables: &[Arc<dyn ClusterTable>],
    root: &Path,
    increment: Option<&str>,
) -> Result<RestoreReport> {
    let manifest_path = match increment {
        Some(name) => increment_dir(root, name).join(MANIFEST_FILE),
        None => root.join(STATE_FILE),
    };
    let manifest = load_manifest(&manifest_path)?
        .ok_or_else(|| anyhow::anyhow!("No backup manifest at {}", manifest_path.display()))?;
    tracing::info!("Restoring backup increment {}", manifest.increment);

    let mut report = RestoreReport {
        increment: manifest.increment.clone(),
        ..Default::default()
    };

    for table in tables {
        let name = table.table_name();
        let Some(entries) = manifest.tables.get(name) else {
            tracing::warn!("Backup {} has no table {}, left untouched", manifest.increment, name);
            continue;
        };
        let live = table.state();

        for (id, backed) in entries {
            let current = live.get(id);

            for (file_id, file) in &backed.files {
                let present = current.and_then(|c| c.file_timestamp(file_id)) == Some(file.timestamp)
                    && table.committed_file(id, file_id).is_some();
                if !present {
                    let source = file_path(root, &file.stored_in, name, id, file_id);
                    table.restore_file(id, file_id, &source).await?;
                    report.files_restored += 1;
                }
            }

            let unchanged = current
                .map(|c| c.timestamp == backed.timestamp && c.deleted == backed.deleted)
                .unwrap_or(false);
            if unchanged {
                report.entries_unchanged += 1;
            } else {
                let bytes = std::fs::read(entry_path(root, &backed.stored_in, name, id))?;
                table.restore_entry(id, bytes).await?;
                report.entries_restored += 1;
            }

            if let Some(current) = current {
                for file_id in current.files.keys() {
                    if !backed.files.contains_key(file_id) {
                        table.purge_file(id, file_id).await?;
                        report.files_removed += 1;
                    }
                }
            }
        }

        for id in live.keys() {
            if !entries.contains_key(id) {
                table.purge_entry(id).await?;
                report.entries_removed += 1;
            }
        }
    }

    tracing::info!("Restore finished: {:?}", report);
    Ok(report)
}
