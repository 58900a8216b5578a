//! Attachment storage.
//!
//! New attachment bytes are staged under `Buffer/Files/<id>/` with a unique
//! suffix, then renamed into `Files/<id>/` once every staged write succeeded.
//! Staging names carry a `.` which [`encode_id`](crate::storage::encode_id)
//! never emits, so they cannot collide with committed files.

use anyhow::Result;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::storage::entry_file::{remove_dir_if_exists, remove_if_exists, write_synced};
use crate::storage::{TableLayout, encode_id};
use crate::value::FileMeta;

/// A file operation queued by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    Put { file_id: String, bytes: Vec<u8> },
    Remove { file_id: String },
}

/// A staged attachment waiting to be committed.
#[derive(Debug)]
pub struct StagedFile {
    pub file_id: String,
    pub staged: PathBuf,
    pub length: u64,
}

/// Files staged for one entry. Dropping without [`commit`] discards them.
#[derive(Debug, Default)]
pub struct Staging {
    pub files: Vec<StagedFile>,
    pub removals: Vec<String>,
}

impl Staging {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.removals.is_empty()
    }

    /// Forgets an earlier staged write of `file_id` that a later action
    /// superseded.
    fn drop_staged(&mut self, file_id: &str) {
        let (superseded, kept): (Vec<StagedFile>, Vec<StagedFile>) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|f| f.file_id == file_id);
        self.files = kept;
        Staging {
            files: superseded,
            removals: Vec::new(),
        }
        .discard();
    }

    /// Removes every staged file that was not committed.
    pub fn discard(self) {
        for file in self.files {
            if let Err(e) = remove_if_exists(&file.staged) {
                tracing::warn!("Could not drop staged file {}: {}", file.staged.display(), e);
            }
        }
    }
}

pub fn staging_path(layout: &TableLayout, id: &str, file_id: &str) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    layout
        .buffer_file_dir(id)
        .join(format!("{}.{}", encode_id(file_id), suffix))
}

/// Phase one: writes every queued `Put` into the buffer directory.
pub fn prepare(layout: &TableLayout, id: &str, actions: &[FileAction]) -> Result<Staging> {
    let mut staging = Staging::default();
    for action in actions {
        match action {
            FileAction::Put { file_id, bytes } => {
                let staged = staging_path(layout, id, file_id);
                if let Err(e) = write_synced(&staged, bytes) {
                    staging.discard();
                    return Err(e);
                }
                staging.drop_staged(file_id);
                staging.files.push(StagedFile {
                    file_id: file_id.clone(),
                    staged,
                    length: bytes.len() as u64,
                });
                staging.removals.retain(|r| r != file_id);
            }
            FileAction::Remove { file_id } => {
                staging.drop_staged(file_id);
                staging.removals.push(file_id.clone());
            }
        }
    }
    Ok(staging)
}

/// Attachments moved into place by [`commit`] for an entry that is not
/// written yet.
#[derive(Debug, Default)]
#[must_use]
pub struct Placed {
    /// IDs the entry did not reference before the transaction.
    added: Vec<String>,
    /// IDs to delete once the entry is written.
    removals: Vec<String>,
}

impl Placed {
    /// Deletes the attachments the transaction removed. Call after the entry
    /// is written.
    pub fn finish(self, layout: &TableLayout, id: &str) -> Result<()> {
        for file_id in &self.removals {
            remove_if_exists(&layout.file_path(id, file_id))?;
        }
        Ok(())
    }

    /// Takes back newly added attachments after the entry failed to write.
    pub fn roll_back(self, layout: &TableLayout, id: &str) {
        for file_id in &self.added {
            if let Err(e) = remove_if_exists(&layout.file_path(id, file_id)) {
                tracing::warn!("Could not take back attachment {}/{}: {}", id, file_id, e);
            }
        }
    }
}

/// Phase two: moves staged files into place and records them in `files`.
/// Removed attachments stay on disk until [`Placed::finish`].
pub fn commit(
    layout: &TableLayout,
    id: &str,
    staging: Staging,
    files: &mut BTreeMap<String, FileMeta>,
    timestamp: i64,
) -> Result<Placed> {
    let mut placed = Placed::default();
    if staging.is_empty() {
        return Ok(placed);
    }
    let known: Vec<String> = files.keys().cloned().collect();
    for file_id in &staging.removals {
        files.remove(file_id);
    }
    placed.removals = staging.removals;
    for (file_id, length) in move_into_place(layout, id, staging.files)? {
        if !known.contains(&file_id) {
            placed.added.push(file_id.clone());
        }
        files.insert(file_id, FileMeta { timestamp, length });
    }
    Ok(placed)
}

/// Renames staged files into `Files/<id>/`, returning each file's ID and
/// length.
pub fn move_into_place(
    layout: &TableLayout,
    id: &str,
    staged: Vec<StagedFile>,
) -> Result<Vec<(String, u64)>> {
    if staged.is_empty() {
        return Ok(Vec::new());
    }
    std::fs::create_dir_all(layout.file_dir(id))?;
    let mut placed = Vec::with_capacity(staged.len());
    for file in staged {
        std::fs::rename(&file.staged, layout.file_path(id, &file.file_id))?;
        placed.push((file.file_id, file.length));
    }
    Ok(placed)
}

/// Removes every committed and staged attachment of an entry.
pub fn purge(layout: &TableLayout, id: &str) -> Result<()> {
    remove_dir_if_exists(&layout.file_dir(id))?;
    remove_dir_if_exists(&layout.buffer_file_dir(id))?;
    remove_dir_if_exists(&layout.trash_file_dir(id))?;
    Ok(())
}

/// Removes committed files that `files` no longer references.
pub fn remove_unreferenced(
    layout: &TableLayout,
    id: &str,
    files: &BTreeMap<String, FileMeta>,
) -> Result<usize> {
    let mut removed = 0;
    for file_id in layout.list_file_ids(id)? {
        if !files.contains_key(&file_id) {
            remove_if_exists(&layout.file_path(id, &file_id))?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn read(layout: &TableLayout, id: &str, file_id: &str) -> Result<Option<Vec<u8>>> {
    match std::fs::read(layout.file_path(id, file_id)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
