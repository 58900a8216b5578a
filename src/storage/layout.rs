//! On-disk layout of one table.
//!
//! ```text
//! <root>/Entries/<id>.json          committed entries
//! <root>/Buffer/Entries/<id>.json   staged writes
//! <root>/Trash/Entries/<id>.json    quarantined copies
//! <root>/Files/<id>/<file>          committed attachments
//! <root>/Buffer/Files/<id>/<file>   staged attachments
//! <root>/Trash/Files/<id>/<file>    quarantined attachments
//! ```
//!
//! IDs are encoded with [`encode_id`] before they touch the filesystem.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

const ENTRY_EXTENSION: &str = "json";
const ESCAPE: char = '~';

#[derive(Debug, Clone)]
pub struct TableLayout {
    root: PathBuf,
}

impl TableLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries_dir(&self) -> PathBuf {
        self.root.join("Entries")
    }

    pub fn buffer_entries_dir(&self) -> PathBuf {
        self.root.join("Buffer").join("Entries")
    }

    pub fn trash_entries_dir(&self) -> PathBuf {
        self.root.join("Trash").join("Entries")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("Files")
    }

    pub fn buffer_files_dir(&self) -> PathBuf {
        self.root.join("Buffer").join("Files")
    }

    pub fn trash_files_dir(&self) -> PathBuf {
        self.root.join("Trash").join("Files")
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.entries_dir(),
            self.buffer_entries_dir(),
            self.trash_entries_dir(),
            self.files_dir(),
            self.buffer_files_dir(),
            self.trash_files_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn entry_paths(&self, id: &str) -> EntryPaths {
        let name = format!("{}.{}", encode_id(id), ENTRY_EXTENSION);
        EntryPaths {
            canonical: self.entries_dir().join(&name),
            buffer: self.buffer_entries_dir().join(&name),
            trash: self.trash_entries_dir().join(&name),
        }
    }

    pub fn file_dir(&self, id: &str) -> PathBuf {
        self.files_dir().join(encode_id(id))
    }

    pub fn buffer_file_dir(&self, id: &str) -> PathBuf {
        self.buffer_files_dir().join(encode_id(id))
    }

    pub fn trash_file_dir(&self, id: &str) -> PathBuf {
        self.trash_files_dir().join(encode_id(id))
    }

    pub fn file_path(&self, id: &str, file_id: &str) -> PathBuf {
        self.file_dir(id).join(encode_id(file_id))
    }

    pub fn buffer_file_path(&self, id: &str, file_id: &str) -> PathBuf {
        self.buffer_file_dir(id).join(encode_id(file_id))
    }

    /// IDs of every committed entry file, decoded.
    pub fn list_entry_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.entries_dir(), Some(ENTRY_EXTENSION))
    }

    /// IDs of every entry that owns a `Files/<id>/` directory.
    pub fn list_file_owner_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.files_dir(), None)
    }

    /// File IDs present under `Files/<id>/`.
    pub fn list_file_ids(&self, id: &str) -> Result<Vec<String>> {
        list_ids(&self.file_dir(id), None)
    }
}

/// The three locations one entry can occupy.
#[derive(Debug, Clone)]
pub struct EntryPaths {
    pub canonical: PathBuf,
    pub buffer: PathBuf,
    pub trash: PathBuf,
}

fn list_ids(dir: &Path, extension: Option<&str>) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let name = item.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!("Skipping non UTF-8 name in {}", dir.display());
            continue;
        };
        let stem = match extension {
            Some(ext) => match name.strip_suffix(ext).and_then(|s| s.strip_suffix('.')) {
                Some(stem) => stem,
                None => continue,
            },
            None => name,
        };
        match decode_id(stem) {
            Ok(id) => ids.push(id),
            Err(e) => tracing::warn!("Skipping undecodable name {:?}: {}", name, e),
        }
    }
    ids.sort();
    Ok(ids)
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Encodes an ID into a path-safe file name.
///
/// ASCII letters, digits, `-` and `_` pass through; every other byte becomes
/// `~XX` (uppercase hex). The encoding never produces `%`, `.` or separators.
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        if is_plain(c) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push(ESCAPE);
                out.push_str(&hex::encode_upper([byte]));
            }
        }
    }
    out
}

pub fn decode_id(encoded: &str) -> Result<String> {
    let invalid = || StoreError::InvalidId(encoded.to_string());
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            let pair: String = chars.by_ref().take(2).collect();
            if pair.len() != 2 {
                return Err(invalid().into());
            }
            let decoded = hex::decode(&pair).map_err(|_| invalid())?;
            bytes.extend_from_slice(&decoded);
        } else if is_plain(c) {
            bytes.push(c as u8);
        } else {
            return Err(invalid().into());
        }
    }
    String::from_utf8(bytes).map_err(|_| invalid().into())
}
