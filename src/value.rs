//! Entry Data Model
//!
//! Every entry is persisted as a [`Record`]: the shared bookkeeping fields
//! (`Timestamp`, `Deleted`, `AssemblyVersion`, attached `Files`) plus the
//! table's payload type. A record with `Deleted = true` is a tombstone and
//! carries no payload.
//!
//! [`MinimalTableValue`] deserializes from the same bytes but only keeps the
//! fields needed to compare states between nodes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload stored in a table.
///
/// `VERSION` is the schema version written into `AssemblyVersion` on every
/// commit and checked against peers' minimum versions.
pub trait TableValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const VERSION: u32;
}

/// Metadata for one attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct FileMeta {
    pub timestamp: i64,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Record<V> {
    pub id: String,
    pub timestamp: i64,
    pub deleted: bool,
    pub assembly_version: u32,
    #[serde(default)]
    pub files: BTreeMap<String, FileMeta>,
    pub value: Option<V>,
}

impl<V: TableValue> Record<V> {
    pub fn tombstone(id: &str) -> Self {
        Self {
            id: id.to_string(),
            timestamp: 0,
            deleted: true,
            assembly_version: V::VERSION,
            files: BTreeMap::new(),
            value: None,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn minimal(&self) -> MinimalTableValue {
        MinimalTableValue {
            id: self.id.clone(),
            timestamp: self.timestamp,
            deleted: self.deleted,
            files: self.files.clone(),
        }
    }
}

/// Projection of a record used during synchronization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MinimalTableValue {
    pub id: String,
    pub timestamp: i64,
    pub deleted: bool,
    #[serde(default)]
    pub files: BTreeMap<String, FileMeta>,
}

impl MinimalTableValue {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn file_timestamp(&self, file_id: &str) -> Option<i64> {
        self.files.get(file_id).map(|meta| meta.timestamp)
    }
}

/// Schemaless JSON payload, used by tables the node binary opens from its
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub serde_json::Value);

impl TableValue for Document {
    const VERSION: u32 = 1;
}
