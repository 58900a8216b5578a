//! Transactions
//!
//! A transaction runs a caller-supplied action against one entry while holding
//! two locks:
//!
//! 1. the entry's local write lock, which serializes transactions of this
//!    process, and
//! 2. a cluster-wide claim in the entry's [`LockQueue`](crate::locking::LockQueue),
//!    announced to every connected peer, which serializes transactions across
//!    nodes.
//!
//! The action sees the entry as committed when the claim became ready. If it
//! returns an error the claim is cancelled on every peer and the error is
//! handed back untouched; otherwise the change is persisted locally first and
//! then pushed to the peers in the background.

use anyhow::Result;
use futures_util::future::join_all;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;

use super::files::{self, FileAction, Placed, Staging};
use super::table::{ChangeOrigin, Entry, Table};
use crate::clock::next_timestamp;
use crate::error::StoreError;
use crate::locking::{LockKey, LockQueue};
use crate::value::{Record, TableValue};

/// Length of IDs generated by [`Table::create`].
pub const GENERATED_ID_LEN: usize = 16;

/// Working copy of one entry inside a transaction.
pub struct Transaction<V> {
    record: Record<V>,
    existed: bool,
    dirty: bool,
    file_actions: Vec<FileAction>,
}

impl<V: TableValue> Transaction<V> {
    fn new(record: Record<V>) -> Self {
        let existed = !record.deleted && record.value.is_some();
        Self {
            record,
            existed,
            dirty: false,
            file_actions: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Whether the entry held a live value when the transaction started.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Whether the entry currently holds a live value.
    pub fn exists(&self) -> bool {
        self.record.value.is_some()
    }

    /// Timestamp of the last commit of this entry; 0 for a new one.
    pub fn timestamp(&self) -> i64 {
        self.record.timestamp
    }

    pub fn value(&self) -> Option<&V> {
        self.record.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut V> {
        self.dirty = true;
        self.record.value.as_mut()
    }

    pub fn set(&mut self, value: V) {
        self.dirty = true;
        self.record.value = Some(value);
    }

    /// Turns the entry into a tombstone on commit. Its files are purged.
    pub fn delete(&mut self) {
        self.dirty = true;
        self.record.value = None;
    }

    /// Queues an attachment write, committed together with the entry.
    pub fn put_file(&mut self, file_id: &str, bytes: impl Into<Vec<u8>>) -> Result<()> {
        if file_id.is_empty() {
            return Err(StoreError::InvalidId(file_id.to_string()).into());
        }
        self.dirty = true;
        self.file_actions.push(FileAction::Put {
            file_id: file_id.to_string(),
            bytes: bytes.into(),
        });
        Ok(())
    }

    pub fn remove_file(&mut self, file_id: &str) {
        self.dirty = true;
        self.file_actions.push(FileAction::Remove {
            file_id: file_id.to_string(),
        });
    }

    /// Attachment IDs as they will be after commit.
    pub fn files(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.record.files.keys().cloned().collect();
        for action in &self.file_actions {
            match action {
                FileAction::Put { file_id, .. } => {
                    if !ids.contains(file_id) {
                        ids.push(file_id.clone());
                    }
                }
                FileAction::Remove { file_id } => ids.retain(|id| id != file_id),
            }
        }
        ids.sort();
        ids
    }
}

/// This node's claim on an entry. Dropping it removes the claim from the
/// local queue, which promotes the next one.
struct Claim {
    queue: Arc<LockQueue>,
    key: LockKey,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.queue.delete(&self.key);
    }
}

pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_ID_LEN)
        .map(char::from)
        .collect()
}

impl<V: TableValue> Table<V> {
    /// Runs `action` against entry `id`, creating it when it does not exist.
    ///
    /// An action that leaves a new entry empty writes nothing.
    pub async fn transaction<R, F>(&self, id: &str, action: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<V>) -> Result<R>,
    {
        self.run(id, false, action).await
    }

    /// Like [`transaction`](Self::transaction) but fails with
    /// [`StoreError::NotFound`] when `id` has no live value.
    pub async fn transaction_existing<R, F>(&self, id: &str, action: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<V>) -> Result<R>,
    {
        self.run(id, true, action).await
    }

    /// Stores `value` under a fresh random ID and returns the ID.
    pub async fn create(&self, value: V) -> Result<String> {
        let mut pending = value;
        loop {
            let id = generate_id();
            if self.entry(&id).is_some() {
                continue;
            }
            let collision = self
                .transaction(&id, move |tx| {
                    if tx.exists() {
                        return Ok(Some(pending));
                    }
                    tx.set(pending);
                    Ok(None)
                })
                .await?;
            match collision {
                None => return Ok(id),
                Some(value) => pending = value,
            }
        }
    }

    /// Inserts or replaces the value of `id`.
    pub async fn put(&self, id: &str, value: V) -> Result<()> {
        self.transaction(id, |tx| {
            tx.set(value);
            Ok(())
        })
        .await
    }

    /// Mutates an existing value in place and returns the new value.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<V>
    where
        F: FnOnce(&mut V) -> Result<()>,
    {
        let name = self.name.clone();
        self.transaction_existing(id, |tx| {
            let id = tx.id().to_string();
            let value = tx
                .value_mut()
                .ok_or_else(|| StoreError::not_found(&name, &id))?;
            mutate(&mut *value)?;
            Ok(value.clone())
        })
        .await
    }

    /// Tombstones `id`. Returns false when there was nothing to delete.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.transaction(id, |tx| {
            let existed = tx.exists();
            if existed {
                tx.delete();
            }
            Ok(existed)
        })
        .await
    }

    /// Attaches `bytes` to an existing entry under `file_id`.
    pub async fn put_file(&self, id: &str, file_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.transaction_existing(id, |tx| tx.put_file(file_id, bytes))
            .await
    }

    pub async fn remove_file(&self, id: &str, file_id: &str) -> Result<()> {
        self.transaction_existing(id, |tx| {
            tx.remove_file(file_id);
            Ok(())
        })
        .await
    }

    async fn run<R, F>(&self, id: &str, require_existing: bool, action: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<V>) -> Result<R>,
    {
        if id.is_empty() {
            return Err(StoreError::InvalidId(id.to_string()).into());
        }
        let (entry, _write) = self.lock_for_write(id).await;

        let live = entry.minimal().map(|m| !m.deleted).unwrap_or(false);
        if require_existing && !live {
            self.discard_placeholder(&entry);
            return Err(StoreError::not_found(&self.name, id).into());
        }

        let claim = self.claim(&entry).await;

        // The claim may have waited on a peer's transaction; read after it.
        let current = match self.read_record(&entry) {
            Ok(current) => current,
            Err(e) => {
                self.cancel(&entry, claim);
                return Err(e);
            }
        };
        let mut tx = Transaction::new(current.unwrap_or_else(|| Record::tombstone(id)));
        if require_existing && !tx.exists() {
            self.cancel(&entry, claim);
            return Err(StoreError::not_found(&self.name, id).into());
        }

        let output = match action(&mut tx) {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("Transaction on {}/{} failed: {}", self.name, id, e);
                self.cancel(&entry, claim);
                return Err(e);
            }
        };

        match self.commit(&entry, tx) {
            Ok(Some(bytes)) => self.finish(&entry, claim, bytes),
            Ok(None) => self.cancel(&entry, claim),
            Err(e) => {
                tracing::warn!("Commit of {}/{} failed: {}", self.name, id, e);
                self.cancel(&entry, claim);
                return Err(e);
            }
        }
        Ok(output)
    }

    /// Creates this node's claim, merges every connected peer's queue and
    /// waits until the claim is first in line.
    async fn claim(&self, entry: &Entry) -> Claim {
        let claim = Claim {
            queue: entry.requests.clone(),
            key: LockKey::generate(self.cluster.now_ticks()),
        };
        let request = entry.requests.register_local(claim.key.clone());

        let peers = self.cluster.connected_peers(&self.name);
        if !peers.is_empty() {
            let announcements = peers
                .iter()
                .map(|peer| peer.send_lock(&self.name, self.min_version, &entry.id, &claim.key));
            for outstanding in join_all(announcements).await.into_iter().flatten() {
                for key in outstanding {
                    if key != claim.key {
                        entry.requests.register_remote(key);
                    }
                }
            }
        }
        entry.requests.announced(&claim.key);

        let timeout = self.cluster.lock_wait_timeout();
        if !request.wait_ready(timeout).await {
            tracing::warn!(
                "Lock {} on {}/{} not ready after {:?}, proceeding anyway",
                claim.key,
                self.name,
                entry.id,
                timeout
            );
        }
        claim
    }

    /// Drops the claim here and on every connected peer.
    fn cancel(&self, entry: &Arc<Entry>, claim: Claim) {
        let key = claim.key.clone();
        drop(claim);
        self.discard_placeholder(entry);

        for peer in self.cluster.connected_peers(&self.name) {
            let table = self.name.clone();
            let id = entry.id.clone();
            let key = key.clone();
            let min_version = self.min_version;
            self.spawn_push(async move {
                if !peer.send_cancel(&table, min_version, &id, &key).await {
                    tracing::warn!("Cancel of {} on {}/{} not delivered to {}", key, table, id, peer.host());
                }
            });
        }
    }

    /// Finishes the claim locally and pushes the committed bytes to every
    /// connected peer. The push also finishes the claim on the peer.
    fn finish(&self, entry: &Entry, claim: Claim, bytes: Vec<u8>) {
        let key = claim.key.clone();
        drop(claim);

        for peer in self.cluster.connected_peers(&self.name) {
            let table = self.name.clone();
            let id = entry.id.clone();
            let key = key.clone();
            let bytes = bytes.clone();
            let min_version = self.min_version;
            self.spawn_push(async move {
                if !peer.push_change(&table, min_version, &id, &key, bytes).await {
                    tracing::warn!(
                        "Change of {}/{} not delivered to {}; it will sync on reconnect",
                        table,
                        id,
                        peer.host()
                    );
                }
            });
        }
    }

    /// Persists the transaction. Returns `None` when there was nothing to
    /// write.
    fn commit(&self, entry: &Entry, tx: Transaction<V>) -> Result<Option<Vec<u8>>> {
        let Transaction {
            mut record,
            dirty,
            file_actions,
            ..
        } = tx;
        if !dirty {
            return Ok(None);
        }
        let live = record.value.is_some();
        let staging = if live {
            files::prepare(&self.layout, &entry.id, &file_actions)?
        } else {
            Staging::default()
        };

        let mut file = entry.file.lock();
        if !live && file.is_none() {
            staging.discard();
            return Ok(None);
        }

        let on_disk = file
            .as_ref()
            .and_then(|f| f.minimal().ok())
            .map(|m| m.timestamp)
            .unwrap_or(0);
        let timestamp = next_timestamp(self.cluster.clock(), record.timestamp.max(on_disk));

        let placed = if live {
            files::commit(&self.layout, &entry.id, staging, &mut record.files, timestamp)?
        } else {
            record.files.clear();
            Placed::default()
        };

        record.id = entry.id.clone();
        record.timestamp = timestamp;
        record.deleted = !live;
        record.assembly_version = V::VERSION;
        let stored = record.to_bytes().and_then(|bytes| {
            self.store(entry, &mut file, &record, bytes.clone(), ChangeOrigin::Local)?;
            Ok(bytes)
        });
        let bytes = match stored {
            Ok(bytes) => bytes,
            Err(e) => {
                placed.roll_back(&self.layout, &entry.id);
                return Err(e);
            }
        };

        // The entry is durable from here on; leftovers are only logged.
        let cleanup = if live {
            placed.finish(&self.layout, &entry.id)
        } else {
            files::purge(&self.layout, &entry.id)
        };
        if let Err(e) = cleanup {
            tracing::warn!(
                "Stale attachments of {}/{} left for maintenance: {}",
                self.name,
                entry.id,
                e
            );
        }
        tracing::debug!("Committed {}/{} at {}", self.name, entry.id, timestamp);
        Ok(Some(bytes))
    }
}
