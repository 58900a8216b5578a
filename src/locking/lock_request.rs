//! Distributed Lock Request Queue
//!
//! Every entry owns a queue of claims ordered by `(timestamp, randomness)`.
//! Each node keeps its own copy of the queue and learns about the other nodes'
//! claims through the `/lock` exchange, so all nodes converge on the same order
//! without a coordinator.
//!
//! ## Lifecycle
//! `Pending -> Ready -> Finished`, never backwards.
//! - The earliest request becomes `Ready` once no other request is `Ready`.
//! - A `Ready` request arms a watchdog that finishes it after the expiration.
//! - Finished keys are remembered so a late remote announcement is ignored.
//!
//! A local request stays "announcing" while its broadcast is in flight; no
//! request can be promoted past it until the peers' queues have been merged.

use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Length of the random tie-breaker attached to every claim.
pub const RANDOMNESS_LEN: usize = 32;

/// How many finished keys are remembered per entry.
const DELETED_MEMORY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub timestamp: i64,
    pub randomness: String,
}

impl LockKey {
    pub fn new(timestamp: i64, randomness: impl Into<String>) -> Self {
        Self {
            timestamp,
            randomness: randomness.into(),
        }
    }

    /// A fresh key for a local claim.
    pub fn generate(timestamp: i64) -> Self {
        let randomness: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOMNESS_LEN)
            .map(char::from)
            .collect();
        Self::new(timestamp, randomness)
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}&{}", self.timestamp, self.randomness)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Pending,
    Ready,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug)]
pub struct LockRequest {
    key: LockKey,
    origin: Origin,
    state: watch::Sender<LockState>,
}

impl LockRequest {
    fn new(key: LockKey, origin: Origin) -> Arc<Self> {
        let (state, _) = watch::channel(LockState::Pending);
        Arc::new(Self { key, origin, state })
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// Waits until the request leaves `Pending`. Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s != LockState::Pending)).await,
            Ok(Ok(_))
        )
    }
}

struct Slot {
    request: Arc<LockRequest>,
    announcing: bool,
    watchdog: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    slots: BTreeMap<LockKey, Slot>,
    deleted: BTreeSet<LockKey>,
}

pub struct LockQueue {
    entry_id: String,
    expiration: Duration,
    state: Mutex<QueueState>,
}

impl LockQueue {
    pub fn new(entry_id: &str, expiration: Duration) -> Arc<Self> {
        Arc::new(Self {
            entry_id: entry_id.to_string(),
            expiration,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Adds this node's own claim. It holds back promotion until
    /// [`announced`](Self::announced) is called for the same key.
    pub fn register_local(self: &Arc<Self>, key: LockKey) -> Arc<LockRequest> {
        let mut state = self.state.lock();
        let request = LockRequest::new(key.clone(), Origin::Local);
        state.slots.insert(
            key,
            Slot {
                request: request.clone(),
                announcing: true,
                watchdog: None,
            },
        );
        request
    }

    /// Marks the broadcast of a local claim as complete.
    pub fn announced(self: &Arc<Self>, key: &LockKey) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(key) {
            slot.announcing = false;
        }
        self.promote(&mut state);
    }

    /// Registers a claim announced by a peer. Returns `None` if the claim was
    /// already finished or cancelled here.
    pub fn register_remote(self: &Arc<Self>, key: LockKey) -> Option<Arc<LockRequest>> {
        let mut state = self.state.lock();
        if state.deleted.contains(&key) {
            tracing::debug!("Ignoring finished lock request {} on {}", key, self.entry_id);
            return None;
        }
        if let Some(slot) = state.slots.get(&key) {
            return Some(slot.request.clone());
        }
        let request = LockRequest::new(key.clone(), Origin::Remote);
        state.slots.insert(
            key,
            Slot {
                request: request.clone(),
                announcing: false,
                watchdog: None,
            },
        );
        self.promote(&mut state);
        Some(request)
    }

    /// Finishes a request and promotes the next one. Idempotent.
    pub fn set_finished(self: &Arc<Self>, key: &LockKey) -> bool {
        let mut state = self.state.lock();
        let removed = Self::remove(&mut state, key);
        self.promote(&mut state);
        removed
    }

    /// Removes a request that committed or was cancelled, remembering its key
    /// even if the request has not been seen yet.
    pub fn delete(self: &Arc<Self>, key: &LockKey) -> bool {
        self.set_finished(key)
    }

    pub fn outstanding(&self) -> Vec<LockKey> {
        self.state.lock().slots.keys().cloned().collect()
    }

    pub fn ready(&self) -> Option<LockKey> {
        self.state
            .lock()
            .slots
            .values()
            .find(|slot| slot.request.state() == LockState::Ready)
            .map(|slot| slot.request.key.clone())
    }

    pub fn contains(&self, key: &LockKey) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    fn remove(state: &mut QueueState, key: &LockKey) -> bool {
        state.deleted.insert(key.clone());
        while state.deleted.len() > DELETED_MEMORY {
            state.deleted.pop_first();
        }

        let Some(slot) = state.slots.remove(key) else {
            return false;
        };
        if let Some(watchdog) = slot.watchdog {
            watchdog.abort();
        }
        slot.request.state.send_replace(LockState::Finished);
        true
    }

    fn promote(self: &Arc<Self>, state: &mut QueueState) {
        if state
            .slots
            .values()
            .any(|slot| slot.request.state() == LockState::Ready)
        {
            return;
        }
        let Some((key, slot)) = state.slots.iter_mut().next() else {
            return;
        };
        if slot.announcing {
            return;
        }

        slot.request.state.send_replace(LockState::Ready);
        tracing::trace!("Lock request {} on {} is ready", key, self.entry_id);

        let queue: Weak<Self> = Arc::downgrade(self);
        let key = key.clone();
        let origin = slot.request.origin();
        let expiration = self.expiration;
        slot.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(expiration).await;
            if let Some(queue) = queue.upgrade() {
                match origin {
                    Origin::Local => tracing::warn!(
                        "Lock request {} on {} expired before this node finished it",
                        key,
                        queue.entry_id
                    ),
                    Origin::Remote => tracing::warn!(
                        "Lock request {} on {} expired without a change from its peer",
                        key,
                        queue.entry_id
                    ),
                }
                queue.set_finished(&key);
            }
        }));
    }
}
