//! Timestamp-ordered asynchronous reader/writer lock.
//!
//! Waiters queue with the timestamp of the operation they belong to. When the
//! lock frees up, the earliest waiting writer wins if its timestamp is earlier
//! than the earliest waiting reader; otherwise every reader that is earlier
//! than the earliest writer is admitted together. Purely in-process.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// (timestamp, arrival sequence)
type WaiterKey = (i64, u64);

struct Waiter {
    access: Access,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting: BTreeMap<WaiterKey, Waiter>,
    next_seq: u64,
}

impl LockState {
    fn earliest(&self, access: Access) -> Option<WaiterKey> {
        self.waiting
            .iter()
            .find(|(_, waiter)| waiter.access == access)
            .map(|(key, _)| *key)
    }

    fn dispatch(&mut self) {
        loop {
            if self.writer {
                return;
            }
            let write = self.earliest(Access::Write);
            let read = self.earliest(Access::Read);

            let next_is_write = match (write, read) {
                (None, None) => return,
                (Some(w), Some(r)) => w < r,
                (Some(_), None) => true,
                (None, Some(_)) => false,
            };

            if next_is_write {
                if self.readers > 0 {
                    return;
                }
                let Some(waiter) = write.and_then(|key| self.waiting.remove(&key)) else {
                    return;
                };
                self.writer = true;
                if waiter.grant.send(()).is_err() {
                    self.writer = false;
                    continue;
                }
                return;
            }

            let Some(waiter) = read.and_then(|key| self.waiting.remove(&key)) else {
                return;
            };
            self.readers += 1;
            if waiter.grant.send(()).is_err() {
                self.readers -= 1;
            }
        }
    }

    fn release(&mut self, access: Access) {
        match access {
            Access::Read => self.readers = self.readers.saturating_sub(1),
            Access::Write => self.writer = false,
        }
        self.dispatch();
    }
}

#[derive(Clone, Default)]
pub struct TimestampRwLock {
    state: Arc<Mutex<LockState>>,
}

impl TimestampRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, timestamp: i64) -> ReadGuard {
        self.acquire(Access::Read, timestamp).await;
        ReadGuard {
            state: self.state.clone(),
        }
    }

    pub async fn write(&self, timestamp: i64) -> WriteGuard {
        self.acquire(Access::Write, timestamp).await;
        WriteGuard {
            state: self.state.clone(),
        }
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    async fn acquire(&self, access: Access, timestamp: i64) {
        let (grant, granted) = oneshot::channel();
        let key = {
            let mut state = self.state.lock();
            let key = (timestamp, state.next_seq);
            state.next_seq += 1;
            state.waiting.insert(key, Waiter { access, grant });
            state.dispatch();
            key
        };

        let mut pending = PendingAcquire {
            state: self.state.clone(),
            key,
            access,
            granted: false,
        };
        // The sender is only consumed by a grant.
        let _ = granted.await;
        pending.granted = true;
    }
}

/// Undoes a queued or already granted acquisition whose future was dropped.
struct PendingAcquire {
    state: Arc<Mutex<LockState>>,
    key: WaiterKey,
    access: Access,
    granted: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut state = self.state.lock();
        if state.waiting.remove(&self.key).is_some() {
            state.dispatch();
        } else {
            state.release(self.access);
        }
    }
}

pub struct ReadGuard {
    state: Arc<Mutex<LockState>>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.state.lock().release(Access::Read);
    }
}

pub struct WriteGuard {
    state: Arc<Mutex<LockState>>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.state.lock().release(Access::Write);
    }
}
