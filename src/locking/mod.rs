//! Locking Primitives
//!
//! Two layers serialize access to a single entry:
//!
//! - **`rw_lock`**: an in-process, timestamp-ordered reader/writer lock. Reads
//!   share, writes exclude; a waiting writer with an earlier timestamp than
//!   every waiting reader goes first.
//! - **`lock_request`**: the cluster-wide FIFO of transaction claims. Only the
//!   earliest claim may proceed, and a watchdog expires claims whose holder
//!   disappeared.

pub mod lock_request;
pub mod rw_lock;

pub use lock_request::{LockKey, LockQueue, LockRequest, LockState, Origin};
pub use rw_lock::{ReadGuard, TimestampRwLock, WriteGuard};

#[cfg(test)]
mod tests;
