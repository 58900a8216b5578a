//! Replicated Table Store
//!
//! Durable, file-backed tables replicated across a small, statically
//! configured cluster. Every node holds a full copy of the tables it serves;
//! writes commit locally and are pushed to peers, and the latest entry
//! timestamp wins when nodes disagree.
//!
//! ## Architecture Modules
//! - **`storage`**: one JSON file per entry, written through a buffer/trash
//!   protocol and guarded by an MD5 hash.
//! - **`locking`**: the timestamp-ordered reader/writer lock and the
//!   cluster-wide lock request queue.
//! - **`peer`**: the client side of the `/wf/db` protocol.
//! - **`table`**: the transactional engine: transactions, sync, maintenance.
//! - **`cluster`**: node identity, the table registry, the server side of the
//!   protocol, backups.
//! - **`value`**, **`clock`**, **`error`**, **`config`**: shared data model,
//!   time source, error signals and node configuration.

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod locking;
pub mod peer;
pub mod storage;
pub mod table;
pub mod value;
