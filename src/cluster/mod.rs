//! Cluster Coordination
//!
//! Ties the tables of one process to their peers.
//!
//! ## Core Concepts
//! - **Cluster**: this node's identity, the configured peer list and the
//!   shared clock. `mark_self` finds which configured node is this process.
//! - **Registry**: every open table by name, plus the liveness monitors and
//!   the maintenance loop running on their behalf.
//! - **Handlers**: the `/wf/db` endpoints peers call.
//! - **Backup**: incremental, restorable copies of every table.
//!
//! ## Submodules
//! - **`cluster`**: identity, peers, authentication.
//! - **`registry`**: table directory and background workers.
//! - **`handlers`**: HTTP surface of the peer protocol.
//! - **`maintenance`**: the periodic check/sync/backup loop.
//! - **`backup`**: increment writer and restore.

pub mod backup;
pub mod cluster;
pub mod handlers;
pub(crate) mod maintenance;
pub mod registry;

pub use backup::{BackupManifest, BackupReport, RestoreReport};
pub use cluster::{Cluster, ClusterSettings, LOCK_WAIT_FACTOR};
pub use handlers::router;
pub use registry::ClusterRegistry;

#[cfg(test)]
mod tests;
