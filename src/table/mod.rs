//! Table Transactional Engine
//!
//! A [`Table`] is a named collection of entries of one payload type, backed by
//! one directory tree and replicated to every peer that serves it.
//!
//! ## Core Concepts
//! - **Entries**: each ID owns a durable [`EntryFile`](crate::storage::EntryFile),
//!   a local reader/writer lock and a cluster-wide lock request queue.
//! - **Transactions**: the only way to mutate an entry. Local commit first,
//!   peer propagation afterwards, in the background.
//! - **Sync**: last-writer-wins by entry timestamp, pulled from peers on
//!   (re)connection and during maintenance.
//! - **Maintenance**: corruption sweep, tombstone garbage collection and
//!   attachment cleanup (`check_and_fix`).
//!
//! ## Submodules
//! - **`table`**: the entry dictionary, reads, indices and change events.
//! - **`transaction`**: the transaction family and the commit flow.
//! - **`files`**: two-phase attachment storage.
//! - **`index`**: secondary indices.
//! - **`sync`**: peer sync and the maintenance sweep.
//! - **`remote`**: the type-erased [`ClusterTable`] view used by the cluster.

pub mod files;
pub mod index;
pub mod remote;
pub mod sync;
pub mod table;
pub mod transaction;

pub use remote::ClusterTable;
pub use sync::MaintenanceReport;
pub use table::{ChangeOrigin, Table, TableChange};
pub use transaction::{GENERATED_ID_LEN, Transaction};
