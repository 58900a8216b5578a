//! Durable Entry Store
//!
//! Persists one serialized entry per file and recovers it after crashes or
//! corruption.
//!
//! ## Core Concepts
//! - **Layout**: every table owns `Entries/`, `Buffer/` and `Trash/` trees (`layout`).
//! - **Write ordering**: buffer write, canonical delete, atomic rename (`entry_file`).
//! - **Self-healing**: memory, recorded hash and disk are compared pairwise; the
//!   odd copy out is rewritten from the other two.
//! - **Startup recovery**: leftover buffer and trash files are resolved before load.

pub mod entry_file;
pub mod hash;
pub mod layout;

pub use entry_file::{EntryFile, Integrity, RecoveryReport, recover};
pub use hash::ContentHash;
pub use layout::{TableLayout, decode_id, encode_id};
