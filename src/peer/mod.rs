//! Peer Node Client
//!
//! Everything this node sends to another cluster member goes through a
//! [`PeerNode`]: identity lookup, the keep-alive stream, state/entry/file
//! pulls, lock announcements and change pushes.
//!
//! ## Submodules
//! - **`client`**: the per-peer RPC client and its connection state.
//! - **`protocol`**: routes, query shapes and the lock-list wire format.
//! - **`types`**: node descriptors, certificate validation, client identity.

pub mod client;
pub mod protocol;
pub mod types;

pub use client::PeerNode;
pub use types::{CertificateValidator, ClientIdentity, NodeDescriptor, PeerSettings, PinnedCertificate};

#[cfg(test)]
mod tests;
