//! Peer Module Tests
//!
//! ## Test Scopes
//! - **Descriptors**: table allowlists and certificate validators.
//! - **Connection guard**: calls on a disconnected peer never touch the network.
//!
//! *Note: calls against a live node are covered in `cluster::tests`.*

#[cfg(test)]
mod tests {
    use crate::locking::LockKey;
    use crate::peer::client::PeerNode;
    use crate::peer::types::{
        CertificateValidator, NodeDescriptor, PeerSettings, PinnedCertificate,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIU\n-----END CERTIFICATE-----\n";

    fn settings() -> PeerSettings {
        PeerSettings {
            scheme: "http".to_string(),
            self_host: "127.0.0.1:9000".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn peer(descriptor: NodeDescriptor) -> PeerNode {
        PeerNode::new(descriptor, settings(), reqwest::Client::new())
    }

    // ============================================================
    // DESCRIPTOR TESTS
    // ============================================================

    #[test]
    fn test_peer_without_allowlist_serves_every_table() {
        let node = peer(NodeDescriptor::new("10.0.0.1:443"));

        assert!(node.serves_table("users"));
        assert!(node.serves_table("anything"));
    }

    #[test]
    fn test_allowlist_restricts_tables() {
        let mut descriptor = NodeDescriptor::new("10.0.0.1:443");
        descriptor.tables = Some(vec!["users".to_string()]);
        let node = peer(descriptor);

        assert!(node.serves_table("users"));
        assert!(!node.serves_table("orders"));
    }

    #[test]
    fn test_pinned_certificate_ignores_whitespace() {
        let pinned = PinnedCertificate::new(CERT);

        assert!(pinned.validate(&CERT.replace('\n', "\r\n"), "any"));
        assert!(!pinned.validate("-----BEGIN CERTIFICATE-----\nother\n", "any"));
        assert!(!PinnedCertificate::new("").validate("", "any"));
    }

    #[test]
    fn test_peer_accepts_certificate_from_any_validator() {
        let mut descriptor = NodeDescriptor::new("10.0.0.1:443");
        descriptor.validators = vec![
            Arc::new(PinnedCertificate::new("-----BEGIN CERTIFICATE-----\nold\n")),
            Arc::new(PinnedCertificate::new(CERT)),
        ];
        let node = peer(descriptor);

        assert!(node.has_validators());
        assert!(node.accepts_certificate(CERT));
        assert!(!node.accepts_certificate("nope"));
    }

    #[test]
    fn test_new_peer_is_reachable_but_not_connected() {
        let node = peer(NodeDescriptor::new("10.0.0.1:443"));

        assert!(node.is_reachable());
        assert!(!node.is_connected());

        node.set_reachable(false);
        assert!(!node.is_reachable());
    }

    // ============================================================
    // CONNECTION GUARD TESTS
    // ============================================================

    #[tokio::test]
    async fn test_disconnected_peer_short_circuits_every_call() {
        // ARRANGE: a host that would hang if contacted
        let node = peer(NodeDescriptor::new("10.255.255.1:9"));
        let key = LockKey::new(1, "abc");
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();

        // ACT
        let state = node.pull_state("users", 1).await;
        let entry = node.pull_entry("users", 1, "u1").await;
        let file = node
            .pull_file("users", 1, "u1", "f1", &dir.path().join("f1"))
            .await;
        let locks = node.send_lock("users", 1, "u1", &key).await;
        let cancelled = node.send_cancel("users", 1, "u1", &key).await;
        let pushed = node.push_change("users", 1, "u1", &key, b"{}".to_vec()).await;

        // ASSERT
        assert!(state.is_none());
        assert!(entry.is_none());
        assert!(!file);
        assert!(locks.is_none());
        assert!(!cancelled);
        assert!(!pushed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
