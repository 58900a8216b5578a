//! Cluster Module Tests
//!
//! Multi-node behaviour over real HTTP: every node runs the crate's own
//! router on `127.0.0.1:0` with plaintext transport.
//!
//! ## Test Scopes
//! - **Identity**: `mark_self` and the disabled-cluster fallback.
//! - **Protocol surface**: authentication, version gating, error codes.
//! - **Replication**: change pushes, attachments, sync on connect, lock
//!   exchange, concurrent writers on two nodes.
//! - **Maintenance**: tombstone collection and corruption repair across nodes.
//! - **Sync**: missing attachments, no-op pulls, restored entries meeting
//!   newer peer copies.
//! - **Backup**: increments and point-in-time restore.

#[cfg(test)]
mod tests {
    use crate::clock::SystemClock;
    use crate::cluster::{Cluster, ClusterRegistry, ClusterSettings, router};
    use crate::locking::LockKey;
    use crate::peer::{ClientIdentity, NodeDescriptor, PeerNode};
    use crate::table::{ClusterTable, Table};
    use crate::value::TableValue;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Note {
        title: String,
        count: u32,
    }

    impl TableValue for Note {
        const VERSION: u32 = 2;
    }

    fn note(title: &str) -> Note {
        Note {
            title: title.to_string(),
            count: 0,
        }
    }

    struct TestNode {
        host: String,
        registry: Arc<ClusterRegistry>,
        table: Arc<Table<Note>>,
        _dir: TempDir,
    }

    impl TestNode {
        fn peer(&self, host: &str) -> Arc<PeerNode> {
            self.registry.cluster().find_node(host).unwrap()
        }
    }

    const WAIT: Duration = Duration::from_secs(10);

    async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Starts `count` nodes that all list each other, then runs `mark_self`.
    async fn start_cluster(count: usize, identity: Option<ClientIdentity>) -> Vec<TestNode> {
        let mut listeners = Vec::new();
        for _ in 0..count {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let hosts: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().to_string())
            .collect();

        let mut nodes = Vec::new();
        for (listener, host) in listeners.into_iter().zip(&hosts) {
            let settings = ClusterSettings {
                self_host: host.clone(),
                scheme: "http".to_string(),
                identity: identity.clone(),
                lock_expiration: Duration::from_secs(2),
                request_timeout: Duration::from_secs(2),
            };
            let descriptors = hosts.iter().map(|h| NodeDescriptor::new(h)).collect();
            let cluster = Cluster::new(settings, descriptors, Arc::new(SystemClock)).unwrap();
            let dir = tempfile::tempdir().unwrap();
            let registry = ClusterRegistry::new(cluster, dir.path());
            let table = registry.open_table::<Note>("notes", 1).unwrap();

            let app = router(registry.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            nodes.push(TestNode {
                host: host.clone(),
                registry,
                table,
                _dir: dir,
            });
        }

        for node in &nodes {
            node.registry.mark_self().await;
        }
        nodes
    }

    async fn connect(nodes: &[&TestNode]) {
        for node in nodes {
            node.registry.start_monitors();
        }
        for node in nodes {
            let cluster = node.registry.cluster().clone();
            wait_until("peers to connect", || {
                cluster
                    .nodes()
                    .iter()
                    .filter(|n| n.is_reachable())
                    .all(|n| n.is_connected())
            })
            .await;
        }
    }

    async fn plaintext_pair() -> (TestNode, TestNode) {
        let mut nodes = start_cluster(2, Some(ClientIdentity::Plaintext)).await;
        let b = nodes.pop().unwrap();
        let a = nodes.pop().unwrap();
        (a, b)
    }

    fn url(host: &str, route: &str) -> String {
        format!("http://{}/wf/db/{}", host, route)
    }

    // ============================================================
    // IDENTITY TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mark_self_identifies_own_node() {
        let (a, b) = plaintext_pair().await;

        let cluster = a.registry.cluster();

        assert!(cluster.is_enabled());
        assert_eq!(cluster.self_node().unwrap().host(), a.host);
        assert!(!a.peer(&a.host).is_reachable());
        assert!(a.peer(&b.host).is_reachable());
        assert_eq!(cluster.reachable_peers("notes").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_identity_disables_clustering() {
        // ARRANGE / ACT
        let nodes = start_cluster(1, None).await;
        let node = &nodes[0];

        // ASSERT
        assert!(!node.registry.cluster().is_enabled());
        let status = reqwest::Client::new()
            .get(url(&node.host, "state"))
            .query(&[("table", "notes"), ("version", "2"), ("host", node.host.as_str())])
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::FORBIDDEN);

        // Tables keep working on their own.
        node.table.put("solo", note("local only")).await.unwrap();
        assert!(node.table.contains("solo"));
    }

    // ============================================================
    // PROTOCOL SURFACE TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_node_id_route_returns_process_id() {
        let (a, _b) = plaintext_pair().await;

        let body = reqwest::get(url(&a.host, "node-id"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert_eq!(body, a.registry.cluster().node_id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_protocol_status_codes() {
        // ARRANGE: calls to A made in B's name
        let (a, b) = plaintext_pair().await;
        a.table.put("x", note("x")).await.unwrap();
        let client = reqwest::Client::new();
        let get = |route: &str, query: Vec<(&'static str, String)>| {
            client.get(url(&a.host, route)).query(&query).send()
        };
        let host = || ("host", b.host.clone());

        // ACT / ASSERT
        let ok = get("state", vec![("table", "notes".into()), ("version", "2".into()), host()])
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);

        let no_host = get("state", vec![("table", "notes".into()), ("version", "2".into())])
            .await
            .unwrap();
        assert_eq!(no_host.status(), 401);

        let stranger = get(
            "state",
            vec![
                ("table", "notes".into()),
                ("version", "2".into()),
                ("host", "10.9.9.9:1".into()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(stranger.status(), 403);

        let unknown_table = get("state", vec![("table", "missing".into()), ("version", "2".into()), host()])
            .await
            .unwrap();
        assert_eq!(unknown_table.status(), 404);

        let too_old_reader = get("state", vec![("table", "notes".into()), ("version", "0".into()), host()])
            .await
            .unwrap();
        assert_eq!(too_old_reader.status(), 418);

        let missing_entry = get(
            "entry",
            vec![("table", "notes".into()), ("version", "2".into()), ("id", "nope".into()), host()],
        )
        .await
        .unwrap();
        assert_eq!(missing_entry.status(), 404);

        let missing_file = get(
            "file",
            vec![
                ("table", "notes".into()),
                ("version", "2".into()),
                ("id", "x".into()),
                ("file", "cover".into()),
                host(),
            ],
        )
        .await
        .unwrap();
        assert_eq!(missing_file.status(), 404);

        let lock = |min_version: &str, randomness: &str| -> Vec<(&'static str, String)> {
            vec![
                ("table", "notes".into()),
                ("min-version", min_version.to_string()),
                ("id", "x".into()),
                ("timestamp", "5".into()),
                ("randomness", randomness.to_string()),
                host(),
            ]
        };
        let newer_writer = get("lock", lock("99", "abc")).await.unwrap();
        assert_eq!(newer_writer.status(), 418);

        let bad_randomness = get("lock", lock("1", "not valid!")).await.unwrap();
        assert_eq!(bad_randomness.status(), 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_entry_route_serves_committed_bytes() {
        let (a, b) = plaintext_pair().await;
        a.table.put("x", note("served")).await.unwrap();

        let body = reqwest::Client::new()
            .get(url(&a.host, "entry"))
            .query(&[
                ("table", "notes"),
                ("version", "2"),
                ("id", "x"),
                ("host", b.host.as_str()),
            ])
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();

        assert_eq!(body.to_vec(), a.table.entry_bytes("x").unwrap());
    }

    // ============================================================
    // REPLICATION TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_commit_is_pushed_to_peer() {
        // ARRANGE
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;

        // ACT
        a.table.put("x", note("replicated")).await.unwrap();
        a.table.flush_pushes().await;

        // ASSERT
        let expected = a.table.state()["x"].timestamp;
        let table = b.table.clone();
        wait_until("the change to reach B", || {
            table.state().get("x").map(|m| m.timestamp) == Some(expected)
        })
        .await;
        assert_eq!(b.table.get_by_id("x").await.unwrap(), note("replicated"));
        let claims = b.table.clone();
        wait_until("B to release the claim", || {
            claims.entry("x").map(|e| e.requests.is_empty()).unwrap_or(false)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_attachments_follow_their_entry() {
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;

        a.table
            .transaction("doc", |tx| {
                tx.set(note("with file"));
                tx.put_file("cover", b"png bytes".to_vec())
            })
            .await
            .unwrap();
        a.table.flush_pushes().await;

        let table = b.table.clone();
        wait_until("the file to reach B", || table.file_path("doc", "cover").is_some()).await;
        assert_eq!(
            b.table.read_file("doc", "cover").await.unwrap(),
            b"png bytes".to_vec()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sync_on_connect_pulls_missing_entries() {
        // ARRANGE: A commits while nobody is connected
        let (a, b) = plaintext_pair().await;
        a.table.put("early", note("written offline")).await.unwrap();
        b.table.put("other", note("from b")).await.unwrap();

        // ACT
        connect(&[&a, &b]).await;

        // ASSERT: both sides pulled what they lacked
        let (ta, tb) = (a.table.clone(), b.table.clone());
        wait_until("both nodes to converge", || {
            ta.contains("other") && tb.contains("early")
        })
        .await;
        assert_eq!(b.table.get_by_id("early").await.unwrap().title, "written offline");
        assert_eq!(a.table.state()["other"], b.table.state()["other"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_exchange_between_nodes() {
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;
        let to_b = a.peer(&b.host);
        let key = LockKey::new(5, "abc");

        let outstanding = to_b.send_lock("notes", 1, "x", &key).await.unwrap();
        assert_eq!(outstanding, vec![key.clone()]);
        assert!(b.table.entry("x").unwrap().requests.contains(&key));

        assert!(to_b.send_cancel("notes", 1, "x", &key).await);
        assert!(b.table.entry("x").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_two_nodes_do_not_lose_updates() {
        // ARRANGE
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;
        a.table.put("c", note("counter")).await.unwrap();
        a.table.flush_pushes().await;
        let table = b.table.clone();
        wait_until("the counter to reach B", || table.contains("c")).await;

        // ACT
        let mut writers = Vec::new();
        for table in [a.table.clone(), b.table.clone()] {
            for _ in 0..5 {
                let table = table.clone();
                writers.push(tokio::spawn(async move {
                    table
                        .update("c", |n| {
                            n.count += 1;
                            Ok(())
                        })
                        .await
                        .unwrap();
                }));
            }
        }
        for writer in writers {
            writer.await.unwrap();
        }
        a.table.flush_pushes().await;
        b.table.flush_pushes().await;

        // ASSERT
        let (ta, tb) = (a.table.clone(), b.table.clone());
        wait_until("both nodes to agree", || {
            ta.state().get("c") == tb.state().get("c")
        })
        .await;
        assert_eq!(a.table.get_by_id("c").await.unwrap().count, 10);
        assert_eq!(b.table.get_by_id("c").await.unwrap().count, 10);
    }

    // ============================================================
    // MAINTENANCE TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tombstones_are_collected_once_every_peer_agrees() {
        // ARRANGE
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;
        a.table.put("x", note("short lived")).await.unwrap();
        a.table.delete("x").await.unwrap();
        a.table.flush_pushes().await;
        let table = b.table.clone();
        wait_until("the tombstone to reach B", || {
            table.state().get("x").map(|m| m.deleted).unwrap_or(false)
        })
        .await;

        // ACT
        let on_a = a.registry.check_and_fix_all().await;
        let on_b = b.registry.check_and_fix_all().await;

        // ASSERT
        assert_eq!(on_a.tombstones_removed, 1);
        assert_eq!(on_b.tombstones_removed, 1);
        assert!(!a.table.state().contains_key("x"));
        assert!(!b.table.state().contains_key("x"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tombstone_is_kept_while_a_peer_still_has_the_entry() {
        // ARRANGE: B holds a live copy A never heard about being restored
        let (a, b) = plaintext_pair().await;
        a.table.put("x", note("gone on a")).await.unwrap();
        a.table.delete("x").await.unwrap();
        b.table
            .receive_change(
                None,
                "x",
                &LockKey::new(1, "seed"),
                crate::value::Record {
                    id: "x".to_string(),
                    timestamp: 1,
                    deleted: false,
                    assembly_version: Note::VERSION,
                    files: Default::default(),
                    value: Some(note("stale on b")),
                }
                .to_bytes()
                .unwrap(),
            )
            .await
            .unwrap();
        a.peer(&b.host).set_connected(true);

        // ACT
        let report = a.table.check_and_fix().await.unwrap();

        // ASSERT
        assert_eq!(report.tombstones_removed, 0);
        assert!(a.table.state()["x"].deleted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_stops_monitors() {
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;

        a.registry.shutdown().await;

        assert!(!a.peer(&b.host).is_connected());
    }

    // ============================================================
    // REPAIR & SYNC TESTS
    // ============================================================

    async fn replicate(from: &TestNode, to: &TestNode, id: &str) {
        from.table.flush_pushes().await;
        let expected = from.table.state()[id].timestamp;
        let table = to.table.clone();
        wait_until("the change to replicate", || {
            table.state().get(id).map(|m| m.timestamp) == Some(expected)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_corrupt_entry_is_replaced_from_peer() {
        // ARRANGE: memory, stored hash and disk all disagree on A
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;
        a.table.put("x", note("precious")).await.unwrap();
        replicate(&a, &b, "x").await;
        {
            let entry = a.table.entry("x").unwrap();
            let mut file = entry.file.lock();
            let file = file.as_mut().unwrap();
            file.overwrite_memory(b"{\"memory\":true}".to_vec());
            file.overwrite_hash(b"something else");
        }
        let canonical = a.table.layout.entry_paths("x").canonical;
        std::fs::write(&canonical, b"{\"disk\":true}").unwrap();

        // ACT
        let report = a.table.check_and_fix().await.unwrap();

        // ASSERT
        assert_eq!(report.repaired_from_peer, 1);
        assert_eq!(report.unrecoverable, 0);
        let from_b = b.table.entry_bytes("x").unwrap();
        assert_eq!(a.table.entry_bytes("x").unwrap(), from_b);
        assert_eq!(std::fs::read(&canonical).unwrap(), from_b);
        let trash = a.table.layout.trash_entries_dir();
        assert_eq!(std::fs::read_dir(&trash).map(|d| d.count()).unwrap_or(0), 0);
        assert_eq!(a.table.get_by_id("x").await.unwrap().title, "precious");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sync_fetches_missing_attachment() {
        // ARRANGE: B holds the entry but lost the file
        let (a, b) = plaintext_pair().await;
        connect(&[&a, &b]).await;
        a.table
            .transaction("doc", |tx| {
                tx.set(note("with file"));
                tx.put_file("cover", b"png".to_vec())
            })
            .await
            .unwrap();
        replicate(&a, &b, "doc").await;
        std::fs::remove_file(b.table.file_path("doc", "cover").unwrap()).unwrap();

        // ACT
        let applied = b.table.sync_from(&b.peer(&a.host)).await.unwrap();

        // ASSERT: nothing newer to apply, the file is back anyway
        assert_eq!(applied, 0);
        assert!(b.table.file_path("doc", "cover").is_some());
        assert_eq!(b.table.read_file("doc", "cover").await.unwrap(), b"png".to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sync_from_older_or_equal_peer_changes_nothing() {
        // ARRANGE: B has A's copy of "same" and a newer copy of "older"
        let (a, b) = plaintext_pair().await;
        a.table.put("same", note("shared")).await.unwrap();
        a.table.put("older", note("from a")).await.unwrap();
        for id in ["same", "older"] {
            b.table
                .receive_change(None, id, &LockKey::new(1, "seed"), a.table.entry_bytes(id).unwrap())
                .await
                .unwrap();
        }
        b.table.put("older", note("newer on b")).await.unwrap();
        let before: Vec<Vec<u8>> = ["same", "older"]
            .iter()
            .map(|id| b.table.entry_bytes(id).unwrap())
            .collect();
        b.peer(&a.host).set_connected(true);
        let mut changes = b.table.subscribe();

        // ACT
        let applied = b.table.sync_from(&b.peer(&a.host)).await.unwrap();

        // ASSERT
        assert_eq!(applied, 0);
        let after: Vec<Vec<u8>> = ["same", "older"]
            .iter()
            .map(|id| b.table.entry_bytes(id).unwrap())
            .collect();
        assert_eq!(after, before);
        assert!(matches!(
            changes.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restored_entry_yields_to_newer_peer_copy() {
        // ARRANGE: A rolls back to a backup while B kept the newer value
        let (a, b) = plaintext_pair().await;
        let backups = tempfile::tempdir().unwrap();
        a.table.put("x", note("v1")).await.unwrap();
        a.registry.backup_all(backups.path()).await.unwrap();
        a.table.put("x", note("v2")).await.unwrap();
        b.table
            .receive_change(None, "x", &LockKey::new(1, "seed"), a.table.entry_bytes("x").unwrap())
            .await
            .unwrap();
        a.registry.restore_all(backups.path(), None).await.unwrap();
        assert_eq!(a.table.get_by_id("x").await.unwrap().title, "v1");

        // ACT
        a.peer(&b.host).set_connected(true);
        let applied = a.table.sync_from(&a.peer(&b.host)).await.unwrap();

        // ASSERT
        assert_eq!(applied, 1);
        assert_eq!(a.table.get_by_id("x").await.unwrap().title, "v2");
    }

    // ============================================================
    // BACKUP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_backup_increments_and_restore() {
        // ARRANGE
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let registry = ClusterRegistry::new(Cluster::standalone(), data.path());
        let table = registry.open_table::<Note>("notes", 1).unwrap();
        table.put("a", note("a1")).await.unwrap();
        table
            .transaction("b", |tx| {
                tx.set(note("b1"));
                tx.put_file("cover", b"b-cover".to_vec())
            })
            .await
            .unwrap();

        // ACT: first increment copies everything
        let first = registry.backup_all(backups.path()).await.unwrap();

        // ASSERT
        assert_eq!(first.increment, "000001");
        assert_eq!(first.entries_total, 2);
        assert_eq!(first.entries_copied, 2);
        assert_eq!(first.files_copied, 1);

        // ACT: second increment only copies what changed
        table.put("a", note("a2")).await.unwrap();
        table.delete("b").await.unwrap();
        table.put("c", note("c1")).await.unwrap();
        let second = registry.backup_all(backups.path()).await.unwrap();

        assert_eq!(second.increment, "000002");
        assert_eq!(second.entries_total, 3);
        assert_eq!(second.entries_copied, 3);
        assert_eq!(second.files_copied, 0);

        let third = registry.backup_all(backups.path()).await.unwrap();
        assert_eq!(third.entries_copied, 0);
        assert_eq!(
            crate::cluster::backup::list_increments(backups.path()).unwrap(),
            vec!["000001", "000002", "000003"]
        );

        // ACT: roll back to the first increment
        let restored = registry
            .restore_all(backups.path(), Some("000001"))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(restored.entries_removed, 1);
        assert_eq!(restored.files_restored, 1);
        assert_eq!(table.get_by_id("a").await.unwrap().title, "a1");
        assert_eq!(table.get_by_id("b").await.unwrap().title, "b1");
        assert_eq!(table.read_file("b", "cover").await.unwrap(), b"b-cover".to_vec());
        assert!(!table.state().contains_key("c"));

        // ACT: forward again to the latest backup
        let latest = registry.restore_all(backups.path(), None).await.unwrap();

        assert_eq!(latest.files_removed, 1);
        assert_eq!(table.get_by_id("a").await.unwrap().title, "a2");
        assert!(!table.contains("b"));
        assert!(table.file_path("b", "cover").is_none());
        assert_eq!(table.get_by_id("c").await.unwrap().title, "c1");
    }

    #[tokio::test]
    async fn test_restore_without_backup_fails() {
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let registry = ClusterRegistry::new(Cluster::standalone(), data.path());
        registry.open_table::<Note>("notes", 1).unwrap();

        assert!(registry.restore_all(backups.path(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_table_registration_fails() {
        let data = tempfile::tempdir().unwrap();
        let registry = ClusterRegistry::new(Cluster::standalone(), data.path());
        registry.open_table::<Note>("notes", 1).unwrap();

        assert!(registry.open_table::<Note>("notes", 1).is_err());
        assert_eq!(registry.table_names(), vec!["notes"]);
    }
}
