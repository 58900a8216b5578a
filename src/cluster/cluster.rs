use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::peer::{ClientIdentity, NodeDescriptor, PeerNode, PeerSettings};

/// How long a transaction waits for its claim before proceeding anyway,
/// as a multiple of the lock expiration.
pub const LOCK_WAIT_FACTOR: u32 = 10;

/// Runtime settings shared by every table of the process.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// How peers address this node.
    pub self_host: String,
    pub scheme: String,
    /// `None` disables clustering: peers refuse calls without a certificate.
    pub identity: Option<ClientIdentity>,
    pub lock_expiration: Duration,
    pub request_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            self_host: "localhost".to_string(),
            scheme: "https".to_string(),
            identity: None,
            lock_expiration: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// The node's view of the cluster: who it is, who its peers are, and the
/// clock every commit reads from.
pub struct Cluster {
    node_id: String,
    settings: ClusterSettings,
    nodes: Vec<Arc<PeerNode>>,
    self_node: RwLock<Option<Arc<PeerNode>>>,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Cluster {
    pub fn new(
        settings: ClusterSettings,
        descriptors: Vec<NodeDescriptor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let mut builder = reqwest::Client::builder().connect_timeout(settings.request_timeout);
        if let Some(ClientIdentity::Pem { certificate, .. }) = &settings.identity {
            builder = builder.identity(reqwest::Identity::from_pem(certificate.as_bytes())?);
        }
        let client = builder.build()?;

        let peer_settings = PeerSettings {
            scheme: settings.scheme.clone(),
            self_host: settings.self_host.clone(),
            request_timeout: settings.request_timeout,
        };
        let nodes = descriptors
            .into_iter()
            .map(|d| Arc::new(PeerNode::new(d, peer_settings.clone(), client.clone())))
            .collect();

        let node_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!("Cluster node ID: {}", node_id);

        Ok(Arc::new(Self {
            node_id,
            settings,
            nodes,
            self_node: RwLock::new(None),
            enabled: AtomicBool::new(true),
            clock,
        }))
    }

    /// A cluster of one: no peers, system clock.
    pub fn standalone() -> Arc<Self> {
        Self::standalone_with_clock(Arc::new(SystemClock))
    }

    pub fn standalone_with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            settings: ClusterSettings::default(),
            nodes: Vec::new(),
            self_node: RwLock::new(None),
            enabled: AtomicBool::new(false),
            clock,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now_ticks(&self) -> i64 {
        self.clock.now_ticks()
    }

    pub fn lock_expiration(&self) -> Duration {
        self.settings.lock_expiration
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        self.settings.lock_expiration * LOCK_WAIT_FACTOR
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn nodes(&self) -> &[Arc<PeerNode>] {
        &self.nodes
    }

    pub fn self_node(&self) -> Option<Arc<PeerNode>> {
        self.self_node.read().clone()
    }

    pub fn find_node(&self, host: &str) -> Option<Arc<PeerNode>> {
        self.nodes
            .iter()
            .find(|node| node.host().eq_ignore_ascii_case(host))
            .cloned()
    }

    /// Peers that take part in `table` and are reachable, connected or not.
    pub fn reachable_peers(&self, table: &str) -> Vec<Arc<PeerNode>> {
        if !self.is_enabled() {
            return Vec::new();
        }
        self.nodes
            .iter()
            .filter(|node| node.is_reachable() && node.serves_table(table))
            .cloned()
            .collect()
    }

    /// Peers that take part in `table` and currently hold a live connection.
    pub fn connected_peers(&self, table: &str) -> Vec<Arc<PeerNode>> {
        self.reachable_peers(table)
            .into_iter()
            .filter(|node| node.is_connected())
            .collect()
    }

    /// Stops talking to every peer.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        for node in &self.nodes {
            node.set_reachable(false);
            node.set_connected(false);
        }
    }

    /// Finds the configured node that is this process by asking every node
    /// for its ID. The match is excluded from peer traffic; without a match
    /// clustering is switched off.
    pub async fn mark_self(&self) {
        if self.settings.identity.is_none() {
            tracing::warn!(
                "No client certificate configured: clustering disabled, every table runs standalone"
            );
            self.disable();
            return;
        }
        if self.nodes.is_empty() {
            tracing::info!("No cluster nodes configured: running standalone");
            self.disable();
            return;
        }

        let lookups = self.nodes.iter().map(|node| async move {
            let id = node.get_node_id().await;
            (node.clone(), id)
        });
        let answers = futures_util::future::join_all(lookups).await;

        for (node, id) in answers {
            if id.as_deref() == Some(self.node_id.as_str()) {
                tracing::info!("This process is cluster node {}", node.host());
                node.set_reachable(false);
                *self.self_node.write() = Some(node);
            }
        }

        if self.self_node.read().is_none() {
            let hosts: Vec<&str> = self.nodes.iter().map(|n| n.host()).collect();
            tracing::warn!(
                "None of the configured nodes {:?} answered with this node's ID {}. Check that \
                 self_host and the node list point at this server. Clustering disabled.",
                hosts,
                self.node_id
            );
            self.disable();
        }
    }

    /// Checks an incoming `/wf/db` call.
    ///
    /// `host` is the caller's self-reported address; `certificate` is the PEM
    /// forwarded by the TLS terminator.
    pub fn authenticate(
        &self,
        host: Option<&str>,
        certificate: Option<&str>,
    ) -> std::result::Result<Arc<PeerNode>, StoreError> {
        let host = host.ok_or(StoreError::Unauthorized)?;
        let node = self
            .find_node(host)
            .ok_or_else(|| StoreError::Forbidden(host.to_string()))?;
        if !self.is_enabled() {
            return Err(StoreError::Forbidden(host.to_string()));
        }

        let plaintext = matches!(self.settings.identity, Some(ClientIdentity::Plaintext));
        if plaintext && !node.has_validators() {
            return Ok(node);
        }

        let certificate = certificate.ok_or(StoreError::Unauthorized)?;
        if node.accepts_certificate(certificate) {
            Ok(node)
        } else {
            tracing::warn!("Rejected certificate presented for {}", host);
            Err(StoreError::Forbidden(host.to_string()))
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("nodes", &self.nodes)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
