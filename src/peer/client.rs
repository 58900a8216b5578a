//! Outbound RPC client for one cluster peer.
//!
//! Every call except `get_node_id` and the liveness monitor is skipped while
//! the peer is disconnected, so transactions never block on a node that is
//! known to be down. Failures are logged and reported as `None` / `false`;
//! they never reach the transaction caller.

use anyhow::Result;
use reqwest::{RequestBuilder, StatusCode};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::protocol::*;
use super::types::{CertificateValidator, NodeDescriptor, PeerSettings};
use crate::locking::LockKey;
use crate::storage::entry_file::{remove_if_exists, write_synced};
use crate::value::MinimalTableValue;

/// Pause between two liveness connection attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Attempts for idempotent reads.
const READ_ATTEMPTS: usize = 2;

pub struct PeerNode {
    host: String,
    tables: Option<HashSet<String>>,
    validators: Vec<Arc<dyn CertificateValidator>>,
    reachable: AtomicBool,
    connected: AtomicBool,
    client: reqwest::Client,
    settings: PeerSettings,
}

impl std::fmt::Debug for PeerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNode")
            .field("host", &self.host)
            .field("reachable", &self.is_reachable())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PeerNode {
    pub fn new(descriptor: NodeDescriptor, settings: PeerSettings, client: reqwest::Client) -> Self {
        Self {
            host: descriptor.host,
            tables: descriptor.tables.map(|t| t.into_iter().collect()),
            validators: descriptor.validators,
            reachable: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            client,
            settings,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Whether this peer takes part in `table`.
    pub fn serves_table(&self, table: &str) -> bool {
        self.tables
            .as_ref()
            .map(|tables| tables.contains(table))
            .unwrap_or(true)
    }

    /// Whether a certificate presented by this peer is trusted.
    pub fn accepts_certificate(&self, certificate_pem: &str) -> bool {
        self.validators
            .iter()
            .any(|validator| validator.validate(certificate_pem, &self.host))
    }

    pub fn has_validators(&self) -> bool {
        !self.validators.is_empty()
    }

    fn url(&self, route: &str) -> String {
        format!(
            "{}://{}{}/{}",
            self.settings.scheme, self.host, URL_PREFIX, route
        )
    }

    fn host_param(&self) -> [(&'static str, &str); 1] {
        [("host", self.settings.self_host.as_str())]
    }

    // --- Identity & liveness ---

    /// Asks the peer for its random process ID.
    pub async fn get_node_id(&self) -> Option<String> {
        let response = self
            .send_with_retry(
                || {
                    self.client
                        .get(self.url(ROUTE_NODE_ID))
                        .timeout(self.settings.request_timeout)
                },
                READ_ATTEMPTS,
            )
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => Some(text.trim().to_string()),
                Err(e) => {
                    tracing::warn!("node-id from {} unreadable: {}", self.host, e);
                    None
                }
            },
            Ok(resp) => {
                tracing::warn!("node-id from {} failed: {}", self.host, resp.status());
                None
            }
            Err(e) => {
                tracing::warn!("node-id from {} failed: {}", self.host, e);
                None
            }
        }
    }

    /// Keeps a heartbeat stream open to the peer until `cancel` fires.
    ///
    /// Each successful handshake flips the peer to connected and invokes
    /// `on_connected`; when the stream ends the peer is disconnected and the
    /// loop retries after [`RECONNECT_BACKOFF`].
    pub async fn monitor_connection<F>(self: Arc<Self>, cancel: CancellationToken, on_connected: F)
    where
        F: Fn(Arc<PeerNode>) + Send + Sync + 'static,
    {
        tracing::info!("Starting liveness monitor for {}", self.host);
        while !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.hold_connection(&on_connected) => {
                    if let Err(e) = result {
                        tracing::debug!("Keep-alive to {} failed: {}", self.host, e);
                    }
                }
            }
            if self.is_connected() {
                tracing::warn!("Disconnected from {}", self.host);
                self.set_connected(false);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
        self.set_connected(false);
        tracing::info!("Stopped liveness monitor for {}", self.host);
    }

    async fn hold_connection<F>(self: &Arc<Self>, on_connected: &F) -> Result<()>
    where
        F: Fn(Arc<PeerNode>),
    {
        let request = self
            .client
            .get(self.url(ROUTE_KEEP_ALIVE))
            .query(&self.host_param())
            .send();
        let mut response = tokio::time::timeout(self.settings.request_timeout, request).await??;
        if !response.status().is_success() {
            anyhow::bail!("keep-alive rejected: {}", response.status());
        }

        self.set_connected(true);
        tracing::info!("Connected to {}", self.host);
        on_connected(self.clone());

        // Heartbeats arrive every second; silence for a full request timeout
        // means the peer is gone even if the socket is still open.
        loop {
            match tokio::time::timeout(self.settings.request_timeout, response.chunk()).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => anyhow::bail!("heartbeat timed out"),
            }
        }
    }

    // --- Pulls ---

    /// Table-wide minimal state of the peer.
    pub async fn pull_state(
        &self,
        table: &str,
        version: u32,
    ) -> Option<BTreeMap<String, MinimalTableValue>> {
        if !self.is_connected() {
            return None;
        }
        let query = StateQuery {
            table: table.to_string(),
            version,
            host: Some(self.settings.self_host.clone()),
        };
        let response = self
            .send_with_retry(
                || {
                    self.client
                        .get(self.url(ROUTE_STATE))
                        .query(&query)
                        .timeout(self.settings.request_timeout)
                },
                READ_ATTEMPTS,
            )
            .await;
        let response = self.expect_success(ROUTE_STATE, table, response)?;
        match response.json::<Vec<StateItem>>().await {
            Ok(items) => Some(items_to_state(items)),
            Err(e) => {
                tracing::warn!("state of {} from {} unreadable: {}", table, self.host, e);
                None
            }
        }
    }

    /// Full serialized entry from the peer.
    pub async fn pull_entry(&self, table: &str, version: u32, id: &str) -> Option<Vec<u8>> {
        if !self.is_connected() {
            return None;
        }
        let query = EntryQuery {
            table: table.to_string(),
            version,
            id: id.to_string(),
            host: Some(self.settings.self_host.clone()),
        };
        let response = self
            .send_with_retry(
                || {
                    self.client
                        .get(self.url(ROUTE_ENTRY))
                        .query(&query)
                        .timeout(self.settings.request_timeout)
                },
                READ_ATTEMPTS,
            )
            .await;
        let response = self.expect_success(ROUTE_ENTRY, table, response)?;
        match response.bytes().await {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(e) => {
                tracing::warn!("entry {}/{} from {} unreadable: {}", table, id, self.host, e);
                None
            }
        }
    }

    /// Downloads an attachment straight to `destination`.
    pub async fn pull_file(
        &self,
        table: &str,
        version: u32,
        id: &str,
        file: &str,
        destination: &Path,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        let query = FileQuery {
            table: table.to_string(),
            version,
            id: id.to_string(),
            file: file.to_string(),
            host: Some(self.settings.self_host.clone()),
        };
        let response = self
            .send_with_retry(
                || {
                    self.client
                        .get(self.url(ROUTE_FILE))
                        .query(&query)
                        .timeout(self.settings.request_timeout * CHANGE_TIMEOUT_FACTOR)
                },
                READ_ATTEMPTS,
            )
            .await;
        let Some(response) = self.expect_success(ROUTE_FILE, table, response) else {
            return false;
        };
        let written = match response.bytes().await {
            Ok(bytes) => write_synced(destination, &bytes),
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "file {}/{}/{} from {} failed: {}",
                    table,
                    id,
                    file,
                    self.host,
                    e
                );
                let _ = remove_if_exists(destination);
                false
            }
        }
    }

    // --- Lock protocol ---

    /// Announces a claim; returns the peer's outstanding claims for the entry.
    pub async fn send_lock(
        &self,
        table: &str,
        min_version: u32,
        id: &str,
        key: &LockKey,
    ) -> Option<Vec<LockKey>> {
        if !self.is_connected() {
            return None;
        }
        let query = self.lock_query(table, min_version, id, key);
        let response = self
            .send_with_retry(
                || {
                    self.client
                        .get(self.url(ROUTE_LOCK))
                        .query(&query)
                        .timeout(self.settings.request_timeout)
                },
                READ_ATTEMPTS,
            )
            .await;
        let response = self.expect_success(ROUTE_LOCK, table, response)?;
        match response.text().await {
            Ok(body) => Some(decode_lock_list(&body)),
            Err(e) => {
                tracing::warn!("lock list from {} unreadable: {}", self.host, e);
                None
            }
        }
    }

    pub async fn send_cancel(&self, table: &str, min_version: u32, id: &str, key: &LockKey) -> bool {
        if !self.is_connected() {
            return false;
        }
        let query = self.lock_query(table, min_version, id, key);
        let response = self
            .send_with_retry(
                || {
                    self.client
                        .get(self.url(ROUTE_CANCEL))
                        .query(&query)
                        .timeout(self.settings.request_timeout)
                },
                READ_ATTEMPTS,
            )
            .await;
        self.expect_success(ROUTE_CANCEL, table, response).is_some()
    }

    /// Pushes a committed entry. The peer acknowledges before applying it.
    pub async fn push_change(
        &self,
        table: &str,
        min_version: u32,
        id: &str,
        key: &LockKey,
        bytes: Vec<u8>,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        let query = self.lock_query(table, min_version, id, key);
        let response = self
            .client
            .post(self.url(ROUTE_CHANGE))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .timeout(self.settings.request_timeout * CHANGE_TIMEOUT_FACTOR)
            .send()
            .await
            .map_err(anyhow::Error::from);
        self.expect_success(ROUTE_CHANGE, table, response).is_some()
    }

    fn lock_query(&self, table: &str, min_version: u32, id: &str, key: &LockKey) -> LockQuery {
        LockQuery {
            table: table.to_string(),
            min_version,
            id: id.to_string(),
            timestamp: key.timestamp,
            randomness: key.randomness.clone(),
            host: Some(self.settings.self_host.clone()),
        }
    }

    fn expect_success(
        &self,
        route: &str,
        table: &str,
        response: Result<reqwest::Response>,
    ) -> Option<reqwest::Response> {
        match response {
            Ok(resp) if resp.status().is_success() => Some(resp),
            Ok(resp) if resp.status() == StatusCode::IM_A_TEAPOT => {
                tracing::warn!(
                    "{} on {} for table {}: incompatible schema version",
                    route,
                    self.host,
                    table
                );
                None
            }
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                tracing::debug!("{} on {} for table {}: not found", route, self.host, table);
                None
            }
            Ok(resp) => {
                tracing::warn!("{} on {} for table {}: {}", route, self.host, table, resp.status());
                None
            }
            Err(e) => {
                tracing::warn!("{} on {} for table {} failed: {}", route, self.host, table, e);
                None
            }
        }
    }

    // --- HTTP helper with backoff ---

    async fn send_with_retry<B>(&self, build: B, attempts: usize) -> Result<reqwest::Response>
    where
        B: Fn() -> RequestBuilder,
    {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}
