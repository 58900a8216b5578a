//! Peer Network Protocol
//!
//! Routes and query shapes of the `/wf/db` namespace, shared by the client in
//! `peer::client` and the handlers in `cluster::handlers`.
//!
//! | Route | Method | Purpose |
//! |---|---|---|
//! | `/node-id` | GET | random process ID, plaintext |
//! | `/state` | GET | `[{Key, Value: MinimalTableValue}]` |
//! | `/entry` | GET | raw entry bytes |
//! | `/file` | GET | raw attachment bytes |
//! | `/change` | POST | committed entry bytes, applied asynchronously |
//! | `/lock` | GET | register a claim, returns outstanding claims |
//! | `/cancel` | GET | remove a claim |
//! | `/keep-alive` | GET | heartbeat event stream |

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::locking::LockKey;
use crate::value::MinimalTableValue;

pub const URL_PREFIX: &str = "/wf/db";

pub const ROUTE_NODE_ID: &str = "node-id";
pub const ROUTE_STATE: &str = "state";
pub const ROUTE_ENTRY: &str = "entry";
pub const ROUTE_FILE: &str = "file";
pub const ROUTE_CHANGE: &str = "change";
pub const ROUTE_LOCK: &str = "lock";
pub const ROUTE_CANCEL: &str = "cancel";
pub const ROUTE_KEEP_ALIVE: &str = "keep-alive";

/// Header carrying the caller's client certificate (base64 of the PEM), set
/// by the TLS terminator in front of the node.
pub const CLIENT_CERT_HEADER: &str = "x-client-cert";

/// Change pushes may carry large payloads; their timeout is scaled up.
pub const CHANGE_TIMEOUT_FACTOR: u32 = 4;

static RANDOMNESS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{1,64}$").expect("static pattern is valid"));

/// Query of `/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateQuery {
    pub table: String,
    pub version: u32,
    pub host: Option<String>,
}

/// Query of `/entry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryQuery {
    pub table: String,
    pub version: u32,
    pub id: String,
    pub host: Option<String>,
}

/// Query of `/file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileQuery {
    pub table: String,
    pub version: u32,
    pub id: String,
    pub file: String,
    pub host: Option<String>,
}

/// Query of `/lock`, `/cancel` and `/change`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockQuery {
    pub table: String,
    #[serde(rename = "min-version")]
    pub min_version: u32,
    pub id: String,
    pub timestamp: i64,
    pub randomness: String,
    pub host: Option<String>,
}

impl LockQuery {
    pub fn key(&self) -> LockKey {
        LockKey::new(self.timestamp, self.randomness.clone())
    }
}

/// Query of `/keep-alive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostQuery {
    pub host: Option<String>,
}

/// One element of the `/state` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateItem {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: MinimalTableValue,
}

pub fn state_to_items(state: BTreeMap<String, MinimalTableValue>) -> Vec<StateItem> {
    state
        .into_iter()
        .map(|(key, value)| StateItem { key, value })
        .collect()
}

pub fn items_to_state(items: Vec<StateItem>) -> BTreeMap<String, MinimalTableValue> {
    items.into_iter().map(|item| (item.key, item.value)).collect()
}

pub fn is_valid_randomness(randomness: &str) -> bool {
    RANDOMNESS_PATTERN.is_match(randomness)
}

/// `timestamp&randomness` pairs joined with `;`.
pub fn encode_lock_list(keys: &[LockKey]) -> String {
    keys.iter()
        .map(|key| format!("{}&{}", key.timestamp, key.randomness))
        .collect::<Vec<_>>()
        .join(";")
}

/// Parses a `/lock` response. Malformed items are skipped.
pub fn decode_lock_list(body: &str) -> Vec<LockKey> {
    body.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| {
            let (timestamp, randomness) = item.split_once('&')?;
            let timestamp = timestamp.parse::<i64>().ok()?;
            if !is_valid_randomness(randomness) {
                tracing::warn!("Ignoring malformed lock item {:?}", item);
                return None;
            }
            Some(LockKey::new(timestamp, randomness))
        })
        .collect()
}
