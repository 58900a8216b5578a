//! HTTP handlers of the `/wf/db` peer protocol.
//!
//! Every route but `/node-id` authenticates the caller by its `host` query
//! parameter and the client certificate forwarded in [`CLIENT_CERT_HEADER`].
//! Reads are gated on the caller's accepted version, writes on this node's
//! payload version; a mismatch answers 418.

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;

use super::registry::ClusterRegistry;
use crate::error::StoreError;
use crate::peer::PeerNode;
use crate::peer::protocol::*;
use crate::table::ClusterTable;

/// Interval between two keep-alive heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub fn router(registry: Arc<ClusterRegistry>) -> Router {
    let routes = Router::new()
        .route(&format!("/{}", ROUTE_NODE_ID), get(handle_node_id))
        .route(&format!("/{}", ROUTE_STATE), get(handle_state))
        .route(&format!("/{}", ROUTE_ENTRY), get(handle_entry))
        .route(&format!("/{}", ROUTE_FILE), get(handle_file))
        .route(&format!("/{}", ROUTE_CHANGE), post(handle_change))
        .route(&format!("/{}", ROUTE_LOCK), get(handle_lock))
        .route(&format!("/{}", ROUTE_CANCEL), get(handle_cancel))
        .route(&format!("/{}", ROUTE_KEEP_ALIVE), get(handle_keep_alive));

    Router::new()
        .nest(URL_PREFIX, routes)
        .layer(Extension(registry))
}

fn reject(error: StoreError) -> Response {
    tracing::debug!("Rejected peer call: {}", error);
    (error.status_code(), error.to_string()).into_response()
}

fn client_certificate(headers: &HeaderMap) -> Option<String> {
    let encoded = headers.get(CLIENT_CERT_HEADER)?.to_str().ok()?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

fn authenticate(
    registry: &ClusterRegistry,
    headers: &HeaderMap,
    host: Option<&str>,
) -> Result<Arc<PeerNode>, StoreError> {
    let certificate = client_certificate(headers);
    registry
        .cluster()
        .authenticate(host, certificate.as_deref())
}

fn resolve_table(
    registry: &ClusterRegistry,
    peer: &PeerNode,
    name: &str,
) -> Result<Arc<dyn ClusterTable>, StoreError> {
    if !peer.serves_table(name) {
        return Err(StoreError::Forbidden(peer.host().to_string()));
    }
    registry
        .table(name)
        .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
}

/// Authenticates a read and checks that the caller accepts this table's data.
fn authorize_read(
    registry: &ClusterRegistry,
    headers: &HeaderMap,
    host: Option<&str>,
    table: &str,
    version: u32,
) -> Result<Arc<dyn ClusterTable>, StoreError> {
    let peer = authenticate(registry, headers, host)?;
    let table = resolve_table(registry, &peer, table)?;
    if version < table.required_version() {
        return Err(StoreError::IncompatibleVersion {
            required: table.required_version(),
            actual: version,
        });
    }
    Ok(table)
}

/// Authenticates a write and checks that this node can represent the
/// caller's data.
fn authorize_write(
    registry: &ClusterRegistry,
    headers: &HeaderMap,
    query: &LockQuery,
) -> Result<(Arc<PeerNode>, Arc<dyn ClusterTable>), StoreError> {
    let peer = authenticate(registry, headers, query.host.as_deref())?;
    let table = resolve_table(registry, &peer, &query.table)?;
    if table.type_version() < query.min_version {
        return Err(StoreError::IncompatibleVersion {
            required: query.min_version,
            actual: table.type_version(),
        });
    }
    if !is_valid_randomness(&query.randomness) {
        return Err(StoreError::InvalidId(query.randomness.clone()));
    }
    Ok((peer, table))
}

pub async fn handle_node_id(Extension(registry): Extension<Arc<ClusterRegistry>>) -> String {
    registry.cluster().node_id().to_string()
}

pub async fn handle_state(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<StateQuery>,
) -> Response {
    match authorize_read(&registry, &headers, query.host.as_deref(), &query.table, query.version) {
        Ok(table) => (StatusCode::OK, Json(state_to_items(table.state()))).into_response(),
        Err(e) => reject(e),
    }
}

pub async fn handle_entry(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<EntryQuery>,
) -> Response {
    let table = match authorize_read(&registry, &headers, query.host.as_deref(), &query.table, query.version) {
        Ok(table) => table,
        Err(e) => return reject(e),
    };
    match table.entry_bytes(&query.id) {
        Some(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        None => reject(StoreError::not_found(&query.table, &query.id)),
    }
}

pub async fn handle_file(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
) -> Response {
    let table = match authorize_read(&registry, &headers, query.host.as_deref(), &query.table, query.version) {
        Ok(table) => table,
        Err(e) => return reject(e),
    };
    let missing = || StoreError::FileNotFound {
        table: query.table.clone(),
        id: query.id.clone(),
        file: query.file.clone(),
    };
    let Some(path) = table.committed_file(&query.id, &query.file) else {
        return reject(missing());
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => reject(missing()),
        Err(e) => {
            tracing::error!("Failed to read {}: {}", path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Acknowledges immediately; the change is applied on a background task.
pub async fn handle_change(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<LockQuery>,
    body: Bytes,
) -> Response {
    let (peer, table) = match authorize_write(&registry, &headers, &query) {
        Ok(authorized) => authorized,
        Err(e) => return reject(e),
    };
    let key = query.key();
    let bytes = body.to_vec();
    tokio::spawn(async move {
        let host = peer.host().to_string();
        match table.receive_change(Some(peer), &query.id, &key, bytes).await {
            Ok(true) => tracing::debug!("Applied change {}/{} from {}", query.table, query.id, host),
            Ok(false) => tracing::debug!("Ignored stale change {}/{} from {}", query.table, query.id, host),
            Err(e) => tracing::warn!("Change {}/{} from {} rejected: {}", query.table, query.id, host, e),
        }
    });
    (StatusCode::OK, "OK").into_response()
}

pub async fn handle_lock(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<LockQuery>,
) -> Response {
    let (_, table) = match authorize_write(&registry, &headers, &query) {
        Ok(authorized) => authorized,
        Err(e) => return reject(e),
    };
    let outstanding = table.receive_lock(&query.id, query.key()).await;
    (StatusCode::OK, encode_lock_list(&outstanding)).into_response()
}

pub async fn handle_cancel(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<LockQuery>,
) -> Response {
    let (_, table) = match authorize_write(&registry, &headers, &query) {
        Ok(authorized) => authorized,
        Err(e) => return reject(e),
    };
    table.receive_cancel(&query.id, &query.key()).await;
    (StatusCode::OK, "OK").into_response()
}

/// Heartbeat stream held open by a peer's liveness monitor.
pub async fn handle_keep_alive(
    Extension(registry): Extension<Arc<ClusterRegistry>>,
    headers: HeaderMap,
    Query(query): Query<HostQuery>,
) -> Response {
    let peer = match authenticate(&registry, &headers, query.host.as_deref()) {
        Ok(peer) => peer,
        Err(e) => return reject(e),
    };
    tracing::info!("Keep-alive stream opened by {}", peer.host());

    let heartbeats = IntervalStream::new(tokio::time::interval(HEARTBEAT_INTERVAL))
        .map(|_| Ok::<Event, Infallible>(Event::default().data("alive")))
        .take_until(registry.closing().cancelled_owned());
    Sse::new(heartbeats).into_response()
}
