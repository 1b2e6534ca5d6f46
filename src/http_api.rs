//! Public HTTP API and internal peer routes.
//!
//! | Route | Semantics |
//! |-------|-----------|
//! | `PUT /api/v1/namespaces/{ns}/config/{key}` | leader-only write (307 to leader otherwise) |
//! | `GET /api/v1/namespaces/{ns}/config[/{key}]` | barrier-gated read, blob-resolved |
//! | `DELETE /api/v1/namespaces/{ns}/config/{key}` | leader-only, 404 when absent |
//! | `PUT/GET/DELETE /api/v1/namespaces[/{ns}]` | namespace CRUD, same rules |
//! | `GET /api/v1/namespaces/{ns}/audit?limit=N` | newest-first audit, cap 1000 |
//! | `PUT/GET /internal/blobs/{id}` | token-gated peer blob transfer |
//! | `GET /health`, `GET /health/ready` | liveness / readiness |
//! | `GET /metrics` | prometheus text |
//!
//! Namespace path segments arrive percent-encoded (`%2Ft1` for `/t1`).
//! Writes never pass the read barrier; reads always do (failure handling per
//! the configured mode). Internal routes compare the cluster token in
//! constant time and enforce the blob size ceiling on the wire even when
//! `Content-Length` is absent or lies.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::{Bytes, HttpBody};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::blob_resolver::{BlobResolver, ResolveError};
use crate::blob_store::BlobStore;
use crate::cluster::{ClusterHandle, CLUSTER_TOKEN_HEADER};
use crate::config::{FailureMode, NodeConfig};
use crate::errors::ApiError;
use crate::metrics;
use crate::raft::RaftNode;
use crate::read_barrier::ReadBarrier;
use crate::store::{AppliedStore, AuditEvent, ConfigEntry, Namespace};
use crate::writer::{WriteFailure, WriteOrchestrator};

/// Everything the handlers need, shared across connections.
pub struct ApiContext {
    pub config: Arc<NodeConfig>,
    pub cluster: ClusterHandle,
    pub raft: Arc<RaftNode>,
    pub store: AppliedStore,
    pub blobs: Arc<BlobStore>,
    pub writer: Arc<WriteOrchestrator>,
    pub resolver: Arc<BlobResolver>,
    pub barrier: Arc<ReadBarrier>,
}

// ── Server ───────────────────────────────────────────────────────────────────

/// Starts the HTTP server on the configured address. Runs until process
/// exit; spawn it in a background task.
pub async fn serve(ctx: Arc<ApiContext>) {
    let bind = ctx.config.http_addr.clone();
    let addr: SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind, error = %e, "invalid HTTP bind address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, hyper::Error>(handle(req, ctx).await) }
            }))
        }
    });

    info!(addr = %addr, "HTTP API listening");
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        error!(error = %e, "HTTP server error");
    }
}

async fn handle(req: Request<Body>, ctx: Arc<ApiContext>) -> Response<Body> {
    match route(req, &ctx).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn route(req: Request<Body>, ctx: &ApiContext) -> Result<Response<Body>, ApiError> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let author = parts
        .headers
        .get("x-author")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    match (parts.method.as_str(), segments.as_slice()) {
        // ── Health & observability ──────────────────────────────────────────
        ("GET", ["health"]) => Ok(json_response(200, &json!({ "status": "ok" }))),
        ("GET", ["health", "ready"]) => Ok(health_ready(ctx)),
        ("GET", ["metrics"]) => Ok(Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(metrics::render()))
            .expect("static response")),

        // ── Namespaces ──────────────────────────────────────────────────────
        ("GET", ["api", "v1", "namespaces"]) => list_namespaces(ctx).await,
        ("PUT", ["api", "v1", "namespaces", ns]) => {
            let ns = decode_segment(ns)?;
            put_namespace(ctx, &ns, author, &parts, body).await
        }
        ("GET", ["api", "v1", "namespaces", ns]) => {
            let ns = decode_segment(ns)?;
            get_namespace(ctx, &ns).await
        }
        ("DELETE", ["api", "v1", "namespaces", ns]) => {
            let ns = decode_segment(ns)?;
            delete_namespace(ctx, &ns, author, &parts).await
        }

        // ── Config entries ──────────────────────────────────────────────────
        ("GET", ["api", "v1", "namespaces", ns, "config"]) => {
            let ns = decode_segment(ns)?;
            list_config(ctx, &ns).await
        }
        ("PUT", ["api", "v1", "namespaces", ns, "config", key]) => {
            let ns = decode_segment(ns)?;
            let key = decode_segment(key)?;
            put_config(ctx, &ns, &key, author, &parts, body).await
        }
        ("GET", ["api", "v1", "namespaces", ns, "config", key]) => {
            let ns = decode_segment(ns)?;
            let key = decode_segment(key)?;
            get_config(ctx, &ns, &key).await
        }
        ("DELETE", ["api", "v1", "namespaces", ns, "config", key]) => {
            let ns = decode_segment(ns)?;
            let key = decode_segment(key)?;
            delete_config(ctx, &ns, &key, author, &parts).await
        }

        // ── Audit ───────────────────────────────────────────────────────────
        ("GET", ["api", "v1", "namespaces", ns, "audit"]) => {
            let ns = decode_segment(ns)?;
            list_audit(ctx, &ns, parts.uri.query()).await
        }

        // ── Internal peer routes ────────────────────────────────────────────
        ("PUT", ["internal", "blobs", id]) => {
            check_token(ctx, &parts)?;
            internal_put_blob(ctx, id, &parts, body).await
        }
        ("GET", ["internal", "blobs", id]) => {
            check_token(ctx, &parts)?;
            internal_get_blob(ctx, id).await
        }

        _ => Err(ApiError::NotFound),
    }
}

// ── Write handlers ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PutConfigBody {
    value: String,
    #[serde(rename = "type", default)]
    entry_type: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PutNamespaceBody {
    #[serde(default)]
    description: Option<String>,
    owner: String,
    #[serde(default)]
    ts: Option<i64>,
}

async fn put_config(
    ctx: &ApiContext,
    ns: &str,
    key: &str,
    author: String,
    parts: &hyper::http::request::Parts,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    require_leader(ctx, parts)?;
    check_name(ns)?;
    check_name(key)?;

    let cap = ctx.config.max_decompressed_size_bytes + 4096;
    let raw = read_body_capped(body, cap, parts).await?;
    let body: PutConfigBody = serde_json::from_slice(&raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;

    if ctx.store.get_namespace(ns)?.is_none() {
        return Err(ApiError::NotFound);
    }

    let entry_type = body.entry_type.unwrap_or_else(|| "string".to_string());
    let ts = body.ts.unwrap_or_else(now_millis);
    let value = body.value;

    let outcome = ctx
        .writer
        .put_config(ns, key, value.clone(), entry_type.clone(), author.clone(), ts)
        .await;
    check_outcome(outcome.error)?;

    // The authoritative version is assigned on apply; 0 marks "pending" and
    // the next read observes the real one.
    Ok(json_response(
        200,
        &json!({
            "namespace": ns,
            "key": key,
            "value": value,
            "type": entry_type,
            "version": 0,
            "updatedAt": ts,
            "updatedBy": author,
        }),
    ))
}

async fn delete_config(
    ctx: &ApiContext,
    ns: &str,
    key: &str,
    author: String,
    parts: &hyper::http::request::Parts,
) -> Result<Response<Body>, ApiError> {
    require_leader(ctx, parts)?;
    if ctx.store.get(ns, key)?.is_none() {
        return Err(ApiError::NotFound);
    }

    let ts = now_millis();
    let outcome = ctx.writer.delete_config(ns, key, author, ts).await;
    check_outcome(outcome.error)?;

    Ok(json_response(
        200,
        &json!({ "deleted": true, "namespace": ns, "key": key }),
    ))
}

async fn put_namespace(
    ctx: &ApiContext,
    ns: &str,
    author: String,
    parts: &hyper::http::request::Parts,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    require_leader(ctx, parts)?;
    check_name(ns)?;

    let raw = read_body_capped(body, 1024 * 1024, parts).await?;
    let body: PutNamespaceBody = serde_json::from_slice(&raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;

    let ts = body.ts.unwrap_or_else(now_millis);
    let outcome = ctx
        .writer
        .put_namespace(ns, body.description.clone(), body.owner.clone(), author, ts)
        .await;
    check_outcome(outcome.error)?;

    Ok(json_response(
        200,
        &json!({
            "path": ns,
            "description": body.description,
            "owner": body.owner,
            "createdAt": ts,
        }),
    ))
}

async fn delete_namespace(
    ctx: &ApiContext,
    ns: &str,
    author: String,
    parts: &hyper::http::request::Parts,
) -> Result<Response<Body>, ApiError> {
    require_leader(ctx, parts)?;
    if ctx.store.get_namespace(ns)?.is_none() {
        return Err(ApiError::NotFound);
    }

    let outcome = ctx.writer.delete_namespace(ns, author, now_millis()).await;
    check_outcome(outcome.error)?;

    Ok(json_response(200, &json!({ "deleted": true, "path": ns })))
}

// ── Read handlers ────────────────────────────────────────────────────────────

async fn get_config(ctx: &ApiContext, ns: &str, key: &str) -> Result<Response<Body>, ApiError> {
    apply_barrier(ctx).await?;
    let entry = ctx.store.get(ns, key)?.ok_or(ApiError::NotFound)?;
    let value = resolve_value(ctx, &entry).await?;
    Ok(json_response(200, &entry_json(&entry, value)))
}

async fn list_config(ctx: &ApiContext, ns: &str) -> Result<Response<Body>, ApiError> {
    apply_barrier(ctx).await?;
    let entries = ctx.store.list(ns)?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in &entries {
        let value = resolve_value(ctx, entry).await?;
        out.push(entry_json(entry, value));
    }
    Ok(json_response(200, &json!(out)))
}

async fn get_namespace(ctx: &ApiContext, ns: &str) -> Result<Response<Body>, ApiError> {
    apply_barrier(ctx).await?;
    let namespace = ctx.store.get_namespace(ns)?.ok_or(ApiError::NotFound)?;
    Ok(json_response(200, &namespace_json(&namespace)))
}

async fn list_namespaces(ctx: &ApiContext) -> Result<Response<Body>, ApiError> {
    apply_barrier(ctx).await?;
    let namespaces: Vec<_> = ctx
        .store
        .list_namespaces()?
        .iter()
        .map(namespace_json)
        .collect();
    Ok(json_response(200, &json!(namespaces)))
}

async fn list_audit(
    ctx: &ApiContext,
    ns: &str,
    query: Option<&str>,
) -> Result<Response<Body>, ApiError> {
    apply_barrier(ctx).await?;
    let limit = parse_limit(query)?;
    let events: Vec<_> = ctx.store.audit_events(ns, limit)?.iter().map(audit_json).collect();
    Ok(json_response(200, &json!(events)))
}

fn health_ready(ctx: &ApiContext) -> Response<Body> {
    let state = ctx.cluster.state();
    let leader = ctx.raft.leader_endpoint();
    let body = json!({
        "role": state.as_str(),
        "leaderKnown": leader.is_some(),
        "leader": leader,
        "term": ctx.raft.term(),
    });
    json_response(if state.ready() { 200 } else { 503 }, &body)
}

// ── Internal blob handlers ───────────────────────────────────────────────────

async fn internal_put_blob(
    ctx: &ApiContext,
    id: &str,
    parts: &hyper::http::request::Parts,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    if !crate::blob_store::is_valid_id(id) {
        return Err(ApiError::BadRequest(format!("malformed blob id {id:?}")));
    }
    // Idempotent: a blob we already hold is an immediate ack.
    if ctx.blobs.exists(id)? {
        return Ok(Response::builder()
            .status(204)
            .body(Body::empty())
            .expect("static response"));
    }

    let compressed = read_body_capped(body, ctx.config.max_blob_size_bytes, parts).await?;

    let blobs = ctx.blobs.clone();
    let id_owned = id.to_string();
    let created = tokio::task::spawn_blocking(move || {
        blobs.put_compressed(&id_owned, &mut std::io::Cursor::new(compressed))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Response::builder()
        .status(if created { 201 } else { 204 })
        .body(Body::empty())
        .expect("static response"))
}

async fn internal_get_blob(ctx: &ApiContext, id: &str) -> Result<Response<Body>, ApiError> {
    let blobs = ctx.blobs.clone();
    let id_owned = id.to_string();
    let file = tokio::task::spawn_blocking(move || blobs.open_read(&id_owned))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??
        .ok_or(ApiError::NotFound)?;

    // Stream the compressed file without buffering it whole.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = file;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(Body::wrap_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn require_leader(ctx: &ApiContext, parts: &hyper::http::request::Parts) -> Result<(), ApiError> {
    if ctx.raft.is_leader() {
        return Ok(());
    }
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    match ctx.raft.leader_endpoint() {
        Some(leader) => Err(ApiError::NotLeader {
            leader: format!("{leader}{path_and_query}"),
        }),
        None => Err(ApiError::NoLeader),
    }
}

/// Applies the read barrier per the configured failure mode. `stale` serves
/// anyway with a warning; the other modes convert the failure to an error.
async fn apply_barrier(ctx: &ApiContext) -> Result<(), ApiError> {
    match ctx.barrier.wait_for_read().await {
        Ok(()) => Ok(()),
        Err(e) => match ctx.barrier.failure_mode() {
            FailureMode::Reject => Err(ApiError::ReadBarrierRejected(e.to_string())),
            FailureMode::Timeout => Err(ApiError::ReadBarrierTimeout(e.to_string())),
            FailureMode::Stale => {
                warn!(error = %e, "read barrier failed; serving possibly stale data");
                Ok(())
            }
        },
    }
}

async fn resolve_value(ctx: &ApiContext, entry: &ConfigEntry) -> Result<String, ApiError> {
    ctx.resolver.resolve(entry).await.map_err(|e| match e {
        ResolveError::Unavailable(id) => ApiError::BlobUnavailable(id),
        ResolveError::Blob(blob) => blob.into(),
        other => ApiError::Internal(other.to_string()),
    })
}

fn check_outcome(error: Option<WriteFailure>) -> Result<(), ApiError> {
    match error {
        None => Ok(()),
        Some(WriteFailure::Replication(msg)) => Err(ApiError::ReplicationFailed(msg)),
        Some(WriteFailure::BlobQuorum(e)) => Err(ApiError::BlobReplication(e)),
        Some(WriteFailure::BlobStore(e)) => Err(e.into()),
    }
}

/// Constant-time cluster token gate. An unconfigured token refuses everyone.
fn check_token(ctx: &ApiContext, parts: &hyper::http::request::Parts) -> Result<(), ApiError> {
    let presented = parts
        .headers
        .get(CLUSTER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token_matches(&ctx.config.cluster_token, presented) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn token_matches(configured: &str, presented: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    bool::from(configured.as_bytes().ct_eq(presented.as_bytes()))
}

fn decode_segment(segment: &str) -> Result<String, ApiError> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|e| ApiError::BadRequest(format!("invalid path segment: {e}")))
}

fn check_name(s: &str) -> Result<(), ApiError> {
    if s.is_empty() || s.contains('\0') {
        return Err(ApiError::BadRequest(
            "names must be non-empty and free of NUL bytes".to_string(),
        ));
    }
    Ok(())
}

fn parse_limit(query: Option<&str>) -> Result<usize, ApiError> {
    let Some(query) = query else { return Ok(100) };
    for pair in query.split('&') {
        if let Some(raw) = pair.strip_prefix("limit=") {
            return raw
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("invalid limit {raw:?}")));
        }
    }
    Ok(100)
}

/// Reads the whole body, rejecting it the moment it crosses `cap` — the
/// declared `Content-Length` is checked first but never trusted.
async fn read_body_capped(
    mut body: Body,
    cap: u64,
    parts: &hyper::http::request::Parts,
) -> Result<Vec<u8>, ApiError> {
    if let Some(declared) = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if declared > cap {
            return Err(ApiError::PayloadTooLarge(format!(
                "declared length {declared} exceeds the {cap}-byte cap"
            )));
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ApiError::Internal(e.to_string()))?;
        if bytes.len() as u64 + chunk.len() as u64 > cap {
            return Err(ApiError::PayloadTooLarge(format!(
                "body exceeds the {cap}-byte cap"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn entry_json(entry: &ConfigEntry, value: String) -> serde_json::Value {
    json!({
        "namespace": entry.namespace,
        "key": entry.key,
        "value": value,
        "blobId": entry.blob_id,
        "type": entry.entry_type,
        "version": entry.version,
        "updatedAt": entry.updated_at,
        "updatedBy": entry.updated_by,
    })
}

fn namespace_json(ns: &Namespace) -> serde_json::Value {
    json!({
        "path": ns.path,
        "description": ns.description,
        "owner": ns.owner,
        "createdAt": ns.created_at,
    })
}

fn audit_json(event: &AuditEvent) -> serde_json::Value {
    json!({
        "id": event.id,
        "ts": event.ts,
        "namespace": event.namespace,
        "key": event.key,
        "action": event.action.as_str(),
        "actor": event.actor,
        "oldValue": event.old_value,
        "newValue": event.new_value,
    })
}

fn json_response(status: u16, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid response")
}

fn error_response(err: &ApiError) -> Response<Body> {
    let mut builder = Response::builder().status(err.status());
    if let ApiError::NotLeader { leader } = err {
        // The redirect target already embeds the original path and query.
        builder = builder.header(LOCATION, leader.as_str());
    }
    if let Some(seconds) = err.retry_after() {
        builder = builder.header(RETRY_AFTER, seconds.to_string());
    }
    builder
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "error": err.to_string() }).to_string()))
        .expect("valid response")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_gate_refuses_when_unconfigured() {
        assert!(!token_matches("", ""));
        assert!(!token_matches("", "anything"));
    }

    #[test]
    fn token_gate_compares_exactly() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secret2"));
        assert!(!token_matches("secret", "Secret"));
        assert!(!token_matches("secret", ""));
    }

    #[test]
    fn limit_parsing() {
        assert_eq!(parse_limit(None).unwrap(), 100);
        assert_eq!(parse_limit(Some("limit=5")).unwrap(), 5);
        assert_eq!(parse_limit(Some("other=1&limit=250")).unwrap(), 250);
        assert!(parse_limit(Some("limit=abc")).is_err());
        assert!(parse_limit(Some("limit=-1")).is_err());
    }

    #[test]
    fn segment_decoding() {
        assert_eq!(decode_segment("%2Ft1").unwrap(), "/t1");
        assert_eq!(decode_segment("plain").unwrap(), "plain");
        assert_eq!(decode_segment("%2Fteams%2Fpayments").unwrap(), "/teams/payments");
    }

    #[test]
    fn entry_json_shape() {
        let entry = ConfigEntry {
            namespace: "/t1".into(),
            key: "flag".into(),
            value: None,
            blob_id: Some("ab".repeat(32)),
            entry_type: "string".into(),
            version: 3,
            updated_at: 42,
            updated_by: "alice".into(),
        };
        let value = entry_json(&entry, "resolved".into());
        assert_eq!(value["value"], "resolved");
        assert_eq!(value["version"], 3);
        assert_eq!(value["type"], "string");
        assert_eq!(value["updatedAt"], 42);
    }

    #[test]
    fn error_responses_carry_headers() {
        let redirect = error_response(&ApiError::NotLeader {
            leader: "http://leader:4200/api/v1/namespaces/%2Ft1/config/k".into(),
        });
        assert_eq!(redirect.status(), 307);
        assert_eq!(
            redirect.headers().get(LOCATION).unwrap(),
            "http://leader:4200/api/v1/namespaces/%2Ft1/config/k"
        );

        let unavailable = error_response(&ApiError::NoLeader);
        assert_eq!(unavailable.status(), 503);
        assert!(unavailable.headers().get(RETRY_AFTER).is_some());

        let timeout = error_response(&ApiError::ReadBarrierTimeout("late".into()));
        assert_eq!(timeout.status(), 504);
        assert!(timeout.headers().get(RETRY_AFTER).is_none());
    }

    #[test]
    fn name_validation() {
        assert!(check_name("/t1").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("a\0b").is_err());
    }
}
