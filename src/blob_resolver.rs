//! Read-side blob resolution.
//!
//! Given a config entry, produce its value. Inline entries are trivial;
//! blob-backed entries read the local store first and fall back to fetching
//! the compressed blob from peers, filling the local store on the way so the
//! next read is local.
//!
//! Cold misses are gated per blob id: one fetcher at a time per blob, so a
//! burst of readers on the same missing blob produces one peer fetch, not a
//! thundering herd. Gates stay in the map after release — removing them
//! would let two latecomers race a fresh gate while a third still holds the
//! old one.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::blob_store::BlobStore;
use crate::cluster::{ClusterHandle, CLUSTER_TOKEN_HEADER};
use crate::store::ConfigEntry;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("blob {0} unavailable locally and from every peer")]
    Unavailable(String),

    #[error("blob {0} is not valid UTF-8")]
    NotUtf8(String),

    #[error("entry has neither an inline value nor a blob id")]
    EmptyEntry,

    #[error(transparent)]
    Blob(#[from] crate::blob_store::BlobError),
}

/// Resolves entry values, fetching missing blobs from peers on demand.
pub struct BlobResolver {
    http: reqwest::Client,
    cluster: ClusterHandle,
    blobs: Arc<BlobStore>,
    /// Per-blob-id fetch gates; entries are never removed.
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BlobResolver {
    pub fn new(cluster: ClusterHandle, blobs: Arc<BlobStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cluster,
            blobs,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entry's value, inline or blob-backed.
    pub async fn resolve(&self, entry: &ConfigEntry) -> Result<String, ResolveError> {
        if let Some(value) = &entry.value {
            return Ok(value.clone());
        }
        let blob_id = entry.blob_id.as_deref().ok_or(ResolveError::EmptyEntry)?;
        self.resolve_blob(blob_id).await
    }

    async fn resolve_blob(&self, blob_id: &str) -> Result<String, ResolveError> {
        if let Some(bytes) = self.read_local(blob_id).await? {
            return decode_utf8(blob_id, bytes);
        }

        let gate = {
            let mut gates = self.gates.lock().unwrap();
            gates
                .entry(blob_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // Another reader may have filled the store while we queued.
        if let Some(bytes) = self.read_local(blob_id).await? {
            return decode_utf8(blob_id, bytes);
        }

        self.fetch_from_peers(blob_id).await?;

        match self.read_local(blob_id).await? {
            Some(bytes) => decode_utf8(blob_id, bytes),
            None => Err(ResolveError::Unavailable(blob_id.to_string())),
        }
    }

    async fn read_local(&self, blob_id: &str) -> Result<Option<Vec<u8>>, ResolveError> {
        let blobs = self.blobs.clone();
        let blob_id = blob_id.to_string();
        let bytes = tokio::task::spawn_blocking(move || blobs.read_decompressed(&blob_id))
            .await
            .map_err(|e| {
                ResolveError::Blob(crate::blob_store::BlobError::Io(std::io::Error::other(e)))
            })??;
        Ok(bytes)
    }

    /// Iterates peers once; the first 2xx response that validates wins.
    async fn fetch_from_peers(&self, blob_id: &str) -> Result<(), ResolveError> {
        let token = self.cluster.config().cluster_token.clone();
        for peer in self.cluster.peer_endpoints() {
            let url = format!("{peer}/internal/blobs/{blob_id}");
            let response = match self
                .http
                .get(&url)
                .header(CLUSTER_TOKEN_HEADER, &token)
                .timeout(FETCH_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    debug!(peer = %peer, blob_id = %blob_id, status = %resp.status(), "peer has no blob");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer, blob_id = %blob_id, error = %e, "peer blob fetch failed");
                    continue;
                }
            };

            let compressed = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer = %peer, blob_id = %blob_id, error = %e, "peer blob body failed");
                    continue;
                }
            };

            // put_compressed re-validates the hash, so a lying peer cannot
            // poison the local store.
            let blobs = self.blobs.clone();
            let id = blob_id.to_string();
            let stored = tokio::task::spawn_blocking(move || {
                blobs.put_compressed(&id, &mut Cursor::new(compressed.as_ref()))
            })
            .await;
            match stored {
                Ok(Ok(_)) => {
                    debug!(peer = %peer, blob_id = %blob_id, "blob fetched from peer");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, blob_id = %blob_id, error = %e, "peer blob failed validation");
                }
                Err(e) => {
                    warn!(blob_id = %blob_id, error = %e, "blob store task failed");
                }
            }
        }
        Err(ResolveError::Unavailable(blob_id.to_string()))
    }
}

fn decode_utf8(blob_id: &str, bytes: Vec<u8>) -> Result<String, ResolveError> {
    String::from_utf8(bytes).map_err(|_| ResolveError::NotUtf8(blob_id.to_string()))
}

// ── Tests ────────────────────────────────────────────────────────────────────
