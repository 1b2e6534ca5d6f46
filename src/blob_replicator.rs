//! Quorum blob replication.
//!
//! Before a blob-backed pointer is allowed into the Raft log, the blob
//! itself must be durable on a majority of nodes. The leader fans out
//! concurrent PUTs of the compressed file to every peer and returns as soon
//! as `quorum - 1` of them ack (the leader's own copy completes the
//! majority). The remaining pushes keep running in the background, detached
//! from the caller — they belong to the process, not the request.
//!
//! Fail-fast: when enough peers have definitively failed that the remaining
//! in-flight pushes can no longer reach quorum, the caller hears about it
//! immediately instead of waiting out the deadline.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::blob_store::BlobStore;
use crate::cluster::{ClusterHandle, CLUSTER_TOKEN_HEADER};
use crate::metrics;

/// Deadline for reaching the durability quorum.
pub const QUORUM_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-peer PUT timeout; failed peers free their quorum slot quickly.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BlobReplicationError {
    #[error("blob quorum not reached: {acks}/{required} peer acks, {failed} peers failed")]
    Failed {
        acks: usize,
        required: usize,
        failed: usize,
    },

    #[error("blob quorum wait deadline elapsed with {acks}/{required} peer acks")]
    Timeout { acks: usize, required: usize },

    #[error("blob {0} is not in the local store")]
    MissingLocal(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Pushes local blobs to peers with quorum semantics.
#[derive(Clone)]
pub struct BlobReplicator {
    http: reqwest::Client,
    cluster: ClusterHandle,
    blobs: Arc<BlobStore>,
}

impl BlobReplicator {
    pub fn new(cluster: ClusterHandle, blobs: Arc<BlobStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cluster,
            blobs,
        }
    }

    /// Replicates `blob_id` to a durability quorum of peers.
    ///
    /// Single-node clusters succeed immediately. On success, pushes to the
    /// remaining peers continue in the background.
    pub async fn replicate(&self, blob_id: &str) -> Result<(), BlobReplicationError> {
        let path = self.blobs.path_for(blob_id);
        if !path.exists() {
            return Err(BlobReplicationError::MissingLocal(blob_id.to_string()));
        }

        let peers = self.cluster.peer_endpoints();
        if peers.is_empty() {
            return Ok(());
        }
        let required = self.cluster.required_peer_acks();
        if required == 0 {
            return Ok(());
        }

        let token = self.cluster.config().cluster_token.clone();
        let total = peers.len();
        let (ack_tx, mut ack_rx) = mpsc::channel::<bool>(total);

        for peer in peers {
            let http = self.http.clone();
            let token = token.clone();
            let path = path.clone();
            let blob_id = blob_id.to_string();
            let ack_tx = ack_tx.clone();
            // Detached from the caller: a push that outlives the quorum wait
            // still lands its copy.
            tokio::spawn(async move {
                let ok = push_blob(&http, &peer, &token, path, &blob_id).await;
                metrics::BLOB_PUSH_ACKS
                    .with_label_values(&[if ok { "ack" } else { "fail" }])
                    .inc();
                let _ = ack_tx.send(ok).await;
            });
        }
        drop(ack_tx);

        let deadline = Instant::now() + QUORUM_TIMEOUT;
        let mut acks = 0usize;
        let mut failed = 0usize;
        while acks < required {
            match tokio::time::timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(true)) => acks += 1,
                Ok(Some(false)) => {
                    failed += 1;
                    let still_in_flight = total - acks - failed;
                    if acks + still_in_flight < required {
                        return Err(BlobReplicationError::Failed {
                            acks,
                            required,
                            failed,
                        });
                    }
                }
                Ok(None) => {
                    return Err(BlobReplicationError::Failed {
                        acks,
                        required,
                        failed,
                    });
                }
                Err(_) => {
                    return Err(BlobReplicationError::Timeout { acks, required });
                }
            }
        }

        debug!(blob_id = %blob_id, acks, required, "blob quorum reached");
        Ok(())
    }
}

/// PUTs one compressed blob file to one peer. A `204 No Content` means the
/// peer already had it — that counts as an ack.
async fn push_blob(
    http: &reqwest::Client,
    peer: &str,
    token: &str,
    path: PathBuf,
    blob_id: &str,
) -> bool {
    let body = match file_body(path).await {
        Ok(body) => body,
        Err(e) => {
            warn!(peer = %peer, blob_id = %blob_id, error = %e, "cannot open blob for push");
            return false;
        }
    };

    let url = format!("{peer}/internal/blobs/{blob_id}");
    match http
        .put(&url)
        .header(CLUSTER_TOKEN_HEADER, token)
        .timeout(PUSH_TIMEOUT)
        .body(body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            warn!(peer = %peer, blob_id = %blob_id, status = %resp.status(), "blob push refused");
            false
        }
        Err(e) => {
            warn!(peer = %peer, blob_id = %blob_id, error = %e, "blob push failed");
            false
        }
    }
}

/// Streams a file as a request body in 64 KiB chunks.
async fn file_body(path: PathBuf) -> io::Result<reqwest::Body> {
    let mut file = tokio::fs::File::open(path).await?;
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(4);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    Ok(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::io::Cursor;
    use wiremock::matchers::{header, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(peer_uris: Vec<String>) -> (tempfile::TempDir, BlobReplicator, String) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(
            BlobStore::open(dir.path().join("blobs"), 50 * 1024 * 1024, 200 * 1024 * 1024)
                .unwrap(),
        );
        let blob_id = blobs
            .put_from_stream(&mut Cursor::new(b"payload".repeat(100)))
            .unwrap();

        let mut cfg = NodeConfig::for_testing(dir.path().to_path_buf());
        cfg.public_endpoint = "http://127.0.0.1:1".to_string();
        let mut members = vec![cfg.public_endpoint.clone()];
        members.extend(peer_uris);
        cfg.members = members;

        let cluster = ClusterHandle::new(Arc::new(cfg));
        let replicator = BlobReplicator::new(cluster, blobs);
        (dir, replicator, blob_id)
    }

    #[tokio::test]
    async fn single_node_cluster_succeeds_immediately() {
        let (_dir, replicator, blob_id) = setup(vec![]).await;
        replicator.replicate(&blob_id).await.unwrap();
    }

    #[tokio::test]
    async fn quorum_of_one_peer_ack_succeeds() {
        let peer_a = MockServer::start().await;
        let peer_b = MockServer::start().await;
        // Three-node cluster: quorum 2, required peer acks 1.
        Mock::given(method("PUT"))
            .and(path_regex("^/internal/blobs/[0-9a-f]{64}$"))
            .and(header(CLUSTER_TOKEN_HEADER, "test-token"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&peer_a)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&peer_b)
            .await;

        let (_dir, replicator, blob_id) = setup(vec![peer_a.uri(), peer_b.uri()]).await;
        replicator.replicate(&blob_id).await.unwrap();
    }

    #[tokio::test]
    async fn already_present_counts_as_ack() {
        let peer_a = MockServer::start().await;
        let peer_b = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&peer_a)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&peer_b)
            .await;

        let (_dir, replicator, blob_id) = setup(vec![peer_a.uri(), peer_b.uri()]).await;
        replicator.replicate(&blob_id).await.unwrap();
    }

    #[tokio::test]
    async fn all_peers_failing_is_fail_fast() {
        let peer_a = MockServer::start().await;
        let peer_b = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&peer_a)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&peer_b)
            .await;

        let (_dir, replicator, blob_id) = setup(vec![peer_a.uri(), peer_b.uri()]).await;
        let err = replicator.replicate(&blob_id).await.unwrap_err();
        assert!(matches!(
            err,
            BlobReplicationError::Failed {
                acks: 0,
                required: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_local_blob_is_an_error() {
        let (_dir, replicator, _) = setup(vec![]).await;
        let err = replicator.replicate(&"0".repeat(64)).await.unwrap_err();
        assert!(matches!(err, BlobReplicationError::MissingLocal(_)));
    }
}
