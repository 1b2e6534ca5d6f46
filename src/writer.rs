//! Write orchestrator — the single entry point for client mutations.
//!
//! Chooses the write path by payload size: small values ride inline in the
//! Raft log; large ones are staged in the blob store and replicated to a
//! durability quorum *before* the pointer command is submitted, so a
//! committed `SetConfigBlobRef` always references a blob a majority of
//! nodes already hold.
//!
//! A blob that reached quorum but whose pointer never committed is a ghost:
//! content-addressed, immutable, invisible, and reusable by a retry of the
//! same value. Ghosts are logged and left in place.

use std::io::Cursor;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::batcher::BatchingReplicator;
use crate::blob_replicator::{BlobReplicationError, BlobReplicator};
use crate::blob_store::{BlobError, BlobStore};
use crate::codec::Command;
use crate::config::NodeConfig;

/// Why a write did not make it into the log.
#[derive(Debug, thiserror::Error)]
pub enum WriteFailure {
    /// Raft submission returned false or timed out (leadership lost, quorum
    /// lost, or deadline exceeded).
    #[error("replication failed: {0}")]
    Replication(String),

    #[error(transparent)]
    BlobQuorum(#[from] BlobReplicationError),

    #[error(transparent)]
    BlobStore(#[from] BlobError),
}

/// Outcome of a client write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub success: bool,
    pub timestamp: i64,
    pub error: Option<WriteFailure>,
}

impl WriteOutcome {
    fn ok(timestamp: i64) -> Self {
        Self {
            success: true,
            timestamp,
            error: None,
        }
    }

    fn failed(timestamp: i64, error: WriteFailure) -> Self {
        Self {
            success: false,
            timestamp,
            error: Some(error),
        }
    }
}

/// Orchestrates config and namespace writes into the batching replicator.
pub struct WriteOrchestrator {
    batcher: Arc<BatchingReplicator>,
    blobs: Arc<BlobStore>,
    replicator: BlobReplicator,
    blobs_enabled: bool,
    inline_threshold: usize,
}

impl WriteOrchestrator {
    pub fn new(
        config: &NodeConfig,
        batcher: Arc<BatchingReplicator>,
        blobs: Arc<BlobStore>,
        replicator: BlobReplicator,
    ) -> Self {
        Self {
            batcher,
            blobs,
            replicator,
            blobs_enabled: config.blobs_enabled,
            inline_threshold: config.inline_threshold_bytes,
        }
    }

    /// Writes one config value, inline or via the blob path.
    pub async fn put_config(
        &self,
        namespace: &str,
        key: &str,
        value: String,
        entry_type: String,
        author: String,
        ts: i64,
    ) -> WriteOutcome {
        let command = if !self.blobs_enabled || value.len() < self.inline_threshold {
            Command::SetConfig {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value,
                entry_type,
                author,
                ts,
            }
        } else {
            // Blob path: stage locally, reach quorum, then commit the pointer.
            let blobs = self.blobs.clone();
            let staged = tokio::task::spawn_blocking(move || {
                blobs.put_from_stream(&mut Cursor::new(value.into_bytes()))
            })
            .await;
            let blob_id = match staged {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => return WriteOutcome::failed(ts, e.into()),
                Err(e) => {
                    return WriteOutcome::failed(
                        ts,
                        WriteFailure::Replication(format!("blob staging task failed: {e}")),
                    )
                }
            };

            if let Err(e) = self.replicator.replicate(&blob_id).await {
                // The staged blob stays behind as a harmless ghost.
                warn!(blob_id = %blob_id, error = %e, "blob quorum failed; local blob is now a ghost");
                return WriteOutcome::failed(ts, e.into());
            }
            debug!(namespace = %namespace, key = %key, blob_id = %blob_id, "value staged via blob path");

            Command::SetConfigBlobRef {
                namespace: namespace.to_string(),
                key: key.to_string(),
                blob_id,
                entry_type,
                author,
                ts,
            }
        };

        self.submit(command, ts).await
    }

    pub async fn delete_config(
        &self,
        namespace: &str,
        key: &str,
        author: String,
        ts: i64,
    ) -> WriteOutcome {
        self.submit(
            Command::DeleteConfig {
                namespace: namespace.to_string(),
                key: key.to_string(),
                author,
                ts,
            },
            ts,
        )
        .await
    }

    pub async fn put_namespace(
        &self,
        path: &str,
        description: Option<String>,
        owner: String,
        author: String,
        ts: i64,
    ) -> WriteOutcome {
        self.submit(
            Command::SetNamespace {
                path: path.to_string(),
                description,
                owner,
                author,
                ts,
            },
            ts,
        )
        .await
    }

    pub async fn delete_namespace(&self, path: &str, author: String, ts: i64) -> WriteOutcome {
        self.submit(
            Command::DeleteNamespace {
                path: path.to_string(),
                author,
                ts,
            },
            ts,
        )
        .await
    }

    async fn submit(&self, command: Command, ts: i64) -> WriteOutcome {
        if self.batcher.replicate(command).await {
            WriteOutcome::ok(ts)
        } else {
            WriteOutcome::failed(
                ts,
                WriteFailure::Replication(
                    "raft submission rejected: leadership lost, quorum lost, or deadline exceeded"
                        .to_string(),
                ),
            )
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatchLimits, CommandSubmitter};
    use crate::cluster::ClusterHandle;
    use crate::codec;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        entries: Mutex<Vec<Command>>,
    }

    #[async_trait]
    impl CommandSubmitter for Recorder {
        fn is_leader(&self) -> bool {
            true
        }

        fn leader_endpoint(&self) -> Option<String> {
            None
        }

        async fn submit(&self, bytes: Vec<u8>) -> Result<(), String> {
            let command = codec::decode_command(&bytes).map_err(|e| e.to_string())?;
            self.entries.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn orchestrator(
        dir: &std::path::Path,
        threshold: usize,
    ) -> (Arc<Recorder>, WriteOrchestrator) {
        let recorder = Arc::new(Recorder {
            entries: Mutex::new(Vec::new()),
        });
        let batcher = BatchingReplicator::start(
            recorder.clone(),
            BatchLimits {
                max_batch_size: 50,
                max_batch_bytes: 4 * 1024 * 1024,
                max_batch_wait: Duration::from_millis(1),
            },
        );
        let blobs = Arc::new(
            crate::blob_store::BlobStore::open(
                dir.join("blobs"),
                50 * 1024 * 1024,
                200 * 1024 * 1024,
            )
            .unwrap(),
        );
        let mut cfg = crate::config::NodeConfig::for_testing(dir.to_path_buf());
        cfg.inline_threshold_bytes = threshold;
        let cluster = ClusterHandle::new(Arc::new(cfg.clone()));
        let replicator = BlobReplicator::new(cluster, blobs.clone());
        let orchestrator = WriteOrchestrator::new(&cfg, batcher, blobs, replicator);
        (recorder, orchestrator)
    }

    #[tokio::test]
    async fn small_values_take_the_inline_path() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, orchestrator) = orchestrator(dir.path(), 64);
        let outcome = orchestrator
            .put_config("/t1", "flag", "on".into(), "string".into(), "alice".into(), 7)
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.timestamp, 7);

        let entries = recorder.entries.lock().unwrap();
        assert!(matches!(entries[0], Command::SetConfig { .. }));
    }

    #[tokio::test]
    async fn large_values_take_the_blob_path() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, orchestrator) = orchestrator(dir.path(), 64);
        // Exactly at the threshold flips to the blob path.
        let value = "x".repeat(64);
        let outcome = orchestrator
            .put_config("/t1", "big", value, "string".into(), "alice".into(), 8)
            .await;
        assert!(outcome.success);

        let entries = recorder.entries.lock().unwrap();
        match &entries[0] {
            Command::SetConfigBlobRef { blob_id, .. } => {
                assert_eq!(blob_id.len(), 64);
            }
            other => panic!("expected blob ref, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blob_path_disabled_stays_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, mut orchestrator) = orchestrator(dir.path(), 64);
        orchestrator.blobs_enabled = false;

        let value = "x".repeat(1024);
        let outcome = orchestrator
            .put_config("/t1", "big", value, "string".into(), "alice".into(), 9)
            .await;
        assert!(outcome.success);
        let entries = recorder.entries.lock().unwrap();
        assert!(matches!(entries[0], Command::SetConfig { .. }));
    }

    #[tokio::test]
    async fn namespace_commands_flow_through() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, orchestrator) = orchestrator(dir.path(), 64);
        assert!(
            orchestrator
                .put_namespace("/t1", None, "alice".into(), "alice".into(), 1)
                .await
                .success
        );
        assert!(
            orchestrator
                .delete_namespace("/t1", "alice".into(), 2)
                .await
                .success
        );
        assert!(
            orchestrator
                .delete_config("/t1", "k", "alice".into(), 3)
                .await
                .success
        );

        let entries = recorder.entries.lock().unwrap();
        assert!(matches!(entries[0], Command::SetNamespace { .. }));
        assert!(matches!(entries[1], Command::DeleteNamespace { .. }));
        assert!(matches!(entries[2], Command::DeleteConfig { .. }));
    }
}
