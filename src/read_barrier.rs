//! Linearizable read barrier.
//!
//! Every read of entity data passes this gate before touching the applied
//! store, so a client that saw a 2xx write observes that write on any node:
//!
//! - On the **leader**, `Raft::ensure_linearizable()` confirms leadership
//!   with a heartbeat round and waits until the read index is applied
//!   locally.
//! - On a **follower**, a `ReadIndex` RPC asks the leader for its confirmed
//!   commit index, then the barrier waits until this node's applied index
//!   catches up.
//!
//! The whole exchange is bounded by the configured deadline; what a failed
//! barrier means for the response (`reject` / `timeout` / `stale`) is the
//! HTTP layer's decision. Writes never pass through here.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::cluster::grpc_addr_for_endpoint;
use crate::config::{FailureMode, NodeConfig};
use crate::grpc::proto::confman_coordinator_client::ConfmanCoordinatorClient;
use crate::grpc::proto::ReadIndexRequest;
use crate::metrics;
use crate::raft::RaftNode;

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("barrier deadline of {0} ms elapsed")]
    Deadline(u64),

    #[error("no leader to confirm the read index")]
    NoLeader,

    #[error("read index exchange failed: {0}")]
    Exchange(String),
}

/// Pre-read gate ensuring `last_applied ≥ read index` before a read serves.
pub struct ReadBarrier {
    raft: Arc<RaftNode>,
    enabled: bool,
    deadline: Duration,
    failure_mode: FailureMode,
    /// Cached gRPC client for the current leader, keyed by transport addr.
    leader_client: Mutex<Option<(String, ConfmanCoordinatorClient<Channel>)>>,
}

impl ReadBarrier {
    pub fn new(raft: Arc<RaftNode>, config: &NodeConfig) -> Self {
        Self {
            raft,
            enabled: config.read_barrier_enabled,
            deadline: Duration::from_millis(config.read_barrier_timeout_ms),
            failure_mode: config.read_barrier_failure_mode,
            leader_client: Mutex::new(None),
        }
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Blocks until the local applied index covers the cluster commit index,
    /// or the deadline elapses. A disabled barrier is a no-op.
    pub async fn wait_for_read(&self) -> Result<(), BarrierError> {
        if !self.enabled {
            return Ok(());
        }
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.deadline, self.acquire()).await;
        metrics::BARRIER_WAIT_SECONDS.observe(started.elapsed().as_secs_f64());
        match outcome {
            Ok(result) => result,
            Err(_) => Err(BarrierError::Deadline(self.deadline.as_millis() as u64)),
        }
    }

    async fn acquire(&self) -> Result<(), BarrierError> {
        if self.raft.is_leader() {
            // Heartbeat round + local applied wait, all inside openraft.
            self.raft
                .raft
                .ensure_linearizable()
                .await
                .map(|_| ())
                .map_err(|e| BarrierError::Exchange(e.to_string()))
        } else {
            let index = self.leader_read_index().await?;
            if index == 0 {
                return Ok(());
            }
            let mut rx = self.raft.metrics();
            rx.wait_for(|m| m.last_applied.map(|l| l.index).unwrap_or(0) >= index)
                .await
                .map(|_| ())
                .map_err(|_| BarrierError::Exchange("metrics channel closed".to_string()))?;
            debug!(read_index = index, "follower caught up to read index");
            Ok(())
        }
    }

    /// Asks the current leader for the index a linearizable read must cover.
    async fn leader_read_index(&self) -> Result<u64, BarrierError> {
        let leader = self.raft.leader_endpoint().ok_or(BarrierError::NoLeader)?;
        let addr = grpc_addr_for_endpoint(&leader).ok_or_else(|| {
            BarrierError::Exchange(format!("cannot derive transport address from {leader}"))
        })?;

        let mut client = self.client_for(&addr)?;
        let response = client
            .read_index(ReadIndexRequest {
                requester_id: self.raft.node_id.to_string(),
            })
            .await
            .map_err(|e| BarrierError::Exchange(e.to_string()))?
            .into_inner();

        if response.ok {
            Ok(response.index)
        } else {
            Err(BarrierError::Exchange(response.error))
        }
    }

    fn client_for(&self, addr: &str) -> Result<ConfmanCoordinatorClient<Channel>, BarrierError> {
        let mut cached = self.leader_client.lock().unwrap();
        if let Some((cached_addr, client)) = cached.as_ref() {
            if cached_addr == addr {
                return Ok(client.clone());
            }
        }
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| BarrierError::Exchange(e.to_string()))?
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(4))
            .connect_lazy();
        let client = ConfmanCoordinatorClient::new(channel);
        *cached = Some((addr.to_string(), client.clone()));
        Ok(client)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
