//! gRPC inter-node coordination service.
//!
//! Implements the `ConfmanCoordinator` service for everything nodes say to
//! each other over the Raft port:
//!
//! | RPC group      | Used by                                   |
//! |----------------|-------------------------------------------|
//! | Raft transport | openraft replication (`src/raft.rs`)      |
//! | ReadIndex      | follower-side read barrier                |
//! | HealthCheck    | operators and tests                       |
//!
//! The Raft RPCs carry openraft's own request/response types JSON-serialized
//! in the proto `payload: bytes` field; this service just forwards them to
//! the local Raft instance. Blob transfer is *not* here — it rides the HTTP
//! internal routes so it can stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::cluster::ClusterHandle;
use crate::raft::{RaftNode, TypeConfig};

/// Generated protobuf types and gRPC stubs for `ConfmanCoordinator`.
pub mod proto {
    tonic::include_proto!("confman");
}

use proto::confman_coordinator_server::{ConfmanCoordinator, ConfmanCoordinatorServer};
use proto::*;

// ── Service ──────────────────────────────────────────────────────────────────

/// Server-side implementation of `ConfmanCoordinator`.
#[derive(Clone)]
pub struct CoordinatorService {
    cluster: ClusterHandle,
    raft: Option<Arc<RaftNode>>,
}

impl CoordinatorService {
    pub fn new(cluster: ClusterHandle) -> Self {
        Self {
            cluster,
            raft: None,
        }
    }

    pub fn with_raft(cluster: ClusterHandle, raft: Arc<RaftNode>) -> Self {
        Self {
            cluster,
            raft: Some(raft),
        }
    }

    fn raft(&self) -> Result<&Arc<RaftNode>, Status> {
        self.raft
            .as_ref()
            .ok_or_else(|| Status::unavailable("raft not started on this node"))
    }
}

#[tonic::async_trait]
impl ConfmanCoordinator for CoordinatorService {
    // ── Raft transport ───────────────────────────────────────────────────────
    //
    // Each RPC deserializes the proto payload back into the openraft request
    // type and forwards it to the local Raft instance.

    async fn append_entries(
        &self,
        req: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let raft = self.raft()?;
        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode AppendEntriesRequest: {e}"))
            })?;

        let resp = raft
            .raft
            .append_entries(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft AppendEntries error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;

        Ok(Response::new(AppendEntriesResponse {
            success: true,
            payload,
        }))
    }

    async fn request_vote(
        &self,
        req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let raft = self.raft()?;
        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::VoteRequest<crate::raft::NodeId> =
            serde_json::from_slice(&payload)
                .map_err(|e| Status::invalid_argument(format!("failed to decode VoteRequest: {e}")))?;

        let resp = raft
            .raft
            .vote(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft Vote error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;

        Ok(Response::new(VoteResponse {
            vote_granted: resp.vote_granted,
            payload,
        }))
    }

    async fn install_snapshot(
        &self,
        req: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let raft = self.raft()?;
        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode InstallSnapshotRequest: {e}"))
            })?;

        let resp = raft
            .raft
            .install_snapshot(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft InstallSnapshot error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;

        Ok(Response::new(SnapshotResponse { payload }))
    }

    // ── Read barrier support ─────────────────────────────────────────────────

    /// Leader-side half of the follower read barrier: confirm leadership via
    /// a heartbeat round and return the index a reader must have applied.
    async fn read_index(
        &self,
        _req: Request<ReadIndexRequest>,
    ) -> Result<Response<ReadIndexResponse>, Status> {
        let raft = self.raft()?;
        match raft.raft.ensure_linearizable().await {
            Ok(read_log_id) => Ok(Response::new(ReadIndexResponse {
                ok: true,
                index: read_log_id.map(|l| l.index).unwrap_or(0),
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(ReadIndexResponse {
                ok: false,
                index: 0,
                error: e.to_string(),
            })),
        }
    }

    // ── Health ───────────────────────────────────────────────────────────────

    async fn health_check(
        &self,
        _req: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let state = self.cluster.state();
        let (leader_known, leader, term) = match &self.raft {
            Some(node) => (
                node.current_leader().is_some(),
                node.leader_endpoint().unwrap_or_default(),
                node.term(),
            ),
            None => (false, String::new(), 0),
        };
        Ok(Response::new(HealthResponse {
            node_id: self.cluster.config().node_id.clone(),
            state: state.as_str().to_string(),
            leader_known,
            leader,
            term,
        }))
    }
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Starts the gRPC server on the configured transport address. Runs until
/// process exit; spawn it in a background task.
pub async fn start_grpc_server(cluster: ClusterHandle, raft: Arc<RaftNode>) {
    let bind = cluster.config().grpc_addr.clone();
    let addr: SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind, error = %e, "invalid gRPC bind address");
            return;
        }
    };

    let service = CoordinatorService::with_raft(cluster, raft);
    info!(addr = %addr, "gRPC coordinator listening");

    if let Err(e) = Server::builder()
        .add_service(ConfmanCoordinatorServer::new(service))
        .serve(addr)
        .await
    {
        error!(error = %e, "gRPC server error");
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn bare_service() -> CoordinatorService {
        let cfg = NodeConfig::for_testing(std::path::PathBuf::from("./data-test"));
        CoordinatorService::new(ClusterHandle::new(Arc::new(cfg)))
    }

    #[tokio::test]
    async fn raft_rpcs_unavailable_without_raft() {
        let svc = bare_service();

        let err = svc
            .append_entries(Request::new(AppendEntriesRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        let err = svc
            .request_vote(Request::new(VoteRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        let err = svc
            .install_snapshot(Request::new(SnapshotRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        let err = svc
            .read_index(Request::new(ReadIndexRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn health_check_reports_forming_without_raft() {
        let svc = bare_service();
        let resp = svc
            .health_check(Request::new(HealthRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.state, "forming");
        assert!(!resp.leader_known);
        assert_eq!(resp.node_id, "test-node");
    }
}
