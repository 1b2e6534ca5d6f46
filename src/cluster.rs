//! Cluster view: static membership, node state, and peer address math.
//!
//! Membership is static and pre-configured (`CONFMAN_MEMBERS` lists every
//! node's public endpoint, this one included). The handle tracks the node's
//! Raft role for health reporting and answers the two questions the blob
//! layer keeps asking: who are my peers, and how many acks make a quorum.
//!
//! ## Node state
//!
//! | State    | Meaning                                      |
//! |----------|----------------------------------------------|
//! | forming  | Started, no leader known yet                 |
//! | follower | In cluster, following the current leader     |
//! | leader   | Elected Raft leader                          |

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::NodeConfig;

/// Fixed offset between a node's public HTTP port and its Raft transport
/// port. Keeps the static member list to a single URL per node.
pub const GRPC_PORT_OFFSET: u16 = 1000;

/// Header carrying the shared cluster secret on internal routes.
pub const CLUSTER_TOKEN_HEADER: &str = "x-confman-cluster-token";

// ── Node state ───────────────────────────────────────────────────────────────

/// The current Raft role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// No leader known yet (startup, lost quorum, election in progress).
    Forming,
    /// Following an elected leader.
    Follower,
    /// This node is the leader.
    Leader,
}

impl NodeState {
    /// Lowercase string used in health responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Forming => "forming",
            NodeState::Follower => "follower",
            NodeState::Leader => "leader",
        }
    }

    /// True once the node can serve traffic (a leader exists somewhere).
    pub fn ready(&self) -> bool {
        matches!(self, NodeState::Follower | NodeState::Leader)
    }
}

// ── Address math ─────────────────────────────────────────────────────────────

/// Derives a peer's Raft transport address (`host:port`) from its public
/// HTTP endpoint by applying [`GRPC_PORT_OFFSET`].
pub fn grpc_addr_for_endpoint(endpoint: &str) -> Option<String> {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint);
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some(format!("{host}:{}", port + GRPC_PORT_OFFSET))
}

// ── Cluster handle ───────────────────────────────────────────────────────────

/// Shared cluster state handle — cheap to clone, safe to share across tasks.
#[derive(Clone)]
pub struct ClusterHandle {
    state: Arc<Mutex<NodeState>>,
    config: Arc<NodeConfig>,
}

impl ClusterHandle {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState::Forming)),
            config,
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    /// Transitions to a new state; called from the Raft metrics watcher.
    pub fn set_state(&self, new_state: NodeState) {
        let old = {
            let mut guard = self.state.lock().unwrap();
            let old = *guard;
            *guard = new_state;
            old
        };
        if old != new_state {
            info!(
                node_id = %self.config.node_id,
                old_state = old.as_str(),
                new_state = new_state.as_str(),
                "node state changed"
            );
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Every member's public endpoint, this node included. A single-node
    /// deployment with an empty member list is just this node.
    pub fn members(&self) -> Vec<String> {
        if self.config.members.is_empty() {
            vec![self.config.public_endpoint.clone()]
        } else {
            self.config.members.clone()
        }
    }

    /// Peer public endpoints (members minus this node).
    pub fn peer_endpoints(&self) -> Vec<String> {
        self.members()
            .into_iter()
            .filter(|m| *m != self.config.public_endpoint)
            .collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.members().len()
    }

    /// Majority size for the configured cluster.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Acks needed from peers (beyond this node) for a durability quorum.
    pub fn required_peer_acks(&self) -> usize {
        self.quorum() - 1
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn three_node_handle() -> ClusterHandle {
        let mut cfg = NodeConfig::for_testing(PathBuf::from("./data-test"));
        cfg.public_endpoint = "http://10.0.0.1:4200".to_string();
        cfg.members = vec![
            "http://10.0.0.1:4200".to_string(),
            "http://10.0.0.2:4200".to_string(),
            "http://10.0.0.3:4200".to_string(),
        ];
        ClusterHandle::new(Arc::new(cfg))
    }

    #[test]
    fn starts_forming_and_transitions() {
        let handle = three_node_handle();
        assert_eq!(handle.state(), NodeState::Forming);
        assert!(!handle.state().ready());

        handle.set_state(NodeState::Follower);
        assert!(handle.state().ready());

        handle.set_state(NodeState::Leader);
        assert_eq!(handle.state(), NodeState::Leader);
    }

    #[test]
    fn peers_exclude_self() {
        let handle = three_node_handle();
        let peers = handle.peer_endpoints();
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&"http://10.0.0.1:4200".to_string()));
    }

    #[test]
    fn quorum_math() {
        let handle = three_node_handle();
        assert_eq!(handle.cluster_size(), 3);
        assert_eq!(handle.quorum(), 2);
        assert_eq!(handle.required_peer_acks(), 1);
    }

    #[test]
    fn single_node_cluster_is_itself() {
        let cfg = NodeConfig::for_testing(PathBuf::from("./data-test"));
        let handle = ClusterHandle::new(Arc::new(cfg));
        assert_eq!(handle.cluster_size(), 1);
        assert!(handle.peer_endpoints().is_empty());
        assert_eq!(handle.required_peer_acks(), 0);
    }

    #[test]
    fn grpc_addr_derivation() {
        assert_eq!(
            grpc_addr_for_endpoint("http://10.0.0.1:4200").as_deref(),
            Some("10.0.0.1:5200")
        );
        assert_eq!(
            grpc_addr_for_endpoint("https://node-a:4300/").as_deref(),
            Some("node-a:5300")
        );
        assert!(grpc_addr_for_endpoint("not-an-endpoint").is_none());
    }

    #[test]
    fn clone_shares_state() {
        let handle = three_node_handle();
        let other = handle.clone();
        handle.set_state(NodeState::Leader);
        assert_eq!(other.state(), NodeState::Leader);
    }
}
