//! API-level error kinds and their HTTP mapping.
//!
//! Layer-local errors (`StoreError`, `BlobError`, `CodecError`) live with
//! their layers; this module defines what a failed request looks like to an
//! HTTP client. Nothing here retries: a follower redirects rather than
//! buffering, and replication failures surface as `503` with a reason the
//! operator can read.

use crate::blob_replicator::BlobReplicationError;

/// Everything a request handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Write attempted on a follower; the client should retry at the leader.
    #[error("not the leader; current leader is {leader}")]
    NotLeader { leader: String },

    /// Write attempted while the cluster has no leader.
    #[error("no leader elected")]
    NoLeader,

    /// Raft submission returned false or timed out.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    /// Pre-Raft blob quorum could not be achieved.
    #[error("blob replication failed: {0}")]
    BlobReplication(#[from] BlobReplicationError),

    /// Blob missing locally and from every peer.
    #[error("blob {0} unavailable from all peers")]
    BlobUnavailable(String),

    /// Internal blob PUT saw a SHA-256 disagreement.
    #[error("blob content does not match its id")]
    HashMismatch,

    /// Payload exceeds a configured ceiling.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Read barrier deadline elapsed under `reject` mode.
    #[error("read barrier not satisfied: {0}")]
    ReadBarrierRejected(String),

    /// Read barrier deadline elapsed under `timeout` mode.
    #[error("read barrier timed out: {0}")]
    ReadBarrierTimeout(String),

    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::NotLeader { .. } => 307,
            ApiError::NoLeader => 503,
            ApiError::ReplicationFailed(_) => 503,
            ApiError::BlobReplication(_) => 503,
            ApiError::BlobUnavailable(_) => 503,
            ApiError::HashMismatch => 400,
            ApiError::PayloadTooLarge(_) => 413,
            ApiError::ReadBarrierRejected(_) => 503,
            ApiError::ReadBarrierTimeout(_) => 504,
            ApiError::NotFound => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized => 401,
            ApiError::Internal(_) => 500,
        }
    }

    /// `Retry-After` seconds for the responses where backing off helps.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::NoLeader => Some(1),
            ApiError::ReplicationFailed(_) => Some(1),
            ApiError::BlobReplication(_) => Some(1),
            ApiError::ReadBarrierRejected(_) => Some(1),
            _ => None,
        }
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        match e {
            crate::store::StoreError::InvalidKey => ApiError::BadRequest(e.to_string()),
            crate::store::StoreError::InvalidLimit(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::blob_store::BlobError> for ApiError {
    fn from(e: crate::blob_store::BlobError) -> Self {
        use crate::blob_store::BlobError;
        match e {
            BlobError::InvalidId(_) => ApiError::BadRequest(e.to_string()),
            BlobError::HashMismatch { .. } => ApiError::HashMismatch,
            BlobError::CompressedTooLarge { .. } | BlobError::DecompressedTooLarge { .. } => {
                ApiError::PayloadTooLarge(e.to_string())
            }
            BlobError::Decompress(_) => ApiError::BadRequest(e.to_string()),
            BlobError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::NotLeader {
                leader: "http://x".into()
            }
            .status(),
            307
        );
        assert_eq!(ApiError::NoLeader.status(), 503);
        assert_eq!(ApiError::HashMismatch.status(), 400);
        assert_eq!(ApiError::PayloadTooLarge("x".into()).status(), 413);
        assert_eq!(ApiError::ReadBarrierRejected("x".into()).status(), 503);
        assert_eq!(ApiError::ReadBarrierTimeout("x".into()).status(), 504);
        assert_eq!(ApiError::NotFound.status(), 404);
        assert_eq!(ApiError::Unauthorized.status(), 401);
    }

    #[test]
    fn retry_after_only_on_backoffable_errors() {
        assert_eq!(ApiError::NoLeader.retry_after(), Some(1));
        assert_eq!(ApiError::ReadBarrierRejected("x".into()).retry_after(), Some(1));
        assert_eq!(ApiError::NotFound.retry_after(), None);
        assert_eq!(ApiError::ReadBarrierTimeout("x".into()).retry_after(), None);
    }

    #[test]
    fn blob_errors_map_to_client_statuses() {
        let mismatch: ApiError = crate::blob_store::BlobError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(mismatch.status(), 400);

        let too_large: ApiError =
            crate::blob_store::BlobError::CompressedTooLarge { limit: 10 }.into();
        assert_eq!(too_large.status(), 413);
    }
}
