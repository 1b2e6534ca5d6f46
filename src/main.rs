//! Node bootstrap.
//!
//! Startup order matters: the applied store and blob store open first (the
//! blob store sweeps temp orphans), then the Raft node — which replays any
//! committed-but-unapplied log entries through the state machine — and only
//! then do the gRPC and HTTP listeners bind. Readiness stays 503 until a
//! leader is known.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use confman::batcher::{BatchLimits, BatchingReplicator, CommandSubmitter};
use confman::blob_replicator::BlobReplicator;
use confman::blob_resolver::BlobResolver;
use confman::blob_store::BlobStore;
use confman::cluster::ClusterHandle;
use confman::config::NodeConfig;
use confman::grpc::start_grpc_server;
use confman::http_api::{self, ApiContext};
use confman::metrics;
use confman::raft::start_raft_node;
use confman::read_barrier::ReadBarrier;
use confman::store::AppliedStore;
use confman::writer::WriteOrchestrator;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CONFMAN_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();
    metrics::register_metrics();

    let config = Arc::new(NodeConfig::load()?);
    info!(
        node_id = %config.node_id,
        endpoint = %config.public_endpoint,
        members = config.members.len(),
        data_path = %config.data_path.display(),
        "starting confman node"
    );

    std::fs::create_dir_all(&config.data_path)?;
    let store = AppliedStore::open(&config.data_path.join("confman.db"))?;
    let blobs = Arc::new(BlobStore::open(
        config.data_path.join("blobs"),
        config.max_blob_size_bytes,
        config.max_decompressed_size_bytes,
    )?);

    let cluster = ClusterHandle::new(config.clone());

    // Raft replays the local log into the state machine here, before any
    // listener binds.
    let raft = start_raft_node(config.clone(), cluster.clone(), store.clone()).await?;

    let batcher = BatchingReplicator::start(
        raft.clone() as Arc<dyn CommandSubmitter>,
        BatchLimits::from_config(&config),
    );
    let blob_replicator = BlobReplicator::new(cluster.clone(), blobs.clone());
    let writer = Arc::new(WriteOrchestrator::new(
        &config,
        batcher.clone(),
        blobs.clone(),
        blob_replicator,
    ));
    let resolver = Arc::new(BlobResolver::new(cluster.clone(), blobs.clone()));
    let barrier = Arc::new(ReadBarrier::new(raft.clone(), &config));

    tokio::spawn(start_grpc_server(cluster.clone(), raft.clone()));

    let ctx = Arc::new(ApiContext {
        config: config.clone(),
        cluster,
        raft: raft.clone(),
        store,
        blobs,
        writer,
        resolver,
        barrier,
    });
    tokio::spawn(http_api::serve(ctx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Fail queued writes first, then stop consensus.
    batcher.shutdown().await;
    if let Err(e) = raft.raft.shutdown().await {
        warn!(error = %e, "raft shutdown error");
    }

    info!("clean shutdown");
    Ok(())
}
