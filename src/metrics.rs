//! Prometheus metrics for the replication pipeline.
//!
//! Rendered at `GET /metrics` by the HTTP layer.

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder};

lazy_static! {
    pub static ref APPLIED_ENTRIES: IntCounter = IntCounter::new(
        "confman_applied_entries_total",
        "Raft log entries applied to the state machine"
    )
    .unwrap();
    pub static ref APPLIED_COMMANDS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "confman_applied_commands_total",
            "Commands applied, by kind"
        ),
        &["kind"]
    )
    .unwrap();
    pub static ref BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "confman_batch_commands",
            "Commands coalesced into one Raft entry"
        )
        .buckets(vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0])
    )
    .unwrap();
    pub static ref BLOB_PUSH_ACKS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "confman_blob_push_results_total",
            "Peer blob push outcomes"
        ),
        &["result"]
    )
    .unwrap();
    pub static ref BARRIER_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "confman_read_barrier_wait_seconds",
            "Time spent satisfying the read barrier"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
    )
    .unwrap();
}

/// Registers every metric with the default registry. Call once at startup;
/// re-registration errors (tests, restarts in-process) are ignored.
pub fn register_metrics() {
    let registry = prometheus::default_registry();
    let _ = registry.register(Box::new(APPLIED_ENTRIES.clone()));
    let _ = registry.register(Box::new(APPLIED_COMMANDS.clone()));
    let _ = registry.register(Box::new(BATCH_SIZE.clone()));
    let _ = registry.register(Box::new(BLOB_PUSH_ACKS.clone()));
    let _ = registry.register(Box::new(BARRIER_WAIT_SECONDS.clone()));
}

/// Renders the default registry in the Prometheus text format.
pub fn render() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        buffer.clear();
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_twice_is_harmless() {
        register_metrics();
        register_metrics();
        APPLIED_ENTRIES.inc();
        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("confman_applied_entries_total"));
    }
}
