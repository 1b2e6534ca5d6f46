//! Batch coalescing behavior under concurrent writers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use confman::batcher::{BatchLimits, BatchingReplicator, CommandSubmitter};
use confman::codec::{self, Command};

/// Collects submitted entries, decoded back to commands.
struct CountingSubmitter {
    entries: Mutex<Vec<Command>>,
}

impl CountingSubmitter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CommandSubmitter for CountingSubmitter {
    fn is_leader(&self) -> bool {
        true
    }

    fn leader_endpoint(&self) -> Option<String> {
        Some("http://127.0.0.1:4200".to_string())
    }

    async fn submit(&self, bytes: Vec<u8>) -> Result<(), String> {
        let command = codec::decode_command(&bytes).map_err(|e| e.to_string())?;
        self.entries.lock().unwrap().push(command);
        Ok(())
    }
}

fn set_config(key: &str, value: &str) -> Command {
    Command::SetConfig {
        namespace: "/t2".into(),
        key: key.into(),
        value: value.into(),
        entry_type: "string".into(),
        author: "writer".into(),
        ts: 1,
    }
}

#[tokio::test]
async fn k_concurrent_writers_produce_at_most_ceil_k_over_size_plus_one_entries() {
    let submitter = CountingSubmitter::new();
    let batcher = BatchingReplicator::start(
        submitter.clone(),
        BatchLimits {
            max_batch_size: 50,
            max_batch_bytes: 4 * 1024 * 1024,
            max_batch_wait: Duration::from_millis(25),
        },
    );

    const K: usize = 120;
    let mut handles = Vec::new();
    for i in 0..K {
        let batcher = batcher.clone();
        handles.push(tokio::spawn(async move {
            batcher.replicate(set_config(&format!("k{i}"), "v")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let entries = submitter.entries.lock().unwrap().clone();
    let ceiling = K.div_ceil(50) + 1;
    assert!(
        entries.len() <= ceiling,
        "expected ≤ {ceiling} raft entries for {K} writes, got {}",
        entries.len()
    );

    // Nothing lost, nothing duplicated.
    let mut keys: Vec<String> = entries
        .iter()
        .flat_map(|e| match e {
            Command::Batch { commands } => commands.clone(),
            other => vec![other.clone()],
        })
        .map(|c| match c {
            Command::SetConfig { key, .. } => key,
            other => panic!("unexpected command {other:?}"),
        })
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), K);
}

#[tokio::test]
async fn byte_budget_splits_oversized_batches() {
    let submitter = CountingSubmitter::new();
    let batcher = BatchingReplicator::start(
        submitter.clone(),
        BatchLimits {
            max_batch_size: 50,
            // Each command estimates at ~1 KiB + overhead, so two fit and a
            // third forces a flush.
            max_batch_bytes: 2 * 1100,
            max_batch_wait: Duration::from_millis(25),
        },
    );

    let big = "x".repeat(1024);
    let mut handles = Vec::new();
    for i in 0..6 {
        let batcher = batcher.clone();
        let value = big.clone();
        handles.push(tokio::spawn(async move {
            batcher.replicate(set_config(&format!("big{i}"), &value)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    for entry in submitter.entries.lock().unwrap().iter() {
        if let Command::Batch { commands } = entry {
            assert!(
                commands.len() <= 3,
                "byte budget should keep batches small, saw {}",
                commands.len()
            );
        }
    }
}

#[tokio::test]
async fn waiters_learn_their_batch_outcome() {
    struct FailingSubmitter;

    #[async_trait]
    impl CommandSubmitter for FailingSubmitter {
        fn is_leader(&self) -> bool {
            true
        }
        fn leader_endpoint(&self) -> Option<String> {
            None
        }
        async fn submit(&self, _bytes: Vec<u8>) -> Result<(), String> {
            Err("quorum lost".to_string())
        }
    }

    let batcher = BatchingReplicator::start(
        Arc::new(FailingSubmitter),
        BatchLimits {
            max_batch_size: 10,
            max_batch_bytes: 4 * 1024 * 1024,
            max_batch_wait: Duration::from_millis(10),
        },
    );

    let mut handles = Vec::new();
    for i in 0..5 {
        let batcher = batcher.clone();
        handles.push(tokio::spawn(async move {
            batcher.replicate(set_config(&format!("k{i}"), "v")).await
        }));
    }
    for handle in handles {
        assert!(!handle.await.unwrap(), "every waiter must see the failure");
    }
}
