//! Batching replicator — the write-throughput half of the pipeline.
//!
//! Concurrent client writes are funneled into a bounded queue of
//! `(command, completer)` pairs consumed by a single flush task, the sole
//! submitter of Raft entries. The flush task drains the queue into a batch
//! until one of three limits fires:
//!
//! - `max_batch_size` commands (default 50)
//! - `max_batch_bytes` of estimated encoding (default 4 MiB, sized under the
//!   Raft transport's body limit)
//! - `max_batch_wait` since the first command (default 1 ms) with no further
//!   items arriving
//!
//! A single command is submitted bare; several are wrapped in a `Batch`
//! entry and applied in queue order (last writer wins per key within one
//! batch). Encoding reuses one buffer owned by the flush task — the
//! single-consumer invariant is what makes that safe, so the buffer is never
//! exposed.
//!
//! Raft already serializes apply; this layer only amortizes submission.
//! Queue capacity is `max_batch_size × 10`; producers await on a full queue
//! (back-pressure), and a submission timeout of 10 s bounds every waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::codec::{self, Command};
use crate::metrics;
use crate::raft::RaftNode;

/// Timeout for a single Raft submission. Must stay above the election
/// timeout so a mid-submission failover can still complete the write.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long shutdown waits for the flush task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The consensus-side seam the batcher submits through. Production code uses
/// [`RaftNode`]; tests substitute a recorder.
#[async_trait]
pub trait CommandSubmitter: Send + Sync + 'static {
    fn is_leader(&self) -> bool;

    /// The leader's public endpoint, when one is known.
    fn leader_endpoint(&self) -> Option<String>;

    /// Submits one encoded entry; resolves when Raft accepts or rejects it.
    async fn submit(&self, bytes: Vec<u8>) -> Result<(), String>;
}

#[async_trait]
impl CommandSubmitter for RaftNode {
    fn is_leader(&self) -> bool {
        RaftNode::is_leader(self)
    }

    fn leader_endpoint(&self) -> Option<String> {
        RaftNode::leader_endpoint(self)
    }

    async fn submit(&self, bytes: Vec<u8>) -> Result<(), String> {
        self.client_write(bytes).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Batching limits, lifted out of the node config.
#[derive(Debug, Clone)]
pub struct BatchLimits {
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_batch_wait: Duration,
}

impl BatchLimits {
    pub fn from_config(config: &crate::config::NodeConfig) -> Self {
        Self {
            max_batch_size: config.batch_max_size.max(1),
            max_batch_bytes: config.batch_max_bytes,
            max_batch_wait: Duration::from_millis(config.batch_max_wait_ms),
        }
    }
}

type Pending = (Command, oneshot::Sender<bool>);

/// Handle to the batching replicator. Clone-cheap via `Arc`.
pub struct BatchingReplicator {
    tx: Mutex<Option<mpsc::Sender<Pending>>>,
    submitter: Arc<dyn CommandSubmitter>,
    shutting_down: Arc<AtomicBool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingReplicator {
    /// Starts the single flush task and returns the handle.
    pub fn start(submitter: Arc<dyn CommandSubmitter>, limits: BatchLimits) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(limits.max_batch_size * 10);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let flush_task = tokio::spawn(flush_loop(
            rx,
            submitter.clone(),
            limits,
            shutting_down.clone(),
        ));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            submitter,
            shutting_down,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.submitter.is_leader()
    }

    pub fn leader_endpoint(&self) -> Option<String> {
        self.submitter.leader_endpoint()
    }

    /// Enqueues a command and waits for its batch's submission result.
    /// Returns `false` without enqueueing when this node is not the leader,
    /// and `false` for every queued command once shutdown begins.
    pub async fn replicate(&self, command: Command) -> bool {
        if !self.submitter.is_leader() {
            return false;
        }
        let sender = match self.tx.lock().unwrap().clone() {
            Some(sender) => sender,
            None => return false,
        };
        let (done_tx, done_rx) = oneshot::channel();
        if sender.send((command, done_tx)).await.is_err() {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    /// Closes the queue, fails residual waiters, and joins the flush task
    /// (bounded by 5 s).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap().take();

        let task = self.flush_task.lock().unwrap().take();
        if let Some(task) = task {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(_) => info!("batching replicator stopped"),
                Err(_) => warn!("batching replicator flush task did not stop in time"),
            }
        }
    }
}

async fn flush_loop(
    mut rx: mpsc::Receiver<Pending>,
    submitter: Arc<dyn CommandSubmitter>,
    limits: BatchLimits,
    shutting_down: Arc<AtomicBool>,
) {
    // The one reusable encode buffer; only this task ever touches it.
    let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024);

    while let Some((first_command, first_done)) = rx.recv().await {
        if shutting_down.load(Ordering::SeqCst) {
            let _ = first_done.send(false);
            continue;
        }

        let mut commands = Vec::with_capacity(limits.max_batch_size);
        let mut waiters = Vec::with_capacity(limits.max_batch_size);
        let mut estimated = first_command.estimated_bytes();
        commands.push(first_command);
        waiters.push(first_done);

        let deadline = Instant::now() + limits.max_batch_wait;
        while commands.len() < limits.max_batch_size && estimated < limits.max_batch_bytes {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((command, done))) => {
                    estimated += command.estimated_bytes();
                    commands.push(command);
                    waiters.push(done);
                }
                Ok(None) | Err(_) => break,
            }
        }

        metrics::BATCH_SIZE.observe(commands.len() as f64);

        let command = if commands.len() == 1 {
            commands.pop().expect("one command")
        } else {
            Command::Batch { commands }
        };

        let ok = if shutting_down.load(Ordering::SeqCst) {
            false
        } else {
            submit_one(&submitter, &command, &mut buf).await
        };

        for done in waiters {
            let _ = done.send(ok);
        }
    }
}

async fn submit_one(
    submitter: &Arc<dyn CommandSubmitter>,
    command: &Command,
    buf: &mut Vec<u8>,
) -> bool {
    if let Err(e) = codec::encode_command(command, buf) {
        error!(error = %e, "command encoding failed");
        return false;
    }
    match tokio::time::timeout(SUBMIT_TIMEOUT, submitter.submit(buf.clone())).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "raft submission failed");
            false
        }
        Err(_) => {
            warn!(timeout_s = SUBMIT_TIMEOUT.as_secs(), "raft submission timed out");
            false
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
