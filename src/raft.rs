//! Raft consensus integration.
//!
//! Consensus itself (elections, log replication, membership, snapshot
//! transfer) is owned by the `openraft` crate (version 0.9). This module
//! owns everything openraft delegates to the application:
//!
//! ## Storage
//!
//! A combined `RaftStorage` (v1 API) implementation bridged into the v2
//! `RaftLogStorage` + `RaftStateMachine` split via `openraft::storage::Adaptor`.
//! The log lives in its own LMDB environment under `raft-log/`; the state
//! machine applies committed entries into the applied store (`confman.db`),
//! and keeps its last-applied watermark in a bookkeeping database inside
//! that same environment so wiping `confman.db` resets both together.
//!
//! App data in the log is the *encoded* command (`Vec<u8>`): commands cross
//! the consensus boundary as opaque bytes and are decoded on apply, zero
//! padding and all, by the command codec.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and carried in the `payload: bytes` field of the
//! `ConfmanCoordinator` gRPC service defined in `proto/confman.proto`.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT-style async trait methods; implementations must use
//! plain `async fn` — NOT `#[async_trait]` — to match the signatures.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use heed::byteorder::BE;
use heed::types::{Bytes, SerdeBincode, Str, U64};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, EntryPayload, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta,
    SnapshotPolicy, StorageError, StorageIOError, StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint};
use tracing::{error, info, warn};

use crate::cluster::{grpc_addr_for_endpoint, ClusterHandle, NodeState};
use crate::codec::{self, Command};
use crate::config::NodeConfig;
use crate::grpc::proto::{
    confman_coordinator_client::ConfmanCoordinatorClient, AppendEntriesRequest as ProtoAER,
    SnapshotRequest as ProtoSR, VoteRequest as ProtoVR,
};
use crate::metrics;
use crate::store::{
    audit_event_id, AppliedStore, AuditAction, AuditEvent, ConfigEntry, Namespace, StoreError,
};

// ── Type configuration ────────────────────────────────────────────────────────

/// Response produced by the state machine for each applied entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub message: String,
}

// App data is the codec's output: commands travel through Raft as opaque
// bytes and are decoded on apply.
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Vec<u8>,
        R            = CommandResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

type BEU64 = U64<BE>;

/// Raft timing. The tuning constraint is
/// `snapshot time < election timeout lower bound < submission timeout`;
/// the last two are static and checked in tests, the first is workload
/// dependent (drop `CONFMAN_SNAPSHOT_INTERVAL` to 50 for large-payload
/// workloads so snapshots stay small).
pub const HEARTBEAT_INTERVAL_MS: u64 = 500;
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 1500;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 3000;

const LOG_MAP_SIZE: usize = 2 * 1024 * 1024 * 1024;

const META_VOTE: &str = "vote";
const META_COMMITTED: &str = "committed";
const META_PURGED: &str = "purged";
const META_SNAPSHOT: &str = "snapshot";
const STATE_LAST_APPLIED: &str = "last_applied";
const STATE_MEMBERSHIP: &str = "membership";

/// Derive a stable u64 node ID from a node's public endpoint string.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── StorageError helpers ─────────────────────────────────────────────────────

fn log_r<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_logs(&e),
    }
}

fn log_w<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_logs(&e),
    }
}

fn sm_r<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_state_machine(&e),
    }
}

fn sm_w<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_state_machine(&e),
    }
}

fn vote_r<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_vote(&e),
    }
}

fn vote_w<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_vote(&e),
    }
}

// ── Durable combined storage ─────────────────────────────────────────────────

/// Serialized form of the locally-retained snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

/// Durable Raft storage: log entries and consensus bookkeeping in the
/// `raft-log/` environment, applied state in the applied store.
///
/// Wrapped by `Adaptor::new(storage)` to produce the v2 split traits.
pub struct ConfmanStorage {
    log_env: Env,
    logs: Database<BEU64, SerdeBincode<Entry<TypeConfig>>>,
    meta: Database<Str, Bytes>,
    pub store: AppliedStore,
    /// Bookkeeping inside the applied env: last-applied log id + membership.
    state: Database<Str, Bytes>,
    audit_enabled: bool,
}

impl ConfmanStorage {
    /// Opens the log environment under `log_path` and binds to `store`.
    ///
    /// `sync_log_every_commit = false` opens the log with `NO_SYNC`; the
    /// caller then owns the group-commit window via [`ConfmanStorage::log_env`]
    /// and `Env::force_sync`.
    pub fn open(
        log_path: &Path,
        store: AppliedStore,
        audit_enabled: bool,
        sync_log_every_commit: bool,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(log_path)?;
        let log_env = unsafe {
            let mut options = EnvOpenOptions::new();
            options.map_size(LOG_MAP_SIZE).max_dbs(2);
            if !sync_log_every_commit {
                options.flags(EnvFlags::NO_SYNC);
            }
            options.open(log_path)?
        };
        let mut wtxn = log_env.write_txn()?;
        let logs = log_env.create_database(&mut wtxn, Some("logs"))?;
        let meta = log_env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        let state = {
            let mut wtxn = store.env().write_txn()?;
            let state = store.env().create_database(&mut wtxn, Some("raft_state"))?;
            wtxn.commit()?;
            state
        };

        Ok(Self {
            log_env,
            logs,
            meta,
            store,
            state,
            audit_enabled,
        })
    }

    pub fn log_env(&self) -> Env {
        self.log_env.clone()
    }

    fn get_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError<NodeId>> {
        let rtxn = self.log_env.read_txn().map_err(log_r)?;
        match self.meta.get(&rtxn, key).map_err(log_r)? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes).map_err(log_r)?)),
            None => Ok(None),
        }
    }

    fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError<NodeId>> {
        let bytes = bincode::serialize(value).map_err(log_w)?;
        let mut wtxn = self.log_env.write_txn().map_err(log_w)?;
        self.meta.put(&mut wtxn, key, &bytes).map_err(log_w)?;
        wtxn.commit().map_err(log_w)?;
        Ok(())
    }

    fn read_state<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError<NodeId>> {
        let rtxn = self.store.env().read_txn().map_err(sm_r)?;
        match self.state.get(&rtxn, key).map_err(sm_r)? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes).map_err(sm_r)?)),
            None => Ok(None),
        }
    }

    fn last_applied(&self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.read_state::<Option<LogId<NodeId>>>(STATE_LAST_APPLIED)?.flatten())
    }

    /// Applies one decoded command against the applied store, recording the
    /// audit row in the same transaction. Returns a human-readable outcome.
    fn apply_command(
        &self,
        wtxn: &mut heed::RwTxn,
        command: &Command,
    ) -> Result<String, StoreError> {
        match command {
            Command::SetConfig {
                namespace,
                key,
                value,
                entry_type,
                author,
                ts,
            } => {
                let old = self.store.get_in(wtxn, namespace, key)?;
                let stored = self.store.set_in(
                    wtxn,
                    &ConfigEntry {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: Some(value.clone()),
                        blob_id: None,
                        entry_type: entry_type.clone(),
                        version: 0,
                        updated_at: *ts,
                        updated_by: author.clone(),
                    },
                )?;
                self.audit(
                    wtxn,
                    *ts,
                    namespace,
                    Some(key),
                    if old.is_some() {
                        AuditAction::ConfigUpdated
                    } else {
                        AuditAction::ConfigCreated
                    },
                    author,
                    old.and_then(|e| e.value),
                    Some(value.clone()),
                )?;
                metrics::APPLIED_COMMANDS.with_label_values(&["set_config"]).inc();
                Ok(format!("set {namespace}/{key} v{}", stored.version))
            }
            Command::SetConfigBlobRef {
                namespace,
                key,
                blob_id,
                entry_type,
                author,
                ts,
            } => {
                let old = self.store.get_in(wtxn, namespace, key)?;
                let stored = self.store.set_in(
                    wtxn,
                    &ConfigEntry {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: None,
                        blob_id: Some(blob_id.clone()),
                        entry_type: entry_type.clone(),
                        version: 0,
                        updated_at: *ts,
                        updated_by: author.clone(),
                    },
                )?;
                self.audit(
                    wtxn,
                    *ts,
                    namespace,
                    Some(key),
                    if old.is_some() {
                        AuditAction::ConfigUpdated
                    } else {
                        AuditAction::ConfigCreated
                    },
                    author,
                    old.and_then(|e| e.value),
                    Some(format!("blob:{blob_id}")),
                )?;
                metrics::APPLIED_COMMANDS.with_label_values(&["set_config_blob_ref"]).inc();
                Ok(format!("set {namespace}/{key} v{} (blob)", stored.version))
            }
            Command::DeleteConfig {
                namespace,
                key,
                author,
                ts,
            } => {
                let old = self.store.delete_in(wtxn, namespace, key)?;
                if let Some(old) = old {
                    self.audit(
                        wtxn,
                        *ts,
                        namespace,
                        Some(key),
                        AuditAction::ConfigDeleted,
                        author,
                        old.value,
                        None,
                    )?;
                }
                metrics::APPLIED_COMMANDS.with_label_values(&["delete_config"]).inc();
                Ok(format!("deleted {namespace}/{key}"))
            }
            Command::SetNamespace {
                path,
                description,
                owner,
                author,
                ts,
            } => {
                let (_, existed) = self.store.set_namespace_in(
                    wtxn,
                    &Namespace {
                        path: path.clone(),
                        description: description.clone(),
                        owner: owner.clone(),
                        created_at: *ts,
                    },
                )?;
                self.audit(
                    wtxn,
                    *ts,
                    path,
                    None,
                    if existed {
                        AuditAction::NamespaceUpdated
                    } else {
                        AuditAction::NamespaceCreated
                    },
                    author,
                    None,
                    None,
                )?;
                metrics::APPLIED_COMMANDS.with_label_values(&["set_namespace"]).inc();
                Ok(format!("set namespace {path}"))
            }
            Command::DeleteNamespace { path, author, ts } => {
                let old = self.store.delete_namespace_in(wtxn, path)?;
                if old.is_some() {
                    self.audit(
                        wtxn,
                        *ts,
                        path,
                        None,
                        AuditAction::NamespaceDeleted,
                        author,
                        None,
                        None,
                    )?;
                }
                metrics::APPLIED_COMMANDS.with_label_values(&["delete_namespace"]).inc();
                Ok(format!("deleted namespace {path}"))
            }
            Command::Batch { commands } => {
                // Every node applies the same committed bytes; a failing inner
                // command fails identically everywhere, so it is logged and
                // skipped rather than poisoning the rest of the batch.
                let mut applied = 0usize;
                for inner in commands {
                    match self.apply_command(wtxn, inner) {
                        Ok(_) => applied += 1,
                        Err(e) => {
                            error!(
                                tag = inner.tag(),
                                error = %e,
                                "batched command failed to apply, skipping"
                            );
                        }
                    }
                }
                metrics::APPLIED_COMMANDS.with_label_values(&["batch"]).inc();
                Ok(format!("batch applied {applied}/{}", commands.len()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        wtxn: &mut heed::RwTxn,
        ts: i64,
        namespace: &str,
        key: Option<&str>,
        action: AuditAction,
        actor: &str,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Result<(), StoreError> {
        if !self.audit_enabled {
            return Ok(());
        }
        let event = AuditEvent {
            id: audit_event_id(ts, namespace, key, action),
            ts,
            namespace: namespace.to_string(),
            key: key.map(str::to_string),
            action,
            actor: actor.to_string(),
            old_value,
            new_value,
        };
        self.store.append_audit_in(wtxn, &event)
    }
}

// ── Log reader ───────────────────────────────────────────────────────────────

impl RaftLogReader<TypeConfig> for ConfmanStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        let rtxn = self.log_env.read_txn().map_err(log_r)?;
        let mut out = Vec::new();
        for item in self.logs.range(&rtxn, &range).map_err(log_r)? {
            let (_, entry) = item.map_err(log_r)?;
            out.push(entry);
        }
        Ok(out)
    }
}

/// Log reader handle cloned off the main storage (same environment).
pub struct ConfmanLogReader {
    log_env: Env,
    logs: Database<BEU64, SerdeBincode<Entry<TypeConfig>>>,
}

impl RaftLogReader<TypeConfig> for ConfmanLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        let rtxn = self.log_env.read_txn().map_err(log_r)?;
        let mut out = Vec::new();
        for item in self.logs.range(&rtxn, &range).map_err(log_r)? {
            let (_, entry) = item.map_err(log_r)?;
            out.push(entry);
        }
        Ok(out)
    }
}

// ── Snapshot builder ─────────────────────────────────────────────────────────

/// Streams the applied store into a versioned snapshot.
pub struct ConfmanSnapshotBuilder {
    store: AppliedStore,
    log_env: Env,
    meta: Database<Str, Bytes>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
}

impl RaftSnapshotBuilder<TypeConfig> for ConfmanSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let dump = self.store.dump_all().map_err(sm_r)?;
        let mut data = Vec::new();
        codec::write_snapshot(&mut data, &dump).map_err(sm_r)?;

        let snapshot_id = format!(
            "{}-{}",
            self.last_applied.map(|l| l.index).unwrap_or(0),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        );
        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id,
        };

        // Retain the snapshot locally so followers can be caught up later.
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        let bytes = bincode::serialize(&stored).map_err(log_w)?;
        let mut wtxn = self.log_env.write_txn().map_err(log_w)?;
        self.meta.put(&mut wtxn, META_SNAPSHOT, &bytes).map_err(log_w)?;
        wtxn.commit().map_err(log_w)?;

        info!(
            snapshot_index = meta.last_log_id.map(|l| l.index).unwrap_or(0),
            entries = dump.entries.len(),
            namespaces = dump.namespaces.len(),
            "built snapshot"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

// ── RaftStorage (v1 API) ─────────────────────────────────────────────────────

impl RaftStorage<TypeConfig> for ConfmanStorage {
    type LogReader = ConfmanLogReader;
    type SnapshotBuilder = ConfmanSnapshotBuilder;

    // ── Vote ─────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = bincode::serialize(vote).map_err(vote_w)?;
        let mut wtxn = self.log_env.write_txn().map_err(vote_w)?;
        self.meta.put(&mut wtxn, META_VOTE, &bytes).map_err(vote_w)?;
        wtxn.commit().map_err(vote_w)?;
        // A granted vote must be durable before the reply leaves this node.
        self.log_env.force_sync().map_err(vote_w)?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        let rtxn = self.log_env.read_txn().map_err(vote_r)?;
        match self.meta.get(&rtxn, META_VOTE).map_err(vote_r)? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes).map_err(vote_r)?)),
            None => Ok(None),
        }
    }

    // ── Log ──────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let purged: Option<LogId<NodeId>> = self.get_meta(META_PURGED)?;
        let rtxn = self.log_env.read_txn().map_err(log_r)?;
        let last = self
            .logs
            .last(&rtxn)
            .map_err(log_r)?
            .map(|(_, entry)| *entry.get_log_id());
        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last.or(purged),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.put_meta(META_COMMITTED, &committed)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.get_meta::<Option<LogId<NodeId>>>(META_COMMITTED)?.flatten())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        ConfmanLogReader {
            log_env: self.log_env.clone(),
            logs: self.logs,
        }
    }

    /// Append log entries (v1 method name).
    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut wtxn = self.log_env.write_txn().map_err(log_w)?;
        for entry in entries {
            let index = entry.get_log_id().index;
            self.logs.put(&mut wtxn, &index, &entry).map_err(log_w)?;
        }
        wtxn.commit().map_err(log_w)?;
        Ok(())
    }

    /// Delete conflicting log entries from `log_id` onward (v1 method name).
    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut wtxn = self.log_env.write_txn().map_err(log_w)?;
        self.logs
            .delete_range(&mut wtxn, &(log_id.index..))
            .map_err(log_w)?;
        wtxn.commit().map_err(log_w)?;
        Ok(())
    }

    /// Delete applied log entries up to `log_id` inclusive (v1 method name).
    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = bincode::serialize(&log_id).map_err(log_w)?;
        let mut wtxn = self.log_env.write_txn().map_err(log_w)?;
        self.meta.put(&mut wtxn, META_PURGED, &bytes).map_err(log_w)?;
        self.logs
            .delete_range(&mut wtxn, &(..=log_id.index))
            .map_err(log_w)?;
        wtxn.commit().map_err(log_w)?;
        Ok(())
    }

    // ── State machine ────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let last_applied = self.last_applied()?;
        let membership = self
            .read_state::<StoredMembership<NodeId, BasicNode>>(STATE_MEMBERSHIP)?
            .unwrap_or_default();
        Ok((last_applied, membership))
    }

    /// Apply committed entries (v1 method name). One write transaction per
    /// entry: the command's mutations, its audit rows, and the last-applied
    /// watermark all land atomically.
    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let last_applied = self.last_applied()?;

        for entry in entries {
            let log_id = *entry.get_log_id();

            // The watermark never rewinds; replayed entries are no-ops.
            if last_applied.map_or(false, |applied| log_id.index <= applied.index) {
                responses.push(CommandResponse {
                    ok: true,
                    message: "already applied".to_string(),
                });
                continue;
            }

            let mut wtxn = self.store.env().write_txn().map_err(sm_w)?;
            let response = match &entry.payload {
                EntryPayload::Blank => CommandResponse {
                    ok: true,
                    message: "blank".to_string(),
                },
                EntryPayload::Normal(bytes) => match codec::decode_command(bytes) {
                    Ok(command) => match self.apply_command(&mut wtxn, &command) {
                        Ok(message) => CommandResponse { ok: true, message },
                        Err(e) => {
                            error!(index = log_id.index, error = %e, "command failed to apply");
                            CommandResponse {
                                ok: false,
                                message: e.to_string(),
                            }
                        }
                    },
                    Err(e) => {
                        error!(index = log_id.index, error = %e, "undecodable committed entry");
                        CommandResponse {
                            ok: false,
                            message: e.to_string(),
                        }
                    }
                },
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(log_id), membership.clone());
                    let bytes = bincode::serialize(&stored).map_err(sm_w)?;
                    self.state
                        .put(&mut wtxn, STATE_MEMBERSHIP, &bytes)
                        .map_err(sm_w)?;
                    CommandResponse {
                        ok: true,
                        message: "membership".to_string(),
                    }
                }
            };

            let bytes = bincode::serialize(&Some(log_id)).map_err(sm_w)?;
            self.state
                .put(&mut wtxn, STATE_LAST_APPLIED, &bytes)
                .map_err(sm_w)?;
            wtxn.commit().map_err(sm_w)?;

            metrics::APPLIED_ENTRIES.inc();
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let last_applied = self.last_applied().ok().flatten();
        let last_membership = self
            .read_state::<StoredMembership<NodeId, BasicNode>>(STATE_MEMBERSHIP)
            .ok()
            .flatten()
            .unwrap_or_default();
        ConfmanSnapshotBuilder {
            store: self.store.clone(),
            log_env: self.log_env.clone(),
            meta: self.meta,
            last_applied,
            last_membership,
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    /// Atomically replaces the applied state with the snapshot contents.
    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let dump = codec::read_snapshot(snapshot.get_ref().as_slice()).map_err(sm_w)?;

        let mut wtxn = self.store.env().write_txn().map_err(sm_w)?;
        self.store.restore_in(&mut wtxn, &dump).map_err(sm_w)?;
        let applied_bytes = bincode::serialize(&meta.last_log_id).map_err(sm_w)?;
        self.state
            .put(&mut wtxn, STATE_LAST_APPLIED, &applied_bytes)
            .map_err(sm_w)?;
        let membership_bytes = bincode::serialize(&meta.last_membership).map_err(sm_w)?;
        self.state
            .put(&mut wtxn, STATE_MEMBERSHIP, &membership_bytes)
            .map_err(sm_w)?;
        wtxn.commit().map_err(sm_w)?;

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };
        let bytes = bincode::serialize(&stored).map_err(log_w)?;
        let mut wtxn = self.log_env.write_txn().map_err(log_w)?;
        self.meta.put(&mut wtxn, META_SNAPSHOT, &bytes).map_err(log_w)?;
        wtxn.commit().map_err(log_w)?;

        info!(
            snapshot_index = meta.last_log_id.map(|l| l.index).unwrap_or(0),
            entries = dump.entries.len(),
            "installed snapshot"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match self.get_meta::<StoredSnapshot>(META_SNAPSHOT)? {
            Some(stored) => Ok(Some(Snapshot {
                meta: stored.meta,
                snapshot: Box::new(Cursor::new(stored.data)),
            })),
            None => Ok(None),
        }
    }
}

// ── gRPC network transport ───────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
///
/// openraft request types are JSON-serialized into the proto `payload: bytes`
/// field of the `ConfmanCoordinator` service.
pub struct GrpcNetwork {
    target_addr: Option<String>,
    client: Option<ConfmanCoordinatorClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut ConfmanCoordinatorClient<Channel>, String> {
        if self.client.is_none() {
            let addr = self
                .target_addr
                .as_ref()
                .ok_or_else(|| "peer endpoint has no derivable transport address".to_string())?;
            // connect_lazy() returns immediately; tonic dials on the first RPC
            // and reconnects on failure. The per-RPC timeout keeps heartbeats
            // failing fast instead of hanging into a follower's election
            // timeout.
            let ch = Endpoint::from_shared(format!("http://{addr}"))
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(ConfmanCoordinatorClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;
        let leader = rpc.vote.leader_id().node_id.to_string();

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .append_entries(ProtoAER {
                term,
                leader_id: leader,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;
        let candidate = rpc.vote.leader_id().node_id.to_string();

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .request_vote(ProtoVR {
                term,
                candidate_id: candidate,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .install_snapshot(ProtoSR { term, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `GrpcNetwork` instances per target peer node.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            target_addr: grpc_addr_for_endpoint(&node.addr),
            client: None,
        }
    }
}

// ── RaftNode public API ──────────────────────────────────────────────────────

/// A running Raft node: the openraft handle plus the applied store reads go
/// through.
pub struct RaftNode {
    pub raft: RaftInstance,
    pub node_id: NodeId,
    pub store: AppliedStore,
}

impl RaftNode {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// The current leader's public endpoint, from the replicated membership.
    pub fn leader_endpoint(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
    }

    pub fn term(&self) -> u64 {
        self.raft.metrics().borrow().current_term
    }

    pub fn last_applied_index(&self) -> u64 {
        self.raft
            .metrics()
            .borrow()
            .last_applied
            .map(|l| l.index)
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, BasicNode>> {
        self.raft.metrics()
    }

    /// Submits encoded command bytes as one Raft log entry.
    pub async fn client_write(
        &self,
        bytes: Vec<u8>,
    ) -> Result<
        ClientWriteResponse<TypeConfig>,
        RaftError<NodeId, openraft::error::ClientWriteError<NodeId, BasicNode>>,
    > {
        self.raft.client_write(bytes).await
    }
}

// ── Startup ──────────────────────────────────────────────────────────────────

/// Initialises and starts the Raft node.
///
/// Opens the durable storage, wires the gRPC transport, initializes the
/// (static) membership on the lowest-id node, and spawns a watcher that
/// mirrors Raft state into the [`ClusterHandle`]. Replay of
/// committed-but-unapplied log entries happens inside `Raft::new`, before
/// this function returns, so callers can bind HTTP afterwards knowing the
/// local state is caught up with the local log.
pub async fn start_raft_node(
    config: Arc<NodeConfig>,
    cluster: ClusterHandle,
    store: AppliedStore,
) -> Result<Arc<RaftNode>, Box<dyn std::error::Error + Send + Sync>> {
    let this_node_id = node_id_from_str(&config.public_endpoint);

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "confman".to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL_MS,
            election_timeout_min: ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max: ELECTION_TIMEOUT_MAX_MS,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_interval),
            ..Default::default()
        }
        .validate()?,
    );

    let storage = ConfmanStorage::open(
        &config.data_path.join("raft-log"),
        store.clone(),
        config.audit_enabled,
        config.flush_interval_ms == 0,
    )?;
    let log_env = storage.log_env();
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = openraft::Raft::new(
        this_node_id,
        raft_config,
        GrpcNetworkFactory,
        log_store,
        state_machine,
    )
    .await?;

    // Group-commit window for the log: with NO_SYNC commits, flush the
    // environment on the configured cadence.
    if config.flush_interval_ms > 0 {
        let env = log_env.clone();
        let interval = Duration::from_millis(config.flush_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = env.force_sync() {
                    error!(error = %e, "raft log sync failed");
                }
            }
        });
    }

    // Static membership: every node knows the full member list; the lowest
    // id initializes so exactly one node seeds the cluster.
    let members: BTreeMap<NodeId, BasicNode> = cluster
        .members()
        .into_iter()
        .map(|endpoint| {
            (
                node_id_from_str(&endpoint),
                BasicNode { addr: endpoint },
            )
        })
        .collect();
    let min_id = members.keys().min().copied().unwrap_or(this_node_id);
    if this_node_id == min_id {
        if let Err(e) = raft.initialize(members.clone()).await {
            info!(error = %e, "raft already initialized (restart)");
        }
    }

    let node = Arc::new(RaftNode {
        raft: raft.clone(),
        node_id: this_node_id,
        store,
    });

    // Mirror Raft state into the cluster handle for health reporting.
    {
        let mut rx = raft.metrics();
        let handle = cluster.clone();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let m = rx.borrow().clone();
                let new_state = if m.state == openraft::ServerState::Leader {
                    NodeState::Leader
                } else if m.current_leader.is_some() {
                    NodeState::Follower
                } else {
                    NodeState::Forming
                };
                if handle.state() != new_state {
                    handle.set_state(new_state);
                    info!(
                        node_id = this_node_id,
                        state = new_state.as_str(),
                        term = m.current_term,
                        leader = ?m.current_leader,
                        "raft state changed"
                    );
                }
            }
        });
    }

    if members.len() > 1 && !members.contains_key(&this_node_id) {
        warn!(
            endpoint = %config.public_endpoint,
            "this node's public endpoint is not in the member list; it will never join"
        );
    }

    info!(
        node_id = this_node_id,
        members = members.len(),
        "raft node started"
    );

    Ok(node)
}

// ── Tests ────────────────────────────────────────────────────────────────────
