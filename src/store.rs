//! Applied store — the durable local map the state machine writes into.
//!
//! Backed by a single LMDB environment (`confman.db`) with three named
//! databases:
//!
//! | Database     | Key                      | Value         |
//! |--------------|--------------------------|---------------|
//! | `namespaces` | namespace path           | [`Namespace`] |
//! | `entries`    | `{ns}\0{key}`            | [`ConfigEntry`] |
//! | `audit`      | `{ts:020}-{event id}`    | [`AuditEvent`] |
//!
//! The `\0` separator cannot occur in a namespace path or entry key (the API
//! layer rejects it), so prefix iteration over `{ns}\0` is exact and drives
//! both `list` and the delete-namespace cascade. The audit key embeds the
//! event timestamp so reverse iteration is newest-first, and is fully
//! determined by the event fields so re-applying a committed entry upserts
//! the same row.
//!
//! Concurrency follows LMDB: any number of read transactions run
//! concurrently with at most one write transaction; commits are fsynced
//! before returning. The state machine owns the write transactions and uses
//! the `*_in` variants so one committed log entry becomes one transaction.

use std::path::Path;

use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MAP_SIZE: usize = 2 * 1024 * 1024 * 1024;
const MAX_DBS: u32 = 4;

/// Separator between namespace and key in the entries database.
const KEY_SEP: char = '\0';

pub const MAX_AUDIT_LIMIT: usize = 1000;

// ── Entities ─────────────────────────────────────────────────────────────────

/// A configuration namespace, unique by `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner: String,
    /// Unix milliseconds, supplied by the client that created the namespace.
    pub created_at: i64,
}

/// A configuration entry, unique by `(namespace, key)`.
///
/// Exactly one of `value` (inline) and `blob_id` (content-addressed pointer)
/// is set. `version` starts at 1 and increases by one per applied set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub namespace: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub version: u64,
    pub updated_at: i64,
    pub updated_by: String,
}

/// Audit actions, serialized with their dotted wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "config.created")]
    ConfigCreated,
    #[serde(rename = "config.updated")]
    ConfigUpdated,
    #[serde(rename = "config.deleted")]
    ConfigDeleted,
    #[serde(rename = "namespace.created")]
    NamespaceCreated,
    #[serde(rename = "namespace.updated")]
    NamespaceUpdated,
    #[serde(rename = "namespace.deleted")]
    NamespaceDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ConfigCreated => "config.created",
            AuditAction::ConfigUpdated => "config.updated",
            AuditAction::ConfigDeleted => "config.deleted",
            AuditAction::NamespaceCreated => "namespace.created",
            AuditAction::NamespaceUpdated => "namespace.updated",
            AuditAction::NamespaceDeleted => "namespace.deleted",
        }
    }
}

/// An append-only audit row. The id is a deterministic function of
/// `(ts, namespace, key, action)` so every node derives the same row from
/// the same committed command, and re-application collapses into an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub ts: i64,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub action: AuditAction,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
}

/// Derives the deterministic audit event id.
pub fn audit_event_id(ts: i64, namespace: &str, key: Option<&str>, action: AuditAction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ts.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(namespace.as_bytes());
    hasher.update(b"|");
    hasher.update(key.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Heed(#[from] heed::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid namespace or key: must be non-empty and free of NUL bytes")]
    InvalidKey,

    #[error("audit limit {0} outside [1, {MAX_AUDIT_LIMIT}]")]
    InvalidLimit(usize),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ── Store ────────────────────────────────────────────────────────────────────

/// Everything a snapshot carries, as returned by [`AppliedStore::dump_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreDump {
    pub namespaces: Vec<Namespace>,
    pub entries: Vec<ConfigEntry>,
    pub audit: Vec<AuditEvent>,
}

/// Handle to the applied store. Cheap to clone; all clones share the same
/// LMDB environment.
#[derive(Clone)]
pub struct AppliedStore {
    env: Env,
    namespaces: Database<Str, SerdeJson<Namespace>>,
    entries: Database<Str, SerdeJson<ConfigEntry>>,
    audit: Database<Str, SerdeJson<AuditEvent>>,
}

fn entry_key(namespace: &str, key: &str) -> String {
    format!("{namespace}{KEY_SEP}{key}")
}

fn entry_prefix(namespace: &str) -> String {
    format!("{namespace}{KEY_SEP}")
}

fn audit_key(event: &AuditEvent) -> String {
    // Zero-padded millis so lexicographic order is time order; ts is clamped
    // at zero because the padding scheme does not represent negative times.
    format!("{:020}-{}", event.ts.max(0), event.id)
}

fn check_name(s: &str) -> Result<()> {
    if s.is_empty() || s.contains(KEY_SEP) {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

impl AppliedStore {
    /// Opens (creating if needed) the store under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(MAX_DBS)
                .open(path)?
        };
        let mut wtxn = env.write_txn()?;
        let namespaces = env.create_database(&mut wtxn, Some("namespaces"))?;
        let entries = env.create_database(&mut wtxn, Some("entries"))?;
        let audit = env.create_database(&mut wtxn, Some("audit"))?;
        wtxn.commit()?;
        Ok(Self {
            env,
            namespaces,
            entries,
            audit,
        })
    }

    /// The underlying environment. The Raft storage layer creates its own
    /// bookkeeping database in here so that wiping `confman.db` also resets
    /// the last-applied watermark.
    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    // ── Entry reads ──────────────────────────────────────────────────────────

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>> {
        let rtxn = self.read_txn()?;
        self.get_in(&rtxn, namespace, key)
    }

    pub fn get_in(&self, txn: &RoTxn, namespace: &str, key: &str) -> Result<Option<ConfigEntry>> {
        Ok(self.entries.get(txn, &entry_key(namespace, key))?)
    }

    /// All entries of one namespace, ordered by key.
    pub fn list(&self, namespace: &str) -> Result<Vec<ConfigEntry>> {
        let rtxn = self.read_txn()?;
        let mut out = Vec::new();
        for item in self.entries.prefix_iter(&rtxn, &entry_prefix(namespace))? {
            let (_, entry) = item?;
            out.push(entry);
        }
        Ok(out)
    }

    /// Every entry in the store, ordered by `(namespace, key)`.
    pub fn list_all(&self) -> Result<Vec<ConfigEntry>> {
        let rtxn = self.read_txn()?;
        let mut out = Vec::new();
        for item in self.entries.iter(&rtxn)? {
            let (_, entry) = item?;
            out.push(entry);
        }
        Ok(out)
    }

    // ── Entry writes ─────────────────────────────────────────────────────────

    /// Upserts an entry inside a caller-owned transaction, assigning
    /// `version = existing + 1` (or 1 when absent). Timestamps and authorship
    /// on `entry` are preserved verbatim. Returns the stored row.
    pub fn set_in(&self, wtxn: &mut RwTxn, entry: &ConfigEntry) -> Result<ConfigEntry> {
        check_name(&entry.namespace)?;
        check_name(&entry.key)?;
        let ek = entry_key(&entry.namespace, &entry.key);
        let version = match self.entries.get(wtxn, &ek)? {
            Some(existing) => existing.version + 1,
            None => 1,
        };
        let stored = ConfigEntry {
            version,
            ..entry.clone()
        };
        self.entries.put(wtxn, &ek, &stored)?;
        Ok(stored)
    }

    pub fn set(&self, entry: &ConfigEntry) -> Result<ConfigEntry> {
        let mut wtxn = self.write_txn()?;
        let stored = self.set_in(&mut wtxn, entry)?;
        wtxn.commit()?;
        Ok(stored)
    }

    /// Returns the deleted entry, if it existed.
    pub fn delete_in(
        &self,
        wtxn: &mut RwTxn,
        namespace: &str,
        key: &str,
    ) -> Result<Option<ConfigEntry>> {
        let ek = entry_key(namespace, key);
        let existing = self.entries.get(wtxn, &ek)?;
        if existing.is_some() {
            self.entries.delete(wtxn, &ek)?;
        }
        Ok(existing)
    }

    pub fn delete(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>> {
        let mut wtxn = self.write_txn()?;
        let deleted = self.delete_in(&mut wtxn, namespace, key)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    // ── Namespaces ───────────────────────────────────────────────────────────

    pub fn get_namespace(&self, path: &str) -> Result<Option<Namespace>> {
        let rtxn = self.read_txn()?;
        Ok(self.namespaces.get(&rtxn, path)?)
    }

    pub fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let rtxn = self.read_txn()?;
        let mut out = Vec::new();
        for item in self.namespaces.iter(&rtxn)? {
            let (_, ns) = item?;
            out.push(ns);
        }
        Ok(out)
    }

    /// Upserts a namespace. On update the original `created_at` survives;
    /// everything else comes from `ns`. Returns the stored row and whether a
    /// row already existed.
    pub fn set_namespace_in(&self, wtxn: &mut RwTxn, ns: &Namespace) -> Result<(Namespace, bool)> {
        check_name(&ns.path)?;
        let existing = self.namespaces.get(wtxn, &ns.path)?;
        let stored = match &existing {
            Some(prev) => Namespace {
                created_at: prev.created_at,
                ..ns.clone()
            },
            None => ns.clone(),
        };
        self.namespaces.put(wtxn, &stored.path, &stored)?;
        Ok((stored, existing.is_some()))
    }

    pub fn set_namespace(&self, ns: &Namespace) -> Result<(Namespace, bool)> {
        let mut wtxn = self.write_txn()?;
        let stored = self.set_namespace_in(&mut wtxn, ns)?;
        wtxn.commit()?;
        Ok(stored)
    }

    /// Deletes a namespace and cascades to all of its entries within the same
    /// transaction. Returns the namespace row if it existed.
    pub fn delete_namespace_in(&self, wtxn: &mut RwTxn, path: &str) -> Result<Option<Namespace>> {
        let existing = self.namespaces.get(wtxn, path)?;
        if existing.is_none() {
            return Ok(None);
        }
        self.namespaces.delete(wtxn, path)?;

        let prefix = entry_prefix(path);
        let mut doomed = Vec::new();
        for item in self.entries.prefix_iter(wtxn, &prefix)? {
            let (key, _) = item?;
            doomed.push(key.to_string());
        }
        for key in doomed {
            self.entries.delete(wtxn, &key)?;
        }
        Ok(existing)
    }

    pub fn delete_namespace(&self, path: &str) -> Result<Option<Namespace>> {
        let mut wtxn = self.write_txn()?;
        let deleted = self.delete_namespace_in(&mut wtxn, path)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    // ── Audit ────────────────────────────────────────────────────────────────

    /// Upserts an audit event by its deterministic key. Re-appending the
    /// same logical event overwrites the identical row.
    pub fn append_audit_in(&self, wtxn: &mut RwTxn, event: &AuditEvent) -> Result<()> {
        self.audit.put(wtxn, &audit_key(event), event)?;
        Ok(())
    }

    pub fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        let mut wtxn = self.write_txn()?;
        self.append_audit_in(&mut wtxn, event)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Newest-first audit events for one namespace. `limit` must be within
    /// `[1, 1000]`.
    pub fn audit_events(&self, namespace: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        if limit == 0 || limit > MAX_AUDIT_LIMIT {
            return Err(StoreError::InvalidLimit(limit));
        }
        let rtxn = self.read_txn()?;
        let mut out = Vec::new();
        for item in self.audit.rev_iter(&rtxn)? {
            let (_, event) = item?;
            if event.namespace == namespace {
                out.push(event);
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    // ── Bulk (snapshots) ─────────────────────────────────────────────────────

    /// Dumps the entire store in deterministic key order.
    pub fn dump_all(&self) -> Result<StoreDump> {
        let rtxn = self.read_txn()?;
        let mut dump = StoreDump::default();
        for item in self.namespaces.iter(&rtxn)? {
            dump.namespaces.push(item?.1);
        }
        for item in self.entries.iter(&rtxn)? {
            dump.entries.push(item?.1);
        }
        for item in self.audit.iter(&rtxn)? {
            dump.audit.push(item?.1);
        }
        Ok(dump)
    }

    /// Replaces the whole store with `dump` inside the caller's transaction:
    /// clear then bulk insert. Aborting the transaction rolls everything
    /// back, so a failed restore leaves the previous state intact.
    pub fn restore_in(&self, wtxn: &mut RwTxn, dump: &StoreDump) -> Result<()> {
        self.namespaces.clear(wtxn)?;
        self.entries.clear(wtxn)?;
        self.audit.clear(wtxn)?;
        for ns in &dump.namespaces {
            self.namespaces.put(wtxn, &ns.path, ns)?;
        }
        for entry in &dump.entries {
            self.entries
                .put(wtxn, &entry_key(&entry.namespace, &entry.key), entry)?;
        }
        for event in &dump.audit {
            self.audit.put(wtxn, &audit_key(event), event)?;
        }
        Ok(())
    }

    pub fn restore_from_snapshot(&self, dump: &StoreDump) -> Result<()> {
        let mut wtxn = self.write_txn()?;
        self.restore_in(&mut wtxn, dump)?;
        wtxn.commit()?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, AppliedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AppliedStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn entry(ns: &str, key: &str, value: &str) -> ConfigEntry {
        ConfigEntry {
            namespace: ns.to_string(),
            key: key.to_string(),
            value: Some(value.to_string()),
            blob_id: None,
            entry_type: "string".to_string(),
            version: 0,
            updated_at: 1_700_000_000_000,
            updated_by: "alice".to_string(),
        }
    }

    #[test]
    fn set_assigns_monotonic_versions() {
        let (_dir, store) = open_store();
        let first = store.set(&entry("/t1", "flag", "on")).unwrap();
        assert_eq!(first.version, 1);
        let second = store.set(&entry("/t1", "flag", "off")).unwrap();
        assert_eq!(second.version, 2);
        let third = store.set(&entry("/t1", "flag", "on")).unwrap();
        assert_eq!(third.version, 3);

        let got = store.get("/t1", "flag").unwrap().unwrap();
        assert_eq!(got.value.as_deref(), Some("on"));
        assert_eq!(got.version, 3);
    }

    #[test]
    fn distinct_keys_version_independently() {
        let (_dir, store) = open_store();
        store.set(&entry("/t1", "a", "1")).unwrap();
        store.set(&entry("/t1", "a", "2")).unwrap();
        let b = store.set(&entry("/t1", "b", "1")).unwrap();
        assert_eq!(b.version, 1);
    }

    #[test]
    fn delete_returns_previous_row() {
        let (_dir, store) = open_store();
        store.set(&entry("/t1", "flag", "on")).unwrap();
        let deleted = store.delete("/t1", "flag").unwrap().unwrap();
        assert_eq!(deleted.value.as_deref(), Some("on"));
        assert!(store.get("/t1", "flag").unwrap().is_none());
        assert!(store.delete("/t1", "flag").unwrap().is_none());
    }

    #[test]
    fn namespace_update_preserves_created_at() {
        let (_dir, store) = open_store();
        let ns = Namespace {
            path: "/teams/payments".to_string(),
            description: Some("payments config".to_string()),
            owner: "alice".to_string(),
            created_at: 100,
        };
        let (stored, existed) = store.set_namespace(&ns).unwrap();
        assert!(!existed);
        assert_eq!(stored.created_at, 100);

        let update = Namespace {
            description: Some("same team, new desc".to_string()),
            owner: "bob".to_string(),
            created_at: 999,
            ..ns
        };
        let (stored, existed) = store.set_namespace(&update).unwrap();
        assert!(existed);
        assert_eq!(stored.created_at, 100);
        assert_eq!(stored.owner, "bob");
    }

    #[test]
    fn delete_namespace_cascades_to_entries() {
        let (_dir, store) = open_store();
        let ns = Namespace {
            path: "/t2".to_string(),
            description: None,
            owner: "alice".to_string(),
            created_at: 1,
        };
        store.set_namespace(&ns).unwrap();
        store.set(&entry("/t2", "a", "1")).unwrap();
        store.set(&entry("/t2", "b", "2")).unwrap();
        // A sibling namespace whose path shares a prefix must survive.
        store.set(&entry("/t20", "c", "3")).unwrap();

        store.delete_namespace("/t2").unwrap().unwrap();

        assert!(store.get_namespace("/t2").unwrap().is_none());
        let remaining = store.list_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].namespace, "/t20");
    }

    #[test]
    fn audit_append_is_idempotent() {
        let (_dir, store) = open_store();
        let id = audit_event_id(42, "/t1", Some("flag"), AuditAction::ConfigCreated);
        let event = AuditEvent {
            id: id.clone(),
            ts: 42,
            namespace: "/t1".to_string(),
            key: Some("flag".to_string()),
            action: AuditAction::ConfigCreated,
            actor: "alice".to_string(),
            old_value: None,
            new_value: Some("on".to_string()),
        };
        store.append_audit(&event).unwrap();
        store.append_audit(&event).unwrap();
        let events = store.audit_events("/t1", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
    }

    #[test]
    fn audit_listing_is_newest_first_and_limited() {
        let (_dir, store) = open_store();
        for ts in 1..=5i64 {
            let event = AuditEvent {
                id: audit_event_id(ts, "/t1", None, AuditAction::NamespaceUpdated),
                ts,
                namespace: "/t1".to_string(),
                key: None,
                action: AuditAction::NamespaceUpdated,
                actor: "alice".to_string(),
                old_value: None,
                new_value: None,
            };
            store.append_audit(&event).unwrap();
        }
        let events = store.audit_events("/t1", 3).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].ts, 5);
        assert_eq!(events[2].ts, 3);

        assert!(matches!(
            store.audit_events("/t1", 0),
            Err(StoreError::InvalidLimit(0))
        ));
        assert!(matches!(
            store.audit_events("/t1", 1001),
            Err(StoreError::InvalidLimit(1001))
        ));
    }

    #[test]
    fn audit_ids_are_deterministic() {
        let a = audit_event_id(42, "/t1", Some("k"), AuditAction::ConfigUpdated);
        let b = audit_event_id(42, "/t1", Some("k"), AuditAction::ConfigUpdated);
        let c = audit_event_id(43, "/t1", Some("k"), AuditAction::ConfigUpdated);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn dump_and_restore_round_trip() {
        let (_dir, store) = open_store();
        let ns = Namespace {
            path: "/t1".to_string(),
            description: None,
            owner: "alice".to_string(),
            created_at: 1,
        };
        store.set_namespace(&ns).unwrap();
        store.set(&entry("/t1", "a", "1")).unwrap();
        store.set(&entry("/t1", "b", "2")).unwrap();
        let dump = store.dump_all().unwrap();

        let (_dir2, other) = open_store();
        other.set(&entry("/junk", "x", "y")).unwrap();
        other.restore_from_snapshot(&dump).unwrap();

        assert_eq!(other.dump_all().unwrap(), dump);
        assert!(other.get("/junk", "x").unwrap().is_none());
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let (_dir, store) = open_store();
        let mut bad = entry("/t1", "flag", "on");
        bad.key = "fl\0ag".to_string();
        assert!(matches!(store.set(&bad), Err(StoreError::InvalidKey)));
    }
}
