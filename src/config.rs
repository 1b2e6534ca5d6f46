//! Node configuration.
//!
//! Every knob can be set three ways, lowest precedence first:
//!
//! 1. Built-in default
//! 2. YAML config file pointed at by `CONFMAN_CONFIG`
//! 3. `CONFMAN_*` environment variable
//!
//! The environment always wins, which is what container deployments expect:
//! a shared YAML base plus per-node env overrides (identity, addresses).
//!
//! | Env var | Meaning | Default |
//! |---------|---------|---------|
//! | `CONFMAN_NODE_ID` | Stable node identity | hostname or `confman-node` |
//! | `CONFMAN_PUBLIC_ENDPOINT` | This node's advertised URL | `http://127.0.0.1:{port}` |
//! | `CONFMAN_MEMBERS` | Comma-separated peer URLs (all nodes) | empty (single node) |
//! | `CONFMAN_HTTP_ADDR` | HTTP bind address | `0.0.0.0:4200` |
//! | `CONFMAN_GRPC_ADDR` | Raft transport bind address | HTTP port + 1000 |
//! | `CONFMAN_DATA_PATH` | Data root | `./data-{port}` |
//! | `CONFMAN_BATCH_MAX_SIZE` | Commands per Raft batch | 50 |
//! | `CONFMAN_BATCH_MAX_WAIT_MS` | Batch fill deadline | 1 |
//! | `CONFMAN_BATCH_MAX_BYTES` | Encoded bytes per batch | 4 MiB |
//! | `CONFMAN_FLUSH_INTERVAL_MS` | Log group-commit window | 100 |
//! | `CONFMAN_SNAPSHOT_INTERVAL` | Applied entries between snapshots | 100 |
//! | `CONFMAN_READ_BARRIER_ENABLED` | Linearizable read gate | true |
//! | `CONFMAN_READ_BARRIER_TIMEOUT_MS` | Barrier deadline | 5000 |
//! | `CONFMAN_READ_BARRIER_FAILURE_MODE` | `reject` / `timeout` / `stale` | reject |
//! | `CONFMAN_BLOBS_ENABLED` | Blob path master switch | true |
//! | `CONFMAN_INLINE_THRESHOLD_BYTES` | Inline-vs-blob cutover | 65536 |
//! | `CONFMAN_MAX_BLOB_SIZE_BYTES` | Compressed on-disk ceiling | 50 MiB |
//! | `CONFMAN_MAX_DECOMPRESSED_SIZE_BYTES` | Decompression ceiling | 200 MiB |
//! | `CONFMAN_CLUSTER_TOKEN` | Shared secret for internal routes | empty |
//! | `CONFMAN_AUDIT_ENABLED` | Audit rows on apply | true |

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// What a read does when the barrier cannot be satisfied in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// 503 + `Retry-After` — the safe default for a source-of-truth store.
    Reject,
    /// 504 — surface the barrier wait as a gateway timeout.
    Timeout,
    /// Serve possibly stale data and log a warning.
    Stale,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::Reject => "reject",
            FailureMode::Timeout => "timeout",
            FailureMode::Stale => "stale",
        }
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(FailureMode::Reject),
            "timeout" => Ok(FailureMode::Timeout),
            "stale" => Ok(FailureMode::Stale),
            other => Err(format!(
                "invalid failure mode {other:?}: use 'reject', 'timeout', or 'stale'"
            )),
        }
    }
}

/// Optional fields as they appear in the YAML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    node_id: Option<String>,
    public_endpoint: Option<String>,
    members: Option<Vec<String>>,
    http_addr: Option<String>,
    grpc_addr: Option<String>,
    data_path: Option<PathBuf>,
    batch_max_size: Option<usize>,
    batch_max_wait_ms: Option<u64>,
    batch_max_bytes: Option<usize>,
    flush_interval_ms: Option<u64>,
    snapshot_interval: Option<u64>,
    read_barrier_enabled: Option<bool>,
    read_barrier_timeout_ms: Option<u64>,
    read_barrier_failure_mode: Option<String>,
    blobs_enabled: Option<bool>,
    inline_threshold_bytes: Option<usize>,
    max_blob_size_bytes: Option<u64>,
    max_decompressed_size_bytes: Option<u64>,
    cluster_token: Option<String>,
    audit_enabled: Option<bool>,
}

/// Fully-resolved node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub public_endpoint: String,
    pub members: Vec<String>,
    pub http_addr: String,
    pub grpc_addr: String,
    pub data_path: PathBuf,
    pub batch_max_size: usize,
    pub batch_max_wait_ms: u64,
    pub batch_max_bytes: usize,
    pub flush_interval_ms: u64,
    pub snapshot_interval: u64,
    pub read_barrier_enabled: bool,
    pub read_barrier_timeout_ms: u64,
    pub read_barrier_failure_mode: FailureMode,
    pub blobs_enabled: bool,
    pub inline_threshold_bytes: usize,
    pub max_blob_size_bytes: u64,
    pub max_decompressed_size_bytes: u64,
    pub cluster_token: String,
    pub audit_enabled: bool,
}

fn env_var(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}

fn port_of(addr: &str) -> u16 {
    addr.rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4200)
}

impl NodeConfig {
    /// Loads the configuration: defaults, then the `CONFMAN_CONFIG` YAML file
    /// when present, then `CONFMAN_*` env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match env_var("CONFMAN_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::File {
                    path: path.clone(),
                    source,
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml { path, source })?
            }
            None => FileConfig::default(),
        };
        Self::resolve(file)
    }

    fn resolve(file: FileConfig) -> Result<Self, ConfigError> {
        let http_addr = env_var("CONFMAN_HTTP_ADDR")
            .or(file.http_addr)
            .unwrap_or_else(|| "0.0.0.0:4200".to_string());
        let http_port = port_of(&http_addr);

        let grpc_addr = env_var("CONFMAN_GRPC_ADDR")
            .or(file.grpc_addr)
            .unwrap_or_else(|| format!("0.0.0.0:{}", http_port + 1000));

        let node_id = env_var("CONFMAN_NODE_ID")
            .or(file.node_id)
            .or_else(|| env_var("HOSTNAME"))
            .unwrap_or_else(|| "confman-node".to_string());

        let public_endpoint = env_var("CONFMAN_PUBLIC_ENDPOINT")
            .or(file.public_endpoint)
            .unwrap_or_else(|| format!("http://127.0.0.1:{http_port}"));

        let members = match env_var("CONFMAN_MEMBERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
            None => file
                .members
                .unwrap_or_default()
                .into_iter()
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
        };

        // Port-qualified default so several nodes can share one host.
        let data_path = match env_var("CONFMAN_DATA_PATH") {
            Some(p) => PathBuf::from(p),
            None => file
                .data_path
                .unwrap_or_else(|| PathBuf::from(format!("./data-{http_port}"))),
        };

        let read_barrier_failure_mode = match env_var("CONFMAN_READ_BARRIER_FAILURE_MODE")
            .or(file.read_barrier_failure_mode)
        {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "CONFMAN_READ_BARRIER_FAILURE_MODE",
                value: raw,
            })?,
            None => FailureMode::Reject,
        };

        Ok(Self {
            node_id,
            public_endpoint: public_endpoint.trim_end_matches('/').to_string(),
            members,
            http_addr,
            grpc_addr,
            data_path,
            batch_max_size: env_parse("CONFMAN_BATCH_MAX_SIZE")?
                .or(file.batch_max_size)
                .unwrap_or(50),
            batch_max_wait_ms: env_parse("CONFMAN_BATCH_MAX_WAIT_MS")?
                .or(file.batch_max_wait_ms)
                .unwrap_or(1),
            batch_max_bytes: env_parse("CONFMAN_BATCH_MAX_BYTES")?
                .or(file.batch_max_bytes)
                .unwrap_or(4 * 1024 * 1024),
            flush_interval_ms: env_parse("CONFMAN_FLUSH_INTERVAL_MS")?
                .or(file.flush_interval_ms)
                .unwrap_or(100),
            snapshot_interval: env_parse("CONFMAN_SNAPSHOT_INTERVAL")?
                .or(file.snapshot_interval)
                .unwrap_or(100),
            read_barrier_enabled: env_bool("CONFMAN_READ_BARRIER_ENABLED")?
                .or(file.read_barrier_enabled)
                .unwrap_or(true),
            read_barrier_timeout_ms: env_parse("CONFMAN_READ_BARRIER_TIMEOUT_MS")?
                .or(file.read_barrier_timeout_ms)
                .unwrap_or(5000),
            read_barrier_failure_mode,
            blobs_enabled: env_bool("CONFMAN_BLOBS_ENABLED")?
                .or(file.blobs_enabled)
                .unwrap_or(true),
            inline_threshold_bytes: env_parse("CONFMAN_INLINE_THRESHOLD_BYTES")?
                .or(file.inline_threshold_bytes)
                .unwrap_or(65536),
            max_blob_size_bytes: env_parse("CONFMAN_MAX_BLOB_SIZE_BYTES")?
                .or(file.max_blob_size_bytes)
                .unwrap_or(50 * 1024 * 1024),
            max_decompressed_size_bytes: env_parse("CONFMAN_MAX_DECOMPRESSED_SIZE_BYTES")?
                .or(file.max_decompressed_size_bytes)
                .unwrap_or(200 * 1024 * 1024),
            cluster_token: env_var("CONFMAN_CLUSTER_TOKEN")
                .or(file.cluster_token)
                .unwrap_or_default(),
            audit_enabled: env_bool("CONFMAN_AUDIT_ENABLED")?
                .or(file.audit_enabled)
                .unwrap_or(true),
        })
    }

    /// The HTTP port, parsed from the bind address.
    pub fn http_port(&self) -> u16 {
        port_of(&self.http_addr)
    }

    /// A single-node configuration for tests, rooted in a caller-owned dir.
    pub fn for_testing(data_path: PathBuf) -> Self {
        Self {
            node_id: "test-node".to_string(),
            public_endpoint: "http://127.0.0.1:4200".to_string(),
            members: vec![],
            http_addr: "127.0.0.1:4200".to_string(),
            grpc_addr: "127.0.0.1:5200".to_string(),
            data_path,
            batch_max_size: 50,
            batch_max_wait_ms: 1,
            batch_max_bytes: 4 * 1024 * 1024,
            flush_interval_ms: 100,
            snapshot_interval: 100,
            read_barrier_enabled: true,
            read_barrier_timeout_ms: 5000,
            read_barrier_failure_mode: FailureMode::Reject,
            blobs_enabled: true,
            inline_threshold_bytes: 65536,
            max_blob_size_bytes: 50 * 1024 * 1024,
            max_decompressed_size_bytes: 200 * 1024 * 1024,
            cluster_token: "test-token".to_string(),
            audit_enabled: true,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn failure_mode_parses() {
        assert_eq!("reject".parse::<FailureMode>().unwrap(), FailureMode::Reject);
        assert_eq!("TIMEOUT".parse::<FailureMode>().unwrap(), FailureMode::Timeout);
        assert_eq!("Stale".parse::<FailureMode>().unwrap(), FailureMode::Stale);
        assert!("buffered".parse::<FailureMode>().is_err());
    }

    #[test]
    #[serial]
    fn built_in_defaults() {
        let cfg = NodeConfig::resolve(FileConfig::default()).unwrap();
        assert_eq!(cfg.batch_max_size, 50);
        assert_eq!(cfg.batch_max_wait_ms, 1);
        assert_eq!(cfg.batch_max_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.snapshot_interval, 100);
        assert_eq!(cfg.read_barrier_timeout_ms, 5000);
        assert_eq!(cfg.read_barrier_failure_mode, FailureMode::Reject);
        assert_eq!(cfg.inline_threshold_bytes, 65536);
        assert_eq!(cfg.max_blob_size_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.max_decompressed_size_bytes, 200 * 1024 * 1024);
        assert!(cfg.read_barrier_enabled);
        assert!(cfg.audit_enabled);
    }

    #[test]
    #[serial]
    fn data_path_is_port_qualified() {
        let cfg = NodeConfig::resolve(FileConfig {
            http_addr: Some("0.0.0.0:4301".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.data_path, PathBuf::from("./data-4301"));
        assert_eq!(cfg.grpc_addr, "0.0.0.0:5301");
    }

    #[test]
    #[serial]
    fn file_values_fill_in() {
        let file: FileConfig = serde_yaml::from_str(
            r#"
node_id: "node-a"
members:
  - "http://10.0.0.1:4200"
  - "http://10.0.0.2:4200/"
batch_max_size: 10
read_barrier_failure_mode: "stale"
"#,
        )
        .unwrap();
        let cfg = NodeConfig::resolve(file).unwrap();
        assert_eq!(cfg.node_id, "node-a");
        assert_eq!(cfg.batch_max_size, 10);
        assert_eq!(cfg.read_barrier_failure_mode, FailureMode::Stale);
        assert_eq!(cfg.members, vec!["http://10.0.0.1:4200", "http://10.0.0.2:4200"]);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        std::env::set_var("CONFMAN_BATCH_MAX_SIZE", "7");
        let cfg = NodeConfig::resolve(FileConfig {
            batch_max_size: Some(10),
            ..Default::default()
        })
        .unwrap();
        std::env::remove_var("CONFMAN_BATCH_MAX_SIZE");
        assert_eq!(cfg.batch_max_size, 7);
    }

    #[test]
    #[serial]
    fn invalid_env_value_is_an_error() {
        std::env::set_var("CONFMAN_BATCH_MAX_SIZE", "many");
        let result = NodeConfig::resolve(FileConfig::default());
        std::env::remove_var("CONFMAN_BATCH_MAX_SIZE");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }
}
