//! Configuration layering: defaults, YAML file, environment overrides.

use std::io::Write;

use confman::config::{FailureMode, NodeConfig};
use serial_test::serial;

fn clear_confman_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("CONFMAN_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn defaults_without_file_or_env() {
    clear_confman_env();
    let cfg = NodeConfig::load().unwrap();
    assert_eq!(cfg.batch_max_size, 50);
    assert_eq!(cfg.batch_max_wait_ms, 1);
    assert_eq!(cfg.snapshot_interval, 100);
    assert_eq!(cfg.inline_threshold_bytes, 65536);
    assert_eq!(cfg.read_barrier_failure_mode, FailureMode::Reject);
    assert!(cfg.blobs_enabled);
    // Data path is qualified by the HTTP port.
    assert!(cfg
        .data_path
        .to_string_lossy()
        .contains(&cfg.http_port().to_string()));
}

#[test]
#[serial]
fn yaml_file_layers_under_env() {
    clear_confman_env();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
node_id: "from-file"
batch_max_size: 20
snapshot_interval: 10
read_barrier_failure_mode: "timeout"
members:
  - "http://10.0.0.1:4200"
  - "http://10.0.0.2:4200"
  - "http://10.0.0.3:4200"
"#
    )
    .unwrap();

    std::env::set_var("CONFMAN_CONFIG", file.path());
    std::env::set_var("CONFMAN_BATCH_MAX_SIZE", "30");

    let cfg = NodeConfig::load().unwrap();
    std::env::remove_var("CONFMAN_CONFIG");
    std::env::remove_var("CONFMAN_BATCH_MAX_SIZE");

    assert_eq!(cfg.node_id, "from-file");
    // Env wins over the file.
    assert_eq!(cfg.batch_max_size, 30);
    // File wins over the default.
    assert_eq!(cfg.snapshot_interval, 10);
    assert_eq!(cfg.read_barrier_failure_mode, FailureMode::Timeout);
    assert_eq!(cfg.members.len(), 3);
}

#[test]
#[serial]
fn member_list_parses_from_env() {
    clear_confman_env();
    std::env::set_var(
        "CONFMAN_MEMBERS",
        "http://10.0.0.1:4200, http://10.0.0.2:4200/ ,http://10.0.0.3:4200",
    );
    let cfg = NodeConfig::load().unwrap();
    std::env::remove_var("CONFMAN_MEMBERS");

    assert_eq!(
        cfg.members,
        vec![
            "http://10.0.0.1:4200",
            "http://10.0.0.2:4200",
            "http://10.0.0.3:4200"
        ]
    );
}

#[test]
#[serial]
fn bad_failure_mode_is_rejected() {
    clear_confman_env();
    std::env::set_var("CONFMAN_READ_BARRIER_FAILURE_MODE", "buffered");
    let result = NodeConfig::load();
    std::env::remove_var("CONFMAN_READ_BARRIER_FAILURE_MODE");
    assert!(result.is_err());
}

#[test]
#[serial]
fn missing_config_file_is_an_error() {
    clear_confman_env();
    std::env::set_var("CONFMAN_CONFIG", "/nonexistent/confman.yaml");
    let result = NodeConfig::load();
    std::env::remove_var("CONFMAN_CONFIG");
    assert!(result.is_err());
}
