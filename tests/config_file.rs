use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use meshcitadel::config::Config;
use meshcitadel::transport::EngineConfig;

#[tokio::test]
async fn init_writes_a_loadable_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();

    assert_ok!(Config::create_default(path).await);
    let cfg = assert_ok!(Config::load(path).await);
    assert_ok!(cfg.validate());
    assert_eq!(cfg.delivery.cancel_keyword, "stop");
    assert_eq!(cfg.meshcore.baud_rate, 115200);
}

#[tokio::test]
async fn file_values_reach_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[delivery]
ack_timeout_ms = 4000
max_retries = 1
inter_packet_delay_ms = 250
chunk_markers = true
cancel_keyword = "halt"

[dedup]
window_secs = 45

[storage]
data_dir = "/var/lib/citadel"
"#,
    )
    .unwrap();

    let cfg = assert_ok!(Config::load(path.to_str().unwrap()).await);
    assert_ok!(cfg.validate());
    let engine = EngineConfig::from(&cfg);
    assert_eq!(engine.outbox.policy.ack_timeout, Duration::from_secs(4));
    assert_eq!(engine.outbox.policy.max_retries, 1);
    assert_eq!(engine.outbox.inter_packet_delay, Duration::from_millis(250));
    assert!(engine.outbox.chunk_markers);
    assert_eq!(engine.cancel_keyword, "halt");
    assert_eq!(engine.dedup_window, Duration::from_secs(45));
    assert_eq!(
        engine.node_cache.as_deref(),
        Some(std::path::Path::new("/var/lib/citadel/node_cache.json"))
    );
}

#[tokio::test]
async fn unreadable_file_names_the_path() {
    let err = assert_err!(Config::load("/nonexistent/citadel.toml").await);
    assert!(err.to_string().contains("/nonexistent/citadel.toml"));
}

#[tokio::test]
async fn malformed_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[delivery\nmax_retries = ").unwrap();
    let err = assert_err!(Config::load(path.to_str().unwrap()).await);
    assert!(err.to_string().contains("Failed to parse"));
}
