use std::env;
use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::{PartialClientSettings, PartialSettings, Settings};
use crate::client::ClientConfig;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use crate::utils::HubLinkError;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.pool.max_connections, 1000);
    assert_eq!(settings.pool.connection_timeout_ms, 300_000);
    assert_eq!(settings.pool.max_inactive_ms, 120_000);
    assert!(settings.client.reconnect_enabled);
    assert_eq!(settings.client.reconnect_interval_ms, 1000);
    assert_eq!(settings.client.max_reconnect_attempts, 5);
    assert_eq!(settings.client.heartbeat_interval_ms, 5000);
    assert_eq!(settings.client.heartbeat_timeout_ms, 3000);
    assert_eq!(settings.client.max_missed_heartbeats, 3);
    assert_eq!(settings.client.ack_timeout_ms, 10_000);
    assert_eq!(settings.queue.max_size, 1000);
    assert!(settings.queue.persistence_enabled);
}

#[test]
fn test_merge_keeps_defaults_for_missing_fields() {
    let partial = PartialSettings {
        client: Some(PartialClientSettings {
            max_reconnect_attempts: Some(3),
            api_key: Some("exec-key".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let settings = Settings::merge(partial);
    assert_eq!(settings.client.max_reconnect_attempts, 3);
    assert_eq!(settings.client.api_key.as_deref(), Some("exec-key"));
    assert_eq!(settings.client.reconnect_interval_ms, 1000);
    assert_eq!(settings.server.port, 8080);
}

#[test]
fn test_component_configs_from_settings() {
    let settings = Settings::default();

    let client = ClientConfig::from(&settings.client);
    assert_eq!(client.reconnect_interval, Duration::from_millis(1000));
    assert_eq!(client.heartbeat.interval, Duration::from_millis(5000));
    assert_eq!(client.heartbeat.max_missed, 3);
    assert_eq!(client.ack_timeout, Duration::from_secs(10));

    let queue = QueueConfig::from(&settings.queue);
    assert_eq!(queue.max_size, 1000);
    assert_eq!(queue.cleanup_interval, Duration::from_secs(30));

    let pool = PoolConfig::from(&settings.pool);
    assert_eq!(pool.max_connections, 1000);
    assert_eq!(pool.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(pool.cleanup_interval, Duration::from_secs(300));
    assert_eq!(pool.max_inactive, Duration::from_secs(120));
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [pool]
        max_connections = 10

        [pool.api_keys]
        key-abc = "executor-1"

        [client]
        max_reconnect_attempts = 3
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.pool.max_connections, 10);
    assert_eq!(
        cfg.pool.api_keys.get("key-abc").map(String::as_str),
        Some("executor-1")
    );
    assert_eq!(cfg.client.max_reconnect_attempts, 3);
    assert_eq!(cfg.queue.max_size, 1000);
}

#[test]
#[serial]
fn load_config_from_environment() {
    temp_env::with_vars(
        [
            ("HUBLINK__SERVER__PORT", Some("9100")),
            ("HUBLINK__QUEUE__PERSISTENCE_ENABLED", Some("false")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert!(!cfg.queue.persistence_enabled);
        },
    );
}

#[test]
fn validate_rejects_zero_periods() {
    assert!(Settings::default().validate().is_ok());

    let mut settings = Settings::default();
    settings.queue.retry_base_delay_ms = 0;
    let err = settings.validate().unwrap_err();
    assert!(err.to_string().contains("queue.retry_base_delay_ms"));

    let mut settings = Settings::default();
    settings.pool.cleanup_interval_ms = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.client.max_missed_heartbeats = 0;
    assert!(settings.validate().is_err());
}

#[test]
#[serial]
fn load_config_refuses_zero_heartbeat_interval() {
    temp_env::with_var("HUBLINK__CLIENT__HEARTBEAT_INTERVAL_MS", Some("0"), || {
        let err = load_config().unwrap_err();
        assert!(matches!(err, HubLinkError::Config(_)));
        assert!(err.to_string().contains("client.heartbeat_interval_ms"));
    });
}
