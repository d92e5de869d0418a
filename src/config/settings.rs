use std::collections::HashMap;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use crate::client::ClientConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub pool: PoolSettings,
    pub client: ClientSettings,
    pub queue: QueueSettings,
    pub logging: LoggingSettings,
}

/// Address the hub listens on.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Server-side connection pool limits and sweep intervals.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
    pub max_inactive_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// API key -> executor identity.
    pub api_keys: HashMap<String, String>,
}

/// Executor-side connection behaviour.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub reconnect_enabled: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_missed_heartbeats: u32,
    pub ack_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

/// Outbound queue limits and persistence.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub max_size: usize,
    pub persistence_enabled: bool,
    pub storage_path: String,
    pub default_ttl_ms: u64,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub cleanup_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub pool: Option<PartialPoolSettings>,
    pub client: Option<PartialClientSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPoolSettings {
    pub max_connections: Option<usize>,
    pub connection_timeout_ms: Option<u64>,
    pub max_inactive_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub api_keys: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub reconnect_enabled: Option<bool>,
    pub reconnect_interval_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub max_missed_heartbeats: Option<u32>,
    pub ack_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub max_size: Option<usize>,
    pub persistence_enabled: Option<bool>,
    pub storage_path: Option<String>,
    pub default_ttl_ms: Option<u64>,
    pub default_max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            pool: PoolSettings {
                max_connections: 1000,
                connection_timeout_ms: 300_000,
                max_inactive_ms: 120_000,
                heartbeat_interval_ms: 30_000,
                cleanup_interval_ms: 300_000,
                api_keys: HashMap::new(),
            },
            client: ClientSettings {
                url: "ws://127.0.0.1:8080".to_string(),
                api_key: None,
                reconnect_enabled: true,
                reconnect_interval_ms: 1000,
                max_reconnect_attempts: 5,
                heartbeat_interval_ms: 5000,
                heartbeat_timeout_ms: 3000,
                max_missed_heartbeats: 3,
                ack_timeout_ms: 10_000,
                connect_timeout_ms: 10_000,
            },
            queue: QueueSettings {
                max_size: 1000,
                persistence_enabled: true,
                storage_path: "hublink_queue".to_string(),
                default_ttl_ms: 300_000,
                default_max_retries: 3,
                retry_base_delay_ms: 1000,
                cleanup_interval_ms: 30_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fill every field missing from `partial` with its default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let pool = partial.pool.unwrap_or_default();
        let client = partial.client.unwrap_or_default();
        let queue = partial.queue.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            pool: PoolSettings {
                max_connections: pool.max_connections.unwrap_or(default.pool.max_connections),
                connection_timeout_ms: pool
                    .connection_timeout_ms
                    .unwrap_or(default.pool.connection_timeout_ms),
                max_inactive_ms: pool.max_inactive_ms.unwrap_or(default.pool.max_inactive_ms),
                heartbeat_interval_ms: pool
                    .heartbeat_interval_ms
                    .unwrap_or(default.pool.heartbeat_interval_ms),
                cleanup_interval_ms: pool
                    .cleanup_interval_ms
                    .unwrap_or(default.pool.cleanup_interval_ms),
                api_keys: pool.api_keys.unwrap_or(default.pool.api_keys),
            },
            client: ClientSettings {
                url: client.url.unwrap_or(default.client.url),
                api_key: client.api_key.or(default.client.api_key),
                reconnect_enabled: client
                    .reconnect_enabled
                    .unwrap_or(default.client.reconnect_enabled),
                reconnect_interval_ms: client
                    .reconnect_interval_ms
                    .unwrap_or(default.client.reconnect_interval_ms),
                max_reconnect_attempts: client
                    .max_reconnect_attempts
                    .unwrap_or(default.client.max_reconnect_attempts),
                heartbeat_interval_ms: client
                    .heartbeat_interval_ms
                    .unwrap_or(default.client.heartbeat_interval_ms),
                heartbeat_timeout_ms: client
                    .heartbeat_timeout_ms
                    .unwrap_or(default.client.heartbeat_timeout_ms),
                max_missed_heartbeats: client
                    .max_missed_heartbeats
                    .unwrap_or(default.client.max_missed_heartbeats),
                ack_timeout_ms: client.ack_timeout_ms.unwrap_or(default.client.ack_timeout_ms),
                connect_timeout_ms: client
                    .connect_timeout_ms
                    .unwrap_or(default.client.connect_timeout_ms),
            },
            queue: QueueSettings {
                max_size: queue.max_size.unwrap_or(default.queue.max_size),
                persistence_enabled: queue
                    .persistence_enabled
                    .unwrap_or(default.queue.persistence_enabled),
                storage_path: queue.storage_path.unwrap_or(default.queue.storage_path),
                default_ttl_ms: queue.default_ttl_ms.unwrap_or(default.queue.default_ttl_ms),
                default_max_retries: queue
                    .default_max_retries
                    .unwrap_or(default.queue.default_max_retries),
                retry_base_delay_ms: queue
                    .retry_base_delay_ms
                    .unwrap_or(default.queue.retry_base_delay_ms),
                cleanup_interval_ms: queue
                    .cleanup_interval_ms
                    .unwrap_or(default.queue.cleanup_interval_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

impl Settings {
    /// Reject values the runtime cannot work with: every period must be
    /// non-zero and at least one missed heartbeat must be tolerated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("pool.heartbeat_interval_ms", self.pool.heartbeat_interval_ms),
            ("pool.cleanup_interval_ms", self.pool.cleanup_interval_ms),
            ("client.reconnect_interval_ms", self.client.reconnect_interval_ms),
            ("client.heartbeat_interval_ms", self.client.heartbeat_interval_ms),
            ("client.heartbeat_timeout_ms", self.client.heartbeat_timeout_ms),
            ("client.ack_timeout_ms", self.client.ack_timeout_ms),
            ("client.connect_timeout_ms", self.client.connect_timeout_ms),
            ("queue.retry_base_delay_ms", self.queue.retry_base_delay_ms),
            ("queue.cleanup_interval_ms", self.queue.cleanup_interval_ms),
        ];
        if let Some((key, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Message(format!("{key} must be greater than zero")));
        }
        if self.client.max_missed_heartbeats == 0 {
            return Err(ConfigError::Message(
                "client.max_missed_heartbeats must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&ClientSettings> for HeartbeatConfig {
    fn from(settings: &ClientSettings) -> Self {
        HeartbeatConfig {
            interval: Duration::from_millis(settings.heartbeat_interval_ms),
            timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            max_missed: settings.max_missed_heartbeats,
        }
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(settings: &ClientSettings) -> Self {
        ClientConfig {
            url: settings.url.clone(),
            api_key: settings.api_key.clone(),
            reconnect_enabled: settings.reconnect_enabled,
            reconnect_interval: Duration::from_millis(settings.reconnect_interval_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            heartbeat: HeartbeatConfig::from(settings),
            ack_timeout: Duration::from_millis(settings.ack_timeout_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        }
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        QueueConfig {
            max_size: settings.max_size,
            persistence_enabled: settings.persistence_enabled,
            default_ttl: Duration::from_millis(settings.default_ttl_ms),
            default_max_retries: settings.default_max_retries,
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            cleanup_interval: Duration::from_millis(settings.cleanup_interval_ms),
            ..QueueConfig::default()
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig {
            max_connections: settings.max_connections,
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            max_inactive: Duration::from_millis(settings.max_inactive_ms),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            cleanup_interval: Duration::from_millis(settings.cleanup_interval_ms),
        }
    }
}
