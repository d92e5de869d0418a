use std::fmt;
use std::time::Duration;

use crate::ack::DeliveryResult;
use crate::heartbeat::HeartbeatConfig;

/// Upper bound for the reconnect backoff.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    /// Reconnect budget exhausted, credential refused, or the initial
    /// connect failed. Only an explicit `connect` leaves this state.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: the connection is in `Error` and will not retry on its own.
    ConnectionFailed { attempts: u32, reason: String },
    HeartbeatTimeout { missed: u32 },
    Latency(Duration),
    /// `ERROR` envelope from the hub.
    ServerError { code: u16, message: String },
    Delivery(DeliveryResult),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub average_latency: Option<Duration>,
    /// Epoch milliseconds of the last successful open.
    pub connected_at: Option<i64>,
    pub disconnected_at: Option<i64>,
    pub reconnect_attempts: u32,
    /// Assigned by the hub in its `CONNECTED` envelope.
    pub session_id: Option<String>,
    pub queue_len: usize,
    pub pending_acks: usize,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub reconnect_enabled: bool,
    /// Base of the exponential backoff.
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat: HeartbeatConfig,
    /// Default deadline for acknowledged sends.
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            api_key: None,
            reconnect_enabled: true,
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            heartbeat: HeartbeatConfig::default(),
            ack_timeout: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt - 1), 30s)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(MAX_RECONNECT_DELAY)
}
