use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::{HubLinkError, Result};

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Envelope type. Serialized in upper snake case (`"HEARTBEAT_ACK"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Data,
    Command,
    Response,
    Ack,
    Nack,
    Heartbeat,
    HeartbeatAck,
    Connect,
    Disconnect,
    Reconnect,
}

impl MessageType {
    /// Control envelopes consumed by the messaging layer itself and never
    /// handed to application subscribers.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::Ack | MessageType::Nack | MessageType::Heartbeat | MessageType::HeartbeatAck
        )
    }
}

/// Delivery priority. On the wire this is an integer, `0` (low) to `3`
/// (critical); ordering follows the integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(format!("invalid priority {other}, expected 0..=3")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// The envelope exchanged over the socket.
///
/// Only the optional metadata fields are ever touched after construction,
/// and only by the queue that owns the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Message {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            timestamp: now_millis(),
            priority: None,
            requires_ack: None,
            retry_count: None,
            max_retries: None,
            expires_at: None,
        }
    }

    pub fn data(payload: Value) -> Self {
        Self::new(MessageType::Data, payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = Some(true);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Expire `ttl_ms` milliseconds after the message timestamp.
    pub fn with_ttl(mut self, ttl_ms: i64) -> Self {
        self.expires_at = Some(self.timestamp + ttl_ms);
        self
    }

    pub fn expiring_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    pub fn needs_ack(&self) -> bool {
        self.requires_ack.unwrap_or(false)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// ACK envelope for a successful acknowledgement, NACK otherwise.
    pub fn ack_for(ack: &Acknowledgement) -> Self {
        let kind = if ack.success {
            MessageType::Ack
        } else {
            MessageType::Nack
        };
        // Acknowledgement always serializes to an object.
        let payload = serde_json::to_value(ack).unwrap_or(Value::Null);
        Self::new(kind, payload).with_priority(Priority::High)
    }

    /// Decode the acknowledgement carried by an ACK or NACK envelope.
    pub fn acknowledgement(&self) -> Result<Acknowledgement> {
        match self.kind {
            MessageType::Ack | MessageType::Nack => {
                let mut ack: Acknowledgement = serde_json::from_value(self.payload.clone())?;
                if self.kind == MessageType::Nack {
                    ack.success = false;
                }
                Ok(ack)
            }
            other => Err(HubLinkError::Protocol(format!(
                "{other:?} envelope {} carries no acknowledgement",
                self.id
            ))),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Confirmation that the message `message_id` was processed by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub message_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl Acknowledgement {
    pub fn success(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            success: true,
            error: None,
            timestamp: now_millis(),
        }
    }

    pub fn failure(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            success: false,
            error: Some(error.into()),
            timestamp: now_millis(),
        }
    }
}
