use serde::{Deserialize, Serialize};

/// Orderly shutdown, or a session replaced by a newer one for the same identity.
pub const CLOSE_NORMAL: u16 = 1000;
/// Liveness sweep or setup timeout gave up on the peer.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Too many malformed frames.
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
/// Missing or invalid credential.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Pool at capacity; the client may retry later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Transport dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Control envelopes the hub sends outside the regular `Message` flow.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "CONNECTED", rename_all = "camelCase")]
    Connected {
        session_id: String,
        pool_size: usize,
        timestamp: i64,
    },
    #[serde(rename = "ERROR")]
    Error { code: u16, message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // both variants are plain data; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
