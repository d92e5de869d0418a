use std::time::Duration;

use serde_json::json;
use tungstenite::handshake::server::Request;

use super::breaker::ProtocolErrorBreaker;
use super::message::ServerMessage;
use super::websocket::extract_credential;

fn request(uri: &str, auth: Option<&str>) -> Request {
    let mut builder = Request::builder().uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("Authorization", auth);
    }
    builder.body(()).unwrap()
}

#[test]
fn credential_from_bearer_header() {
    let req = request("/", Some("Bearer key-a"));
    assert_eq!(extract_credential(&req).as_deref(), Some("key-a"));
}

#[test]
fn credential_from_query_parameter() {
    let req = request("/ws?client=1&apiKey=key-b", None);
    assert_eq!(extract_credential(&req).as_deref(), Some("key-b"));
}

#[test]
fn query_credential_is_percent_decoded() {
    let req = request("/?apiKey=k%2Fe%3Dy+1", None);
    assert_eq!(extract_credential(&req).as_deref(), Some("k/e=y 1"));
}

#[test]
fn header_wins_over_query() {
    let req = request("/?apiKey=from-query", Some("Bearer from-header"));
    assert_eq!(extract_credential(&req).as_deref(), Some("from-header"));
}

#[test]
fn missing_or_malformed_credential() {
    assert_eq!(extract_credential(&request("/", None)), None);
    assert_eq!(extract_credential(&request("/?apiKey=", None)), None);
    assert_eq!(extract_credential(&request("/", Some("Basic abc"))), None);
    assert_eq!(extract_credential(&request("/", Some("Bearer  "))), None);
}

#[test]
fn connected_envelope_wire_format() {
    let msg = ServerMessage::Connected {
        session_id: "s-1".into(),
        pool_size: 3,
        timestamp: 42,
    };
    let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
    assert_eq!(
        value,
        json!({"type": "CONNECTED", "sessionId": "s-1", "poolSize": 3, "timestamp": 42})
    );
}

#[test]
fn error_envelope_round_trips() {
    let raw = json!({"type": "ERROR", "code": 1008, "message": "authentication failed"});
    let parsed: ServerMessage = serde_json::from_value(raw).unwrap();
    assert_eq!(
        parsed,
        ServerMessage::Error {
            code: 1008,
            message: "authentication failed".into()
        }
    );
}

#[test]
fn envelope_is_not_a_server_message() {
    let data = json!({"id": "m", "type": "DATA", "payload": {}, "timestamp": 1});
    assert!(serde_json::from_value::<ServerMessage>(data).is_err());
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_after_threshold_within_window() {
    let mut breaker = ProtocolErrorBreaker::new(3, Duration::from_secs(60));
    assert!(!breaker.record());
    assert!(!breaker.record());
    assert!(!breaker.record());
    assert!(breaker.record());
    assert_eq!(breaker.recent_errors(), 4);
}

#[tokio::test(start_paused = true)]
async fn breaker_forgets_errors_outside_window() {
    let mut breaker = ProtocolErrorBreaker::new(2, Duration::from_secs(10));
    assert!(!breaker.record());
    assert!(!breaker.record());
    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(!breaker.record());
    assert_eq!(breaker.recent_errors(), 1);

    breaker.reset();
    assert_eq!(breaker.recent_errors(), 0);
}
