use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use crate::message::{Message, MessageType};
use crate::pool::{ConnectionPool, PoolConfig, PoolEvent, StaticKeyAuthenticator};
use crate::transport::message::ServerMessage;
use crate::transport::serve;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(config: PoolConfig) -> (String, ConnectionPool) {
    let auth = StaticKeyAuthenticator::default()
        .with_key("key-a", "executor-a")
        .with_key("key-b", "executor-b");
    let pool = ConnectionPool::new(config, Arc::new(auth));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, pool.clone()));
    (format!("ws://{addr}"), pool)
}

async fn connect_with_bearer(url: &str, key: &str) -> Client {
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {key}")).unwrap(),
    );
    let (ws, _) = connect_async(request).await.expect("handshake failed");
    ws
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame in time")
            .expect("stream ended")
            .expect("read error");
        if let WsMessage::Text(text) = frame {
            return text.to_string();
        }
    }
}

/// Read until a close frame arrives and return its code.
async fn close_code(ws: &mut Client) -> u16 {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no close in time");
        match frame {
            Some(Ok(WsMessage::Close(Some(close)))) => return close.code.into(),
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn valid_key_is_admitted_with_connected_envelope() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut ws = connect_with_bearer(&url, "key-a").await;

    let connected: ServerMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    let ServerMessage::Connected {
        session_id,
        pool_size,
        ..
    } = connected
    else {
        panic!("expected CONNECTED, got {connected:?}");
    };
    assert_eq!(pool_size, 1);
    assert_eq!(pool.session_for("executor-a").unwrap().id, session_id);
}

#[tokio::test]
async fn query_parameter_credential_is_accepted() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let (mut ws, _) = connect_async(format!("{url}/?apiKey=key-b")).await.unwrap();
    assert!(next_text(&mut ws).await.contains("CONNECTED"));
    assert!(pool.session_for("executor-b").is_some());
}

#[tokio::test]
async fn invalid_key_gets_error_and_policy_close() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut ws = connect_with_bearer(&url, "wrong").await;

    let error: ServerMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert!(matches!(error, ServerMessage::Error { code: 1008, .. }));
    assert_eq!(close_code(&mut ws).await, 1008);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn missing_key_is_rejected() {
    let (url, _pool) = start_server(PoolConfig::default()).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    assert!(next_text(&mut ws).await.contains("ERROR"));
    assert_eq!(close_code(&mut ws).await, 1008);
}

#[tokio::test]
async fn full_pool_rejects_with_try_again_later() {
    let (url, pool) = start_server(PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    })
    .await;
    let mut first = connect_with_bearer(&url, "key-a").await;
    next_text(&mut first).await;

    let mut second = connect_with_bearer(&url, "key-b").await;
    let error: ServerMessage = serde_json::from_str(&next_text(&mut second).await).unwrap();
    assert!(matches!(error, ServerMessage::Error { code: 1013, .. }));
    assert_eq!(close_code(&mut second).await, 1013);
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn second_connection_replaces_first() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut first = connect_with_bearer(&url, "key-a").await;
    next_text(&mut first).await;

    let mut second = connect_with_bearer(&url, "key-a").await;
    next_text(&mut second).await;

    assert_eq!(close_code(&mut first).await, 1000);
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn heartbeat_and_acknowledged_data() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut events = pool.subscribe();
    let mut ws = connect_with_bearer(&url, "key-a").await;
    next_text(&mut ws).await;

    let beat = Message::new(MessageType::Heartbeat, json!({"timestamp": 1}));
    ws.send(WsMessage::text(beat.to_json().unwrap())).await.unwrap();
    let reply = Message::from_json(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply.kind, MessageType::HeartbeatAck);

    let report = Message::data(json!({"fill": 100})).requiring_ack();
    ws.send(WsMessage::text(report.to_json().unwrap())).await.unwrap();
    let ack = Message::from_json(&next_text(&mut ws).await).unwrap();
    assert_eq!(ack.kind, MessageType::Ack);
    assert_eq!(ack.acknowledgement().unwrap().message_id, report.id);

    let published = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PoolEvent::Message { message, .. } => break message,
            _ => continue,
        }
    };
    assert_eq!(published.id, report.id);
}

#[tokio::test]
async fn repeated_garbage_closes_with_invalid_payload() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut ws = connect_with_bearer(&url, "key-a").await;
    next_text(&mut ws).await;

    for _ in 0..11 {
        ws.send(WsMessage::text("not json")).await.unwrap();
    }
    assert_eq!(close_code(&mut ws).await, 1007);
    wait_for(|| pool.is_empty()).await;
}

#[tokio::test]
async fn client_close_removes_session() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut ws = connect_with_bearer(&url, "key-a").await;
    next_text(&mut ws).await;
    assert_eq!(pool.len(), 1);

    ws.close(None).await.unwrap();
    wait_for(|| pool.is_empty()).await;
}

#[tokio::test]
async fn server_to_executor_command() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut ws = connect_with_bearer(&url, "key-a").await;
    next_text(&mut ws).await;

    let command = Message::new(MessageType::Command, json!({"action": "close_all"}));
    assert!(pool.send_to("executor-a", &command));
    let received = Message::from_json(&next_text(&mut ws).await).unwrap();
    assert_eq!(received.id, command.id);
}

#[tokio::test]
async fn shutdown_closes_connected_executors() {
    let (url, pool) = start_server(PoolConfig::default()).await;
    let mut ws = connect_with_bearer(&url, "key-a").await;
    next_text(&mut ws).await;

    pool.shutdown();
    assert_eq!(close_code(&mut ws).await, 1000);
}

#[tokio::test]
async fn accept_loop_returns_on_shutdown_without_new_connections() {
    let pool = ConnectionPool::new(
        PoolConfig::default(),
        Arc::new(StaticKeyAuthenticator::default()),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = tokio::spawn(serve(listener, pool.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!server.is_finished());

    pool.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("accept loop kept running after shutdown")
        .unwrap();
    assert!(result.is_ok());
}
