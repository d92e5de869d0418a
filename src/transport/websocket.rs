use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use url::form_urlencoded;

use crate::message::Message;
use crate::pool::{CloseReason, ConnectionPool};
use crate::transport::breaker::ProtocolErrorBreaker;
use crate::transport::message::{
    CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER, ServerMessage,
};
use crate::utils::{HubLinkError, Result};

/// Bind `addr` and serve executor connections into `pool`.
pub async fn start_websocket_server(addr: &str, pool: ConnectionPool) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "websocket server listening");
    serve(listener, pool).await
}

/// Accept loop over an already bound listener. Returns once the pool has
/// been shut down.
pub async fn serve(listener: TcpListener, pool: ConnectionPool) -> Result<()> {
    let mut shutdown = pool.shutdown_signal();
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };
        tokio::spawn(handle_connection(stream, remote, pool.clone()));
    }
    info!("accept loop stopped");
    Ok(())
}

/// Credential from `Authorization: Bearer <key>`, else from the
/// percent-decoded `apiKey` query parameter.
pub(crate) fn extract_credential(request: &Request) -> Option<String> {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty());
    if let Some(key) = bearer {
        return Some(key.to_string());
    }

    request.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, value)| name == "apiKey" && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    })
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, pool: ConnectionPool) {
    let mut credential = None;
    let capture = |request: &Request,
                   response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        credential = extract_credential(request);
        Ok(response)
    };
    let mut ws = match accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%remote, error = %e, "websocket handshake failed");
            return;
        }
    };

    if let Err(e) = pool.check_capacity() {
        warn!(%remote, error = %e, "rejecting connection");
        reject(&mut ws, CLOSE_TRY_AGAIN_LATER, &e).await;
        return;
    }

    let identity = match pool.authenticate(credential.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%remote, error = %e, "rejecting connection");
            reject(&mut ws, CLOSE_POLICY_VIOLATION, &e).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let admission = match pool.admit(&identity, Some(remote), tx) {
        Ok(admission) => admission,
        Err(e) => {
            let code = match e {
                HubLinkError::CapacityExceeded { .. } => CLOSE_TRY_AGAIN_LATER,
                _ => CLOSE_GOING_AWAY,
            };
            warn!(%remote, %identity, error = %e, "admission refused");
            reject(&mut ws, code, &e).await;
            return;
        }
    };
    let session_id = admission.session_id;

    let (mut sink, mut source) = ws.split();

    // Writer: drains the session channel. Ends after a close frame or once
    // the pool drops the session.
    let writer_session = session_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = frame.is_close();
            if let Err(e) = sink.send(frame).await {
                debug!(session_id = %writer_session, error = %e, "write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut breaker = ProtocolErrorBreaker::default();
    let exit = loop {
        tokio::select! {
            _ = admission.closer.notified() => break None,
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    pool.record_activity(&session_id);
                    if !on_frame(&pool, &session_id, text.as_str(), &mut breaker) {
                        break None;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    pool.record_activity(&session_id);
                    let text = String::from_utf8_lossy(&data);
                    if !on_frame(&pool, &session_id, &text, &mut breaker) {
                        break None;
                    }
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                    pool.record_activity(&session_id);
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(%session_id, ?frame, "peer sent close");
                    break Some(CloseReason::ClientClosed);
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    debug!(%session_id, error = %e, "read failed");
                    break Some(CloseReason::ClientClosed);
                }
                None => break Some(CloseReason::ClientClosed),
            },
        }
    };

    // `None` means the pool already removed the session.
    if let Some(reason) = exit {
        pool.remove(&session_id, reason);
    }
    debug!(%session_id, %identity, "connection handler finished");
}

/// Decode and dispatch one frame. Returns `false` once the connection has
/// been closed for repeated garbage.
fn on_frame(
    pool: &ConnectionPool,
    session_id: &str,
    text: &str,
    breaker: &mut ProtocolErrorBreaker,
) -> bool {
    match Message::from_json(text) {
        Ok(message) => {
            pool.handle_message(session_id, message);
            true
        }
        Err(e) => {
            warn!(session_id, error = %e, "malformed frame");
            if breaker.record() {
                error!(
                    session_id,
                    malformed = breaker.recent_errors(),
                    "too many malformed frames, closing"
                );
                pool.protocol_violation(session_id);
                return false;
            }
            true
        }
    }
}

async fn reject(ws: &mut WebSocketStream<TcpStream>, code: u16, err: &HubLinkError) {
    let notice = ServerMessage::Error {
        code,
        message: err.to_string(),
    };
    if let Err(e) = ws.send(WsMessage::text(notice.to_json())).await {
        debug!(error = %e, "failed to send rejection");
        return;
    }
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: err.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}
