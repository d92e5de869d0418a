//! One authenticated executor connection as seen by the pool.
//!
//! The session does not own the socket. It holds the sending side of the
//! channel drained by the connection's writer task, plus a `Notify` that
//! tells the reader task to stop. Dropping the session drops the sender,
//! which ends the writer and with it the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Notify, mpsc::UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use crate::message::{Message, now_millis};

/// Why a session left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The executor closed the socket or it dropped.
    ClientClosed,
    /// A newer connection authenticated with the same identity.
    Replaced,
    /// No answer to the previous liveness ping.
    HeartbeatTimeout,
    /// Silent for longer than the inactivity limit.
    Inactive,
    /// Never became responsive after admission.
    ConnectionTimeout,
    /// Socket found closed by the cleanup sweep.
    SocketClosed,
    ProtocolViolation,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::ClientClosed => "Client closed connection",
            CloseReason::Replaced => "Replaced by new connection",
            CloseReason::HeartbeatTimeout => "Heartbeat timeout",
            CloseReason::Inactive => "Inactive",
            CloseReason::ConnectionTimeout => "Connection timeout",
            CloseReason::SocketClosed => "Socket closed",
            CloseReason::ProtocolViolation => "Too many malformed frames",
            CloseReason::Shutdown => "Server shutting down",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
pub struct ServerSession {
    pub id: String,
    pub identity: String,
    pub remote_addr: Option<SocketAddr>,
    /// Epoch milliseconds.
    pub connected_at: i64,
    /// Cleared when a ping goes out, set again by any traffic from the peer.
    pub is_alive: bool,
    pub last_heartbeat: Instant,
    /// The peer has sent something since admission.
    pub responsive: bool,
    sender: UnboundedSender<WsMessage>,
    closer: Arc<Notify>,
    setup_timer: Option<JoinHandle<()>>,
}

/// Read-only copy of a session for callers outside the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub identity: String,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: i64,
    pub is_alive: bool,
    pub last_heartbeat: Instant,
}

impl ServerSession {
    pub fn new(
        identity: &str,
        remote_addr: Option<SocketAddr>,
        sender: UnboundedSender<WsMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            remote_addr,
            connected_at: now_millis(),
            is_alive: true,
            last_heartbeat: Instant::now(),
            responsive: false,
            sender,
            closer: Arc::new(Notify::new()),
            setup_timer: None,
        }
    }

    pub fn closer(&self) -> Arc<Notify> {
        self.closer.clone()
    }

    pub(crate) fn set_setup_timer(&mut self, timer: JoinHandle<()>) {
        self.setup_timer = Some(timer);
    }

    pub fn touch(&mut self) {
        self.is_alive = true;
        self.responsive = true;
        self.last_heartbeat = Instant::now();
    }

    /// Queue an envelope for the writer. `false` if the socket is gone.
    pub fn send(&self, message: &Message) -> bool {
        match message.to_json() {
            Ok(json) => self.send_raw(WsMessage::text(json)),
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "failed to encode message");
                false
            }
        }
    }

    pub fn send_raw(&self, frame: WsMessage) -> bool {
        self.sender.send(frame).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.send_raw(WsMessage::Ping(Default::default()))
    }

    /// Writer task has exited, so the socket is closed or closing.
    pub fn is_socket_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send a close frame and stop the reader. The caller must already have
    /// taken the session out of the pool.
    pub fn close(mut self, code: u16, reason: CloseReason) {
        if let Some(timer) = self.setup_timer.take() {
            timer.abort();
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.sender.send(WsMessage::Close(Some(frame)));
        self.closer.notify_one();
    }

    /// Forget the session without sending anything; used once the peer has
    /// already gone away.
    pub fn release(mut self) {
        if let Some(timer) = self.setup_timer.take() {
            timer.abort();
        }
        self.closer.notify_one();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            identity: self.identity.clone(),
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            is_alive: self.is_alive,
            last_heartbeat: self.last_heartbeat,
        }
    }
}
