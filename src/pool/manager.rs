use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{Notify, broadcast, mpsc::UnboundedSender, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::auth::Authenticator;
use super::session::{CloseReason, ServerSession, SessionInfo};
use crate::heartbeat::HeartbeatManager;
use crate::message::{Acknowledgement, Message, MessageType, now_millis};
use crate::transport::message::{CLOSE_GOING_AWAY, CLOSE_INVALID_PAYLOAD, CLOSE_NORMAL, ServerMessage};
use crate::utils::{HubLinkError, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// A session that has not sent anything this long after admission is closed.
    pub connection_timeout: Duration,
    pub max_inactive: Duration,
    /// Liveness sweep period.
    pub heartbeat_interval: Duration,
    /// Cleanup sweep period.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            connection_timeout: Duration::from_millis(300_000),
            max_inactive: Duration::from_millis(120_000),
            heartbeat_interval: Duration::from_millis(30_000),
            cleanup_interval: Duration::from_millis(300_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    SessionOpened {
        session_id: String,
        identity: String,
    },
    SessionClosed {
        session_id: String,
        identity: String,
        reason: CloseReason,
    },
    /// Application envelope received from an executor.
    Message {
        session_id: String,
        identity: String,
        message: Message,
    },
}

/// Result of one cleanup sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReport {
    pub active_sessions: usize,
    pub removed_sessions: usize,
    pub max_connections: usize,
    pub oldest_session_age: Option<Duration>,
}

/// What the accept loop needs to run an admitted connection.
#[derive(Debug, Clone)]
pub struct Admission {
    pub session_id: String,
    pub identity: String,
    /// Notified when the pool closes the session on its own.
    pub closer: Arc<Notify>,
}

#[derive(Debug, Default)]
struct PoolState {
    sessions: HashMap<String, ServerSession>,
    by_identity: HashMap<String, String>,
}

impl PoolState {
    fn take(&mut self, session_id: &str) -> Option<ServerSession> {
        let session = self.sessions.remove(session_id)?;
        // the identity may already point at a newer session
        if self.by_identity.get(&session.identity).map(String::as_str) == Some(session_id) {
            self.by_identity.remove(&session.identity);
        }
        Some(session)
    }
}

struct PoolInner {
    config: PoolConfig,
    authenticator: Arc<dyn Authenticator>,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    shutdown: watch::Sender<bool>,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to one pool. Every clone sees the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("sessions", &self.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                config,
                authenticator,
                state: Mutex::new(PoolState::default()),
                events,
                shutdown,
                sweeps: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Flips to `true` once `shutdown` has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Fail fast before the handshake work when the pool is full.
    pub fn check_capacity(&self) -> Result<()> {
        if self.len() >= self.inner.config.max_connections {
            return Err(HubLinkError::CapacityExceeded {
                limit: self.inner.config.max_connections,
            });
        }
        Ok(())
    }

    pub fn authenticate(&self, credential: Option<&str>) -> Result<String> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HubLinkError::Authentication("API key required".into()))?;
        self.inner
            .authenticator
            .authenticate(credential)
            .ok_or_else(|| HubLinkError::Authentication("Invalid API key".into()))
    }

    /// Register a new session for `identity`. Any session the identity
    /// already holds is closed first. Fails when the pool is full, unless
    /// the new session only replaces an existing one.
    pub fn admit(
        &self,
        identity: &str,
        remote_addr: Option<SocketAddr>,
        sender: UnboundedSender<WsMessage>,
    ) -> Result<Admission> {
        if self.is_shut_down() {
            return Err(HubLinkError::ConnectionLost("pool is shutting down".into()));
        }

        let mut session = ServerSession::new(identity, remote_addr, sender);
        let admission = Admission {
            session_id: session.id.clone(),
            identity: identity.to_string(),
            closer: session.closer(),
        };

        let (replaced, pool_size) = {
            let mut state = self.state();
            let previous = state.by_identity.get(identity).cloned();
            if previous.is_none() && state.sessions.len() >= self.inner.config.max_connections {
                return Err(HubLinkError::CapacityExceeded {
                    limit: self.inner.config.max_connections,
                });
            }
            let replaced = previous.and_then(|id| state.take(&id));
            if let Some(old) = replaced.as_ref() {
                info!(
                    identity,
                    old_session = %old.id,
                    new_session = %session.id,
                    "closing existing session for identity"
                );
            }

            session.set_setup_timer(self.spawn_setup_timer(&session.id));
            let connected = ServerMessage::Connected {
                session_id: session.id.clone(),
                pool_size: state.sessions.len() + 1,
                timestamp: now_millis(),
            };
            session.send_raw(WsMessage::text(connected.to_json()));

            state
                .by_identity
                .insert(identity.to_string(), session.id.clone());
            state.sessions.insert(session.id.clone(), session);
            (replaced, state.sessions.len())
        };

        if let Some(old) = replaced {
            let old_id = old.id.clone();
            old.close(CLOSE_NORMAL, CloseReason::Replaced);
            self.emit(PoolEvent::SessionClosed {
                session_id: old_id,
                identity: identity.to_string(),
                reason: CloseReason::Replaced,
            });
        }

        info!(
            session_id = %admission.session_id,
            identity,
            remote = ?remote_addr,
            pool_size,
            "session admitted"
        );
        self.emit(PoolEvent::SessionOpened {
            session_id: admission.session_id.clone(),
            identity: identity.to_string(),
        });
        Ok(admission)
    }

    /// Drop a session whose socket already went away. Returns `false` if the
    /// pool had already removed it.
    pub fn remove(&self, session_id: &str, reason: CloseReason) -> bool {
        let Some(session) = self.state().take(session_id) else {
            return false;
        };
        info!(session_id, identity = %session.identity, %reason, "session removed");
        let identity = session.identity.clone();
        session.release();
        self.emit(PoolEvent::SessionClosed {
            session_id: session_id.to_string(),
            identity,
            reason,
        });
        true
    }

    /// Remove a session and close its socket with `code`.
    pub fn force_disconnect(&self, session_id: &str, code: u16, reason: CloseReason) -> bool {
        let Some(session) = self.state().take(session_id) else {
            return false;
        };
        warn!(session_id, identity = %session.identity, code, %reason, "force disconnecting session");
        let identity = session.identity.clone();
        session.close(code, reason);
        self.emit(PoolEvent::SessionClosed {
            session_id: session_id.to_string(),
            identity,
            reason,
        });
        true
    }

    /// Any frame or pong from the peer proves it is alive.
    pub fn record_activity(&self, session_id: &str) {
        if let Some(session) = self.state().sessions.get_mut(session_id) {
            session.touch();
        }
    }

    /// Process one decoded envelope from a session.
    pub fn handle_message(&self, session_id: &str, message: Message) {
        let identity = {
            let mut state = self.state();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            session.touch();

            if HeartbeatManager::is_heartbeat(&message) {
                session.send(&HeartbeatManager::create_heartbeat_ack());
                return;
            }
            if HeartbeatManager::is_heartbeat_ack(&message) {
                return;
            }
            session.identity.clone()
        };

        if matches!(message.kind, MessageType::Ack | MessageType::Nack) {
            match message.acknowledgement() {
                Ok(ack) => debug!(session_id, message_id = %ack.message_id, success = ack.success, "acknowledgement from executor"),
                Err(e) => warn!(session_id, error = %e, "malformed acknowledgement"),
            }
        }

        let needs_ack = message.needs_ack() && !message.kind.is_control();
        let message_id = message.id.clone();
        self.emit(PoolEvent::Message {
            session_id: session_id.to_string(),
            identity,
            message,
        });

        if needs_ack {
            let ack = Message::ack_for(&Acknowledgement::success(message_id));
            if let Some(session) = self.state().sessions.get(session_id) {
                session.send(&ack);
            }
        }
    }

    /// Close a session after too many malformed frames.
    pub fn protocol_violation(&self, session_id: &str) -> bool {
        self.force_disconnect(session_id, CLOSE_INVALID_PAYLOAD, CloseReason::ProtocolViolation)
    }

    pub fn send_to(&self, identity: &str, message: &Message) -> bool {
        let state = self.state();
        state
            .by_identity
            .get(identity)
            .and_then(|id| state.sessions.get(id))
            .is_some_and(|session| session.send(message))
    }

    /// Send to every session; returns how many accepted the frame.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|session| session.send(message))
            .count()
    }

    pub fn session_for(&self, identity: &str) -> Option<SessionInfo> {
        let state = self.state();
        state
            .by_identity
            .get(identity)
            .and_then(|id| state.sessions.get(id))
            .map(ServerSession::info)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.state().sessions.values().map(ServerSession::info).collect()
    }

    /// One liveness pass: sessions that did not answer the previous ping, or
    /// have been silent past `max_inactive`, are disconnected; every other
    /// session is pinged. Returns the number disconnected.
    pub fn liveness_sweep(&self) -> usize {
        let max_inactive = self.inner.config.max_inactive;
        let mut stale = Vec::new();
        {
            let mut state = self.state();
            for session in state.sessions.values_mut() {
                if !session.is_alive {
                    stale.push((session.id.clone(), CloseReason::HeartbeatTimeout));
                } else if session.last_heartbeat.elapsed() > max_inactive {
                    stale.push((session.id.clone(), CloseReason::Inactive));
                } else {
                    session.is_alive = false;
                    session.ping();
                }
            }
        }

        for (session_id, reason) in &stale {
            self.force_disconnect(session_id, CLOSE_GOING_AWAY, *reason);
        }
        if !stale.is_empty() {
            info!(disconnected = stale.len(), remaining = self.len(), "liveness sweep");
        }
        stale.len()
    }

    /// Reclaim sessions whose writer already exited without a clean removal.
    pub fn cleanup_sweep(&self) -> ResourceReport {
        let closed: Vec<String> = self
            .state()
            .sessions
            .values()
            .filter(|session| session.is_socket_closed())
            .map(|session| session.id.clone())
            .collect();

        let removed_sessions = closed
            .iter()
            .filter(|id| self.remove(id, CloseReason::SocketClosed))
            .count();

        let report = {
            let state = self.state();
            let now = now_millis();
            ResourceReport {
                active_sessions: state.sessions.len(),
                removed_sessions,
                max_connections: self.inner.config.max_connections,
                oldest_session_age: state
                    .sessions
                    .values()
                    .map(|s| Duration::from_millis((now - s.connected_at).max(0) as u64))
                    .max(),
            }
        };
        info!(
            active = report.active_sessions,
            removed = report.removed_sessions,
            capacity = report.max_connections,
            "pool cleanup"
        );
        report
    }

    /// Spawn the liveness and cleanup sweeps. They stop on `shutdown`.
    pub fn start(&self) {
        let mut sweeps = self.sweeps();
        if !sweeps.is_empty() || self.is_shut_down() {
            return;
        }

        let liveness_every = self.inner.config.heartbeat_interval;
        let cleanup_every = self.inner.config.cleanup_interval;
        sweeps.push(self.spawn_sweep(liveness_every, |pool| {
            pool.liveness_sweep();
        }));
        sweeps.push(self.spawn_sweep(cleanup_every, |pool| {
            pool.cleanup_sweep();
        }));
        info!(
            liveness_ms = liveness_every.as_millis() as u64,
            cleanup_ms = cleanup_every.as_millis() as u64,
            "pool sweeps started"
        );
    }

    /// Stop the sweeps and close every session normally.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        for task in self.sweeps().drain(..) {
            task.abort();
        }

        let sessions: Vec<ServerSession> = {
            let mut state = self.state();
            state.by_identity.clear();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        let count = sessions.len();
        for session in sessions {
            let (session_id, identity) = (session.id.clone(), session.identity.clone());
            session.close(CLOSE_NORMAL, CloseReason::Shutdown);
            self.emit(PoolEvent::SessionClosed {
                session_id,
                identity,
                reason: CloseReason::Shutdown,
            });
        }
        info!(closed = count, "pool shut down");
    }

    fn spawn_sweep(&self, period: Duration, sweep: fn(&ConnectionPool)) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                sweep(&ConnectionPool { inner });
            }
        })
    }

    fn spawn_setup_timer(&self, session_id: &str) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let session_id = session_id.to_string();
        let timeout = self.inner.config.connection_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                ConnectionPool { inner }.expire_unresponsive(&session_id);
            }
        })
    }

    fn expire_unresponsive(&self, session_id: &str) {
        let unresponsive = self
            .state()
            .sessions
            .get(session_id)
            .is_some_and(|session| !session.responsive);
        if unresponsive {
            self.force_disconnect(session_id, CLOSE_GOING_AWAY, CloseReason::ConnectionTimeout);
        }
    }

    fn emit(&self, event: PoolEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweeps(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .sweeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
