use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use super::state::{ClientConfig, ConnectionEvent, ConnectionState, ConnectionStats, reconnect_delay};
use crate::ack::{AckTracker, DeliveryReceiver, DeliveryResult};
use crate::heartbeat::{HeartbeatEvent, HeartbeatManager};
use crate::message::{Acknowledgement, Message, MessageType, now_millis};
use crate::queue::MessageQueue;
use crate::transport::ProtocolErrorBreaker;
use crate::transport::message::{
    CLOSE_ABNORMAL, CLOSE_INVALID_PAYLOAD, CLOSE_NO_STATUS, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
    ServerMessage,
};
use crate::utils::{HubLinkError, Result};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MIN_TICK: Duration = Duration::from_millis(1);

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Send(Message, oneshot::Sender<bool>),
    SendWithAck(Message, Duration, oneshot::Sender<DeliveryReceiver>),
    Stats(oneshot::Sender<ConnectionStats>),
}

/// Everything that happens to a socket arrives tagged with the epoch it
/// was opened in; anything from an older epoch is ignored.
enum Internal {
    Opened { epoch: u64, socket: Box<ClientSocket> },
    ConnectFailed { epoch: u64, error: HubLinkError },
    Frame { epoch: u64, text: String },
    Closed { epoch: u64, code: u16, reason: String },
    ReconnectDue { epoch: u64 },
}

/// Client end of a reliable link to the hub.
///
/// The socket, the outbound queue, pending acknowledgements and the
/// heartbeat all belong to one background task; this handle only sends it
/// commands. Dropping the handle disconnects and stops the task.
#[derive(Debug)]
pub struct ReliableConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    messages: broadcast::Sender<Message>,
    ack_timeout: Duration,
}

impl ReliableConnection {
    /// Spawn the connection task. Nothing is dialled until `connect`.
    pub fn new(config: ClientConfig, queue: MessageQueue) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(256);
        let (messages, _) = broadcast::channel(1024);
        let ack_timeout = config.ack_timeout;

        let actor = ConnectionActor::new(config, queue, state_tx, events.clone(), messages.clone());
        tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            state,
            events,
            messages,
            ack_timeout,
        }
    }

    /// Open the socket. Resolves once it is open, or with the error that
    /// prevented it; a failed connect leaves the connection in `Error`.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_| HubLinkError::Closed)?
    }

    /// Close normally and cancel any scheduled reconnect.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send `payload` as a DATA envelope; see `send_message`.
    pub async fn send(&self, payload: Value) -> bool {
        self.send_message(Message::data(payload)).await
    }

    /// Write to the socket when connected, queue otherwise. `false` means
    /// the message was dropped: expired, or the queue is full.
    pub async fn send_message(&self, message: Message) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Send(message, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn send_with_ack(&self, payload: Value, timeout: Option<Duration>) -> Result<DeliveryResult> {
        self.send_message_with_ack(Message::data(payload), timeout).await
    }

    /// Send `message` requiring acknowledgement and wait for the outcome.
    /// A missing acknowledgement is reported in the result, not as an error;
    /// `Err` means the connection was lost while waiting.
    pub async fn send_message_with_ack(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<DeliveryResult> {
        let timeout = timeout.unwrap_or(self.ack_timeout);
        let (tx, rx) = oneshot::channel();
        self.command(Command::SendWithAck(message.requiring_ack(), timeout, tx))?;
        let delivery = rx.await.map_err(|_| HubLinkError::Closed)?;
        let result = delivery.await.map_err(|_| HubLinkError::Closed)??;
        let _ = self.events.send(ConnectionEvent::Delivery(result.clone()));
        Ok(result)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Inbound application envelopes. Control traffic is not forwarded.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub async fn stats(&self) -> Result<ConnectionStats> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stats(tx))?;
        rx.await.map_err(|_| HubLinkError::Closed)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| HubLinkError::Closed)
    }
}

struct ConnectionActor {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    messages: broadcast::Sender<Message>,
    internal: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    queue: MessageQueue,
    acks: AckTracker,
    ack_timeouts: mpsc::UnboundedReceiver<String>,
    heartbeat: HeartbeatManager,
    heartbeat_events: mpsc::UnboundedReceiver<HeartbeatEvent>,
    breaker: ProtocolErrorBreaker,
    /// Bumped on every dial and every teardown.
    epoch: u64,
    /// The hub has sent CONNECTED for the current socket. Application
    /// traffic waits in the queue until then.
    admitted: bool,
    reconnect_attempts: u32,
    /// The dial in flight belongs to a reconnect cycle, not to `connect`.
    reconnecting: bool,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    writer: Option<mpsc::UnboundedSender<WsMessage>>,
    reader: Option<JoinHandle<()>>,
    dialer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    stats: ConnectionStats,
}

impl ConnectionActor {
    fn new(
        config: ClientConfig,
        queue: MessageQueue,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ConnectionEvent>,
        messages: broadcast::Sender<Message>,
    ) -> Self {
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (acks, ack_timeouts) = AckTracker::new();
        let (heartbeat, heartbeat_events) = HeartbeatManager::new(config.heartbeat.clone());
        Self {
            config,
            state,
            events,
            messages,
            internal,
            internal_rx,
            queue,
            acks,
            ack_timeouts,
            heartbeat,
            heartbeat_events,
            breaker: ProtocolErrorBreaker::default(),
            epoch: 0,
            admitted: false,
            reconnect_attempts: 0,
            reconnecting: false,
            waiters: Vec::new(),
            writer: None,
            reader: None,
            dialer: None,
            reconnect_timer: None,
            stats: ConnectionStats::default(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // a zero period would panic the interval
        let cleanup_every = self.queue.config().cleanup_interval.max(MIN_TICK);
        let retry_every = self.queue.config().retry_base_delay.max(MIN_TICK);
        let mut cleanup = interval_at(Instant::now() + cleanup_every, cleanup_every);
        let mut retry = interval_at(Instant::now() + retry_every, retry_every);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.internal_rx.recv() => self.on_internal(event),
                Some(event) = self.heartbeat_events.recv() => self.on_heartbeat(event),
                Some(message_id) = self.ack_timeouts.recv() => {
                    self.acks.handle_timeout(&message_id);
                }
                _ = cleanup.tick() => {
                    self.queue.cleanup_expired();
                }
                _ = retry.tick() => {
                    if self.admitted && !self.queue.is_empty() {
                        self.flush_queue();
                    }
                }
            }
        }

        self.teardown("connection handle dropped");
        debug!("connection task stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Send(message, reply) => {
                let _ = reply.send(self.send(message));
            }
            Command::SendWithAck(message, timeout, reply) => {
                let _ = reply.send(self.send_with_ack(message, timeout));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Opened { epoch, socket } if epoch == self.epoch => self.on_open(*socket),
            Internal::ConnectFailed { epoch, error } if epoch == self.epoch => {
                self.on_connect_failed(error)
            }
            Internal::Frame { epoch, text } if epoch == self.epoch => self.on_frame(&text),
            Internal::Closed {
                epoch,
                code,
                reason,
            } if epoch == self.epoch => self.on_closed(code, reason),
            Internal::ReconnectDue { epoch } if epoch == self.epoch => {
                self.reconnect_timer = None;
                if self.current() == ConnectionState::Reconnecting {
                    self.dial(true);
                }
            }
            _ => debug!("dropping event from a superseded socket"),
        }
    }

    fn on_heartbeat(&mut self, event: HeartbeatEvent) {
        match event {
            HeartbeatEvent::Probe(probe) => {
                self.write(&probe);
            }
            HeartbeatEvent::Pong { latency } => {
                self.emit(ConnectionEvent::Latency(latency));
            }
            HeartbeatEvent::Timeout { missed } => {
                self.emit(ConnectionEvent::HeartbeatTimeout { missed });
            }
            HeartbeatEvent::ConnectionLost => {
                if self.current() == ConnectionState::Connected {
                    warn!("heartbeat lost, dropping socket");
                    self.drop_socket(None);
                    self.on_closed(CLOSE_ABNORMAL, "Heartbeat timeout".into());
                }
            }
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.current() {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.waiters.push(reply),
            _ => {
                self.cancel_reconnect();
                self.reconnect_attempts = 0;
                self.waiters.push(reply);
                self.dial(false);
            }
        }
    }

    fn dial(&mut self, reconnecting: bool) {
        self.epoch += 1;
        self.reconnecting = reconnecting;
        self.set_state(ConnectionState::Connecting);

        let epoch = self.epoch;
        let config = self.config.clone();
        let internal = self.internal.clone();
        info!(url = %config.url, attempt = self.reconnect_attempts, "connecting");
        self.dialer = Some(tokio::spawn(async move {
            let event = match open_socket(&config).await {
                Ok(socket) => Internal::Opened {
                    epoch,
                    socket: Box::new(socket),
                },
                Err(error) => Internal::ConnectFailed { epoch, error },
            };
            let _ = internal.send(event);
        }));
    }

    fn on_open(&mut self, socket: ClientSocket) {
        self.dialer = None;
        let (sink, source) = socket.split();
        let (writer, frames) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(sink, frames));
        self.writer = Some(writer);
        self.reader = Some(tokio::spawn(read_frames(source, self.epoch, self.internal.clone())));

        self.reconnecting = false;
        self.breaker.reset();
        self.stats.connected_at = Some(now_millis());
        self.set_state(ConnectionState::Connected);
        info!(url = %self.config.url, "connected");
        self.emit(ConnectionEvent::Connected);

        self.heartbeat.start();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// The hub accepted the session. Only now is the backlog safe to send:
    /// a hub that refuses the connection closes it without reading.
    fn on_admitted(&mut self, session_id: String) {
        self.stats.session_id = Some(session_id);
        self.admitted = true;
        self.reconnect_attempts = 0;
        self.flush_queue();
    }

    fn on_connect_failed(&mut self, error: HubLinkError) {
        self.dialer = None;
        warn!(error = %error, reconnecting = self.reconnecting, "connect attempt failed");
        if self.reconnecting {
            self.schedule_reconnect(&error.to_string());
            return;
        }

        self.set_state(ConnectionState::Error);
        self.emit(ConnectionEvent::ConnectionFailed {
            attempts: self.reconnect_attempts,
            reason: error.to_string(),
        });
        let reason = error.to_string();
        if !self.waiters.is_empty() {
            let first = self.waiters.remove(0);
            let _ = first.send(Err(error));
        }
        self.fail_waiters(&reason);
    }

    /// The open socket went away.
    fn on_closed(&mut self, code: u16, reason: String) {
        self.drop_socket(None);
        self.heartbeat.stop();
        self.acks.reject_all(&format!("connection closed ({code})"));
        self.stats.disconnected_at = Some(now_millis());
        self.stats.session_id = None;
        info!(code, %reason, "connection closed");
        self.emit(ConnectionEvent::Disconnected {
            code,
            reason: reason.clone(),
        });

        match code {
            CLOSE_NORMAL => self.set_state(ConnectionState::Disconnected),
            CLOSE_POLICY_VIOLATION => {
                error!(%reason, "hub refused the credential");
                self.set_state(ConnectionState::Error);
                self.emit(ConnectionEvent::ConnectionFailed {
                    attempts: self.reconnect_attempts,
                    reason,
                });
            }
            _ if self.config.reconnect_enabled => self.schedule_reconnect(&reason),
            _ => self.set_state(ConnectionState::Disconnected),
        }
    }

    fn schedule_reconnect(&mut self, reason: &str) {
        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        if attempt > self.config.max_reconnect_attempts {
            error!(
                attempts = self.config.max_reconnect_attempts,
                reason, "giving up on reconnecting"
            );
            self.set_state(ConnectionState::Error);
            self.emit(ConnectionEvent::ConnectionFailed {
                attempts: self.config.max_reconnect_attempts,
                reason: reason.to_string(),
            });
            self.fail_waiters(reason);
            return;
        }

        let delay = reconnect_delay(self.config.reconnect_interval, attempt);
        self.set_state(ConnectionState::Reconnecting);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.emit(ConnectionEvent::Reconnecting { attempt, delay });

        let epoch = self.epoch;
        let internal = self.internal.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ReconnectDue { epoch });
        }));
    }

    fn disconnect(&mut self) {
        if matches!(
            self.current(),
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        self.teardown("disconnected by client");
        self.stats.disconnected_at = Some(now_millis());
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected {
            code: CLOSE_NORMAL,
            reason: "Client disconnect".into(),
        });
        info!("disconnected");
    }

    /// Cancel every timer and socket task and fail everyone still waiting.
    fn teardown(&mut self, reason: &str) {
        self.epoch += 1;
        self.cancel_reconnect();
        if let Some(dialer) = self.dialer.take() {
            dialer.abort();
        }
        self.heartbeat.stop();
        self.drop_socket(Some(CLOSE_NORMAL));
        self.acks.reject_all(reason);
        self.fail_waiters(reason);
        self.stats.session_id = None;
    }

    fn fail_waiters(&mut self, reason: &str) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(HubLinkError::ConnectionLost(reason.to_string())));
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    /// Stop the socket tasks, optionally saying goodbye with `close_code`.
    /// Frames the old reader already queued are discarded.
    fn drop_socket(&mut self, close_code: Option<u16>) {
        self.epoch += 1;
        self.admitted = false;
        if let Some(writer) = self.writer.take() {
            if let Some(code) = close_code {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: "Client disconnect".into(),
                };
                let _ = writer.send(WsMessage::Close(Some(frame)));
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn send(&mut self, message: Message) -> bool {
        if self.write(&message) {
            return true;
        }
        self.enqueue(message)
    }

    fn send_with_ack(&mut self, message: Message, timeout: Duration) -> DeliveryReceiver {
        let message_id = message.id.clone();
        if self.write(&message) {
            return self.acks.track(&message_id, timeout, true);
        }
        if self.enqueue(message) {
            return self.acks.track(&message_id, timeout, false);
        }

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(DeliveryResult {
            message_id,
            success: false,
            delivered: false,
            acknowledged: false,
            attempts: 0,
            latency: None,
            error: Some(
                HubLinkError::QueueFull {
                    max_size: self.queue.config().max_size,
                }
                .to_string(),
            ),
        }));
        rx
    }

    fn enqueue(&mut self, message: Message) -> bool {
        let message_id = message.id.clone();
        if self.queue.enqueue(message) {
            self.stats.messages_queued += 1;
            debug!(%message_id, queued = self.queue.len(), "message queued");
            true
        } else {
            self.stats.messages_dropped += 1;
            false
        }
    }

    /// Put a message on the wire if the socket is open. Anything but
    /// control traffic also needs the hub to have admitted the session.
    fn write(&mut self, message: &Message) -> bool {
        if self.current() != ConnectionState::Connected {
            return false;
        }
        if !self.admitted && !message.kind.is_control() {
            return false;
        }
        let Some(writer) = self.writer.as_ref().filter(|w| !w.is_closed()) else {
            return false;
        };
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to encode message");
                return false;
            }
        };
        if writer.send(WsMessage::text(json)).is_err() {
            return false;
        }
        if !message.kind.is_control() {
            self.stats.messages_sent += 1;
        }
        true
    }

    /// Drain everything that is ready, in queue order.
    fn flush_queue(&mut self) {
        if !self.admitted {
            return;
        }
        let ready = self.queue.take_ready();
        if ready.is_empty() {
            return;
        }
        let total = ready.len();
        let mut sent = 0;
        for entry in ready {
            if self.write(&entry.message) {
                self.acks.mark_delivered(entry.id());
                sent += 1;
            } else if !self.queue.retry_later(entry) {
                self.stats.messages_dropped += 1;
            }
        }
        info!(sent, total, remaining = self.queue.len(), "flushed message queue");
    }

    fn on_frame(&mut self, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(envelope_error) => {
                match serde_json::from_str::<ServerMessage>(text) {
                    Ok(control) => self.on_server_message(control),
                    Err(_) => self.on_malformed(&envelope_error),
                }
                return;
            }
        };

        self.stats.messages_received += 1;
        match message.kind {
            MessageType::Ack | MessageType::Nack => match message.acknowledgement() {
                Ok(ack) => {
                    self.acks.handle_acknowledgement(&ack);
                }
                Err(e) => self.on_malformed(&e),
            },
            MessageType::Heartbeat => {
                self.write(&HeartbeatManager::create_heartbeat_ack());
            }
            MessageType::HeartbeatAck => {
                self.heartbeat.handle_pong();
            }
            _ => {
                let needs_ack = message.needs_ack();
                let message_id = message.id.clone();
                let _ = self.messages.send(message);
                if needs_ack {
                    self.write(&Message::ack_for(&Acknowledgement::success(message_id)));
                }
            }
        }
    }

    fn on_server_message(&mut self, control: ServerMessage) {
        match control {
            ServerMessage::Connected {
                session_id,
                pool_size,
                ..
            } => {
                info!(%session_id, pool_size, "session assigned by hub");
                self.on_admitted(session_id);
            }
            ServerMessage::Error { code, message } => {
                warn!(code, %message, "hub reported an error");
                self.emit(ConnectionEvent::ServerError { code, message });
            }
        }
    }

    fn on_malformed(&mut self, error: &HubLinkError) {
        warn!(error = %error, "malformed frame from hub");
        if self.breaker.record() {
            error!(malformed = self.breaker.recent_errors(), "too many malformed frames");
            self.drop_socket(Some(CLOSE_INVALID_PAYLOAD));
            self.on_closed(CLOSE_INVALID_PAYLOAD, "Too many malformed frames".into());
        }
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            average_latency: self.heartbeat.stats().average_latency,
            reconnect_attempts: self.reconnect_attempts,
            queue_len: self.queue.len(),
            pending_acks: self.acks.pending_count(),
            ..self.stats.clone()
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

async fn open_socket(config: &ClientConfig) -> Result<ClientSocket> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| HubLinkError::Authentication(format!("unusable API key: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| HubLinkError::Timeout {
            operation: "connect".to_string(),
            timeout_ms: config.connect_timeout.as_millis() as u64,
        })??;
    Ok(socket)
}

async fn write_frames(
    mut sink: SplitSink<ClientSocket, WsMessage>,
    mut frames: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(frame) = frames.recv().await {
        let closing = frame.is_close();
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(
    mut source: SplitStream<ClientSocket>,
    epoch: u64,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let (code, reason) = loop {
        let text = match source.next().await {
            Some(Ok(WsMessage::Text(text))) => text.to_string(),
            Some(Ok(WsMessage::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((CLOSE_NO_STATUS, String::new()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break (CLOSE_ABNORMAL, e.to_string()),
            None => break (CLOSE_ABNORMAL, "connection dropped".to_string()),
        };
        if internal.send(Internal::Frame { epoch, text }).is_err() {
            return;
        }
    };
    let _ = internal.send(Internal::Closed {
        epoch,
        code,
        reason,
    });
}
