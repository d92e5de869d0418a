use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::{Message, MessageType, now_millis};

/// Number of round-trip samples kept for the rolling average.
const LATENCY_HISTORY: usize = 10;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            timeout: Duration::from_millis(3000),
            max_missed: 3,
        }
    }
}

/// What the owner of the connection has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    /// A probe is due; the owner must put this envelope on the wire.
    Probe(Message),
    Pong { latency: Duration },
    Timeout { missed: u32 },
    /// Emitted once, after which the manager has stopped itself.
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatStats {
    pub running: bool,
    pub missed_beats: u32,
    pub probes_sent: u64,
    pub pongs_received: u64,
    pub last_latency: Option<Duration>,
    pub average_latency: Option<Duration>,
    pub latency_samples: usize,
}

#[derive(Debug, Default)]
struct HeartbeatState {
    running: bool,
    /// Bumped on every start and stop; timers from an older run no-op.
    generation: u64,
    /// Bumped on every probe and pong; a deadline only counts for its own probe.
    probe_seq: u64,
    awaiting_pong: bool,
    missed: u32,
    last_probe_at: Option<Instant>,
    latencies: VecDeque<Duration>,
    probes_sent: u64,
    pongs_received: u64,
    ticker: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

impl HeartbeatState {
    fn halt(&mut self) {
        self.running = false;
        self.generation += 1;
        self.awaiting_pong = false;
        if let Some(task) = self.ticker.take() {
            task.abort();
        }
        if let Some(task) = self.deadline.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    shared: Arc<Mutex<HeartbeatState>>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
}

impl HeartbeatManager {
    pub fn new(config: HeartbeatConfig) -> (Self, mpsc::UnboundedReceiver<HeartbeatEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            shared: Arc::new(Mutex::new(HeartbeatState::default())),
            events,
        };
        (manager, rx)
    }

    /// Start probing: one probe right away, then one every `interval`.
    /// Calling `start` on a running manager does nothing.
    pub fn start(&self) {
        let mut state = lock(&self.shared);
        if state.running {
            return;
        }
        state.running = true;
        state.generation += 1;
        state.missed = 0;
        state.awaiting_pong = false;

        let run = state.generation;
        let shared = self.shared.clone();
        let events = self.events.clone();
        let config = self.config.clone();

        state.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if !send_probe(&shared, &events, &config, run) {
                    break;
                }
            }
        }));
        debug!(interval_ms = self.config.interval.as_millis() as u64, "heartbeat started");
    }

    /// Idempotent.
    pub fn stop(&self) {
        let mut state = lock(&self.shared);
        if state.running {
            state.halt();
            debug!("heartbeat stopped");
        }
    }

    /// Record the peer's answer to the outstanding probe. Returns the
    /// measured round trip, or `None` if no probe was outstanding.
    pub fn handle_pong(&self) -> Option<Duration> {
        let mut state = lock(&self.shared);
        if !state.running || !state.awaiting_pong {
            return None;
        }
        let latency = state.last_probe_at.map(|at| at.elapsed())?;

        state.awaiting_pong = false;
        state.probe_seq += 1;
        if let Some(task) = state.deadline.take() {
            task.abort();
        }
        if state.latencies.len() == LATENCY_HISTORY {
            state.latencies.pop_front();
        }
        state.latencies.push_back(latency);
        state.missed = 0;
        state.pongs_received += 1;

        let _ = self.events.send(HeartbeatEvent::Pong { latency });
        Some(latency)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    pub fn stats(&self) -> HeartbeatStats {
        let state = lock(&self.shared);
        let average_latency = if state.latencies.is_empty() {
            None
        } else {
            let total: Duration = state.latencies.iter().sum();
            Some(total / state.latencies.len() as u32)
        };
        HeartbeatStats {
            running: state.running,
            missed_beats: state.missed,
            probes_sent: state.probes_sent,
            pongs_received: state.pongs_received,
            last_latency: state.latencies.back().copied(),
            average_latency,
            latency_samples: state.latencies.len(),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Probe envelope. Carries nothing but its send time.
    pub fn create_heartbeat() -> Message {
        Message::new(MessageType::Heartbeat, json!({ "timestamp": now_millis() }))
    }

    pub fn create_heartbeat_ack() -> Message {
        Message::new(MessageType::HeartbeatAck, json!({ "timestamp": now_millis() }))
    }

    pub fn is_heartbeat(message: &Message) -> bool {
        message.kind == MessageType::Heartbeat
    }

    pub fn is_heartbeat_ack(message: &Message) -> bool {
        message.kind == MessageType::HeartbeatAck
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        lock(&self.shared).halt();
    }
}

fn lock(shared: &Mutex<HeartbeatState>) -> MutexGuard<'_, HeartbeatState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Emit one probe and arm its deadline. Returns `false` once the run that
/// spawned the ticker is over.
fn send_probe(
    shared: &Arc<Mutex<HeartbeatState>>,
    events: &mpsc::UnboundedSender<HeartbeatEvent>,
    config: &HeartbeatConfig,
    run: u64,
) -> bool {
    let mut state = lock(shared);
    if !state.running || state.generation != run {
        return false;
    }
    // the previous probe is still unanswered and its deadline has not
    // fired; it will not get another chance once this one goes out
    if state.awaiting_pong && record_miss(&mut state, events, config.max_missed) {
        return false;
    }

    state.probe_seq += 1;
    state.awaiting_pong = true;
    state.last_probe_at = Some(Instant::now());
    state.probes_sent += 1;

    let seq = state.probe_seq;
    if let Some(task) = state.deadline.take() {
        task.abort();
    }
    let deadline_shared = shared.clone();
    let deadline_events = events.clone();
    let max_missed = config.max_missed;
    let timeout = config.timeout;
    state.deadline = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        on_deadline(&deadline_shared, &deadline_events, max_missed, run, seq);
    }));

    if events.send(HeartbeatEvent::Probe(HeartbeatManager::create_heartbeat())).is_err() {
        // nobody is listening any more
        state.halt();
        return false;
    }
    true
}

fn on_deadline(
    shared: &Mutex<HeartbeatState>,
    events: &mpsc::UnboundedSender<HeartbeatEvent>,
    max_missed: u32,
    run: u64,
    seq: u64,
) {
    let mut state = lock(shared);
    if !state.running || state.generation != run || state.probe_seq != seq {
        return;
    }
    // this task is the deadline; dropping the handle detaches it
    state.deadline = None;
    record_miss(&mut state, events, max_missed);
}

/// Count the outstanding probe as missed. Returns `true` once the miss
/// budget is spent and the manager has stopped.
fn record_miss(
    state: &mut HeartbeatState,
    events: &mpsc::UnboundedSender<HeartbeatEvent>,
    max_missed: u32,
) -> bool {
    if let Some(task) = state.deadline.take() {
        task.abort();
    }
    state.awaiting_pong = false;
    state.missed += 1;

    let missed = state.missed;
    warn!(missed, max_missed, "heartbeat probe unanswered");
    let _ = events.send(HeartbeatEvent::Timeout { missed });

    if missed >= max_missed {
        let _ = events.send(HeartbeatEvent::ConnectionLost);
        state.halt();
        return true;
    }
    false
}
