use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::Acknowledgement;
use crate::utils::{HubLinkError, Result};

pub const ACK_TIMEOUT_ERROR: &str = "Acknowledgement timeout";

/// Outcome of an acknowledged send.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub message_id: String,
    pub success: bool,
    /// The message reached the transport.
    pub delivered: bool,
    /// The peer confirmed successful processing.
    pub acknowledged: bool,
    pub attempts: u32,
    /// Time from the last transmission to the acknowledgement.
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

pub type DeliveryReceiver = oneshot::Receiver<Result<DeliveryResult>>;

#[derive(Debug)]
struct PendingAck {
    responder: oneshot::Sender<Result<DeliveryResult>>,
    sent_at: Option<Instant>,
    attempts: u32,
    timer: JoinHandle<()>,
}

impl PendingAck {
    fn result(&self, message_id: &str) -> DeliveryResult {
        DeliveryResult {
            message_id: message_id.to_string(),
            success: false,
            delivered: self.sent_at.is_some(),
            acknowledged: false,
            attempts: self.attempts,
            latency: None,
            error: None,
        }
    }
}

/// Pending acknowledgements for one connection.
///
/// Deadlines run as detached timers that report the expired message id on
/// the channel returned by `new`; the owner feeds those ids back through
/// `handle_timeout`. An id whose entry is already gone is ignored, so a
/// timer racing a late ACK is harmless.
#[derive(Debug)]
pub struct AckTracker {
    pending: HashMap<String, PendingAck>,
    timeouts: mpsc::UnboundedSender<String>,
}

impl AckTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (timeouts, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            pending: HashMap::new(),
            timeouts,
        };
        (tracker, rx)
    }

    /// Register `message_id` and arm its deadline. `delivered` says whether
    /// the message already went out or is still waiting in a queue.
    pub fn track(&mut self, message_id: &str, timeout: Duration, delivered: bool) -> DeliveryReceiver {
        let (responder, rx) = oneshot::channel();

        let id = message_id.to_string();
        let timeouts = self.timeouts.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeouts.send(id);
        });

        let entry = PendingAck {
            responder,
            sent_at: delivered.then(Instant::now),
            attempts: u32::from(delivered),
            timer,
        };
        if let Some(previous) = self.pending.insert(message_id.to_string(), entry) {
            previous.timer.abort();
            warn!(message_id, "message id tracked twice; earlier waiter dropped");
        }
        rx
    }

    /// Record a (re)transmission of a tracked message.
    pub fn mark_delivered(&mut self, message_id: &str) -> bool {
        match self.pending.get_mut(message_id) {
            Some(entry) => {
                entry.sent_at = Some(Instant::now());
                entry.attempts += 1;
                true
            }
            None => false,
        }
    }

    /// Resolve the entry the acknowledgement refers to. Returns `false` for
    /// acknowledgements nobody is waiting for.
    pub fn handle_acknowledgement(&mut self, ack: &Acknowledgement) -> bool {
        let Some(entry) = self.pending.remove(&ack.message_id) else {
            debug!(message_id = %ack.message_id, "acknowledgement for unknown message");
            return false;
        };
        entry.timer.abort();

        let mut result = entry.result(&ack.message_id);
        result.delivered = true;
        result.success = ack.success;
        result.acknowledged = ack.success;
        result.latency = entry.sent_at.map(|at| at.elapsed());
        result.error = ack.error.clone();

        let _ = entry.responder.send(Ok(result));
        true
    }

    /// Resolve an entry whose deadline passed without acknowledgement.
    pub fn handle_timeout(&mut self, message_id: &str) -> bool {
        let Some(entry) = self.pending.remove(message_id) else {
            return false;
        };
        warn!(message_id, attempts = entry.attempts, "acknowledgement timed out");

        let mut result = entry.result(message_id);
        result.error = Some(ACK_TIMEOUT_ERROR.to_string());
        let _ = entry.responder.send(Ok(result));
        true
    }

    /// Resolve an entry that can no longer be delivered at all.
    pub fn fail(&mut self, message_id: &str, error: &str) -> bool {
        let Some(entry) = self.pending.remove(message_id) else {
            return false;
        };
        entry.timer.abort();

        let mut result = entry.result(message_id);
        result.error = Some(error.to_string());
        let _ = entry.responder.send(Ok(result));
        true
    }

    /// Fail every pending entry with a connection-lost error.
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            entry.timer.abort();
            let _ = entry
                .responder
                .send(Err(HubLinkError::ConnectionLost(reason.to_string())));
        }
        if count > 0 {
            warn!(count, reason, "rejected pending acknowledgements");
        }
        count
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        for entry in self.pending.values() {
            entry.timer.abort();
        }
    }
}
