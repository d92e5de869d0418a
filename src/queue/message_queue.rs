use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::message::{Message, Priority, now_millis};
use crate::persistence::QueueStorage;
use crate::utils::HubLinkError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub persistence_enabled: bool,
    /// Key the whole backlog is stored under.
    pub storage_key: String,
    /// Applied to messages enqueued without `expiresAt`.
    pub default_ttl: Duration,
    /// Applied to messages enqueued without `maxRetries`.
    pub default_max_retries: u32,
    pub retry_base_delay: Duration,
    pub cleanup_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            persistence_enabled: true,
            storage_key: "hublink.message_queue".to_string(),
            default_ttl: Duration::from_millis(300_000),
            default_max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            cleanup_interval: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message: Message,
    pub added_at: i64,
    /// Set once a delivery attempt failed; `None` means never attempted.
    #[serde(default)]
    pub next_retry_at: Option<i64>,
}

impl QueuedMessage {
    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn priority(&self) -> Priority {
        self.message.priority()
    }

    fn retry_count(&self) -> u32 {
        self.message.retry_count.unwrap_or(0)
    }

    fn max_retries(&self) -> u32 {
        self.message.max_retries.unwrap_or(0)
    }

    fn is_due(&self, now_ms: i64) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub oldest_added_at: Option<i64>,
}

/// Bounded priority queue. Entries are kept sorted: highest priority first,
/// oldest first within a priority.
#[derive(Debug)]
pub struct MessageQueue {
    config: QueueConfig,
    entries: VecDeque<QueuedMessage>,
    storage: Option<Box<dyn QueueStorage>>,
}

impl MessageQueue {
    /// In-memory queue with no durable backing.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            storage: None,
        }
    }

    /// Queue mirrored into `storage`, restored from whatever it already
    /// holds. Storage is ignored when persistence is disabled in `config`.
    pub fn with_storage(config: QueueConfig, storage: Box<dyn QueueStorage>) -> Self {
        let mut queue = Self::new(config);
        if queue.config.persistence_enabled {
            queue.storage = Some(storage);
            queue.restore();
        }
        queue
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Insert `message` at its priority position. Returns `false` when the
    /// message is already expired, or the queue is full and nothing of
    /// strictly lower priority can be evicted.
    pub fn enqueue(&mut self, mut message: Message) -> bool {
        let now = now_millis();
        if message.is_expired_at(now) {
            debug!(message_id = %message.id, "refusing expired message");
            return false;
        }

        let priority = message.priority();
        message.priority = Some(priority);
        message.retry_count.get_or_insert(0);
        message.max_retries.get_or_insert(self.config.default_max_retries);
        if message.expires_at.is_none() {
            message.expires_at = Some(now + self.config.default_ttl.as_millis() as i64);
        }

        if self.entries.len() >= self.config.max_size && !self.evict_below(priority) {
            warn!(
                message_id = %message.id,
                %priority,
                max_size = self.config.max_size,
                "message queue full"
            );
            return false;
        }

        self.insert_sorted(QueuedMessage {
            message,
            added_at: now,
            next_retry_at: None,
        });
        self.persist();
        true
    }

    /// Remove and return the highest-priority, oldest entry.
    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        let entry = self.entries.pop_front()?;
        self.persist();
        Some(entry)
    }

    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.entries.front()
    }

    /// Remove and return, in queue order, every unexpired entry that is not
    /// waiting out a retry delay. Expired entries found on the way are dropped.
    pub fn take_ready(&mut self) -> Vec<QueuedMessage> {
        let now = now_millis();
        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.entries.len());
        let before = self.entries.len();

        for entry in self.entries.drain(..) {
            if entry.message.is_expired_at(now) {
                continue;
            }
            if entry.is_due(now) {
                ready.push(entry);
            } else {
                waiting.push_back(entry);
            }
        }
        self.entries = waiting;

        if self.entries.len() != before {
            self.persist();
        }
        ready
    }

    /// Entries whose retry time has come and that still have attempts left.
    pub fn get_retryable_messages(&self) -> Vec<QueuedMessage> {
        let now = now_millis();
        self.entries
            .iter()
            .filter(|e| e.next_retry_at.is_some_and(|at| at <= now))
            .filter(|e| e.retry_count() < e.max_retries())
            .cloned()
            .collect()
    }

    /// Count a failed attempt against a queued entry and push its next
    /// attempt out. The entry is dropped once it has used up its retries.
    pub fn mark_for_retry(&mut self, id: &str) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id() == id) else {
            return false;
        };
        let Some(entry) = self.entries.remove(pos) else {
            return false;
        };
        let kept = self.schedule_retry(entry);
        self.persist();
        kept
    }

    /// Put back an entry whose delivery failed after it was taken off the
    /// queue, counting the failure as an attempt.
    pub fn retry_later(&mut self, entry: QueuedMessage) -> bool {
        let kept = self.schedule_retry(entry);
        self.persist();
        kept
    }

    pub fn remove(&mut self, id: &str) -> Option<QueuedMessage> {
        let pos = self.entries.iter().position(|e| e.id() == id)?;
        let entry = self.entries.remove(pos);
        self.persist();
        entry
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries.retain(|e| !e.message.is_expired_at(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "expired queued messages");
            self.persist();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            size: self.entries.len(),
            max_size: self.config.max_size,
            oldest_added_at: self.entries.iter().map(|e| e.added_at).min(),
            ..QueueStats::default()
        };
        for entry in &self.entries {
            match entry.priority() {
                Priority::Critical => stats.critical += 1,
                Priority::High => stats.high += 1,
                Priority::Normal => stats.normal += 1,
                Priority::Low => stats.low += 1,
            }
        }
        stats
    }

    fn insert_sorted(&mut self, entry: QueuedMessage) {
        let priority = entry.priority();
        let pos = self
            .entries
            .iter()
            .position(|e| e.priority() < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    /// Make room by dropping the tail entry if it ranks strictly below
    /// `incoming`. Critical entries are never evicted.
    fn evict_below(&mut self, incoming: Priority) -> bool {
        match self.entries.back() {
            Some(tail) if tail.priority() != Priority::Critical && tail.priority() < incoming => {
                if let Some(evicted) = self.entries.pop_back() {
                    warn!(
                        message_id = %evicted.id(),
                        priority = %evicted.priority(),
                        %incoming,
                        "evicted queued message to make room"
                    );
                }
                true
            }
            _ => false,
        }
    }

    fn schedule_retry(&mut self, mut entry: QueuedMessage) -> bool {
        let attempts = entry.retry_count() + 1;
        if attempts >= entry.max_retries() {
            warn!(message_id = %entry.id(), attempts, "dropping message after final retry");
            return false;
        }
        let now = now_millis();
        if entry.message.is_expired_at(now) {
            return false;
        }
        entry.message.retry_count = Some(attempts);
        let delay = self
            .config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempts - 1));
        entry.next_retry_at = Some(now + delay.as_millis() as i64);

        if self.entries.len() >= self.config.max_size && !self.evict_below(entry.priority()) {
            warn!(message_id = %entry.id(), "no room to requeue message for retry");
            return false;
        }
        self.insert_sorted(entry);
        true
    }

    fn restore(&mut self) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let raw = match storage.get_item(&self.config.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read persisted queue");
                return;
            }
        };
        let stored: Vec<QueuedMessage> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "discarding unreadable persisted queue");
                return;
            }
        };

        let now = now_millis();
        let total = stored.len();
        for entry in stored.into_iter().filter(|e| !e.message.is_expired_at(now)) {
            if self.entries.len() >= self.config.max_size {
                break;
            }
            self.insert_sorted(entry);
        }
        info!(restored = self.entries.len(), discarded = total - self.entries.len(), "restored message queue");
        self.persist();
    }

    fn persist(&self) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let key = &self.config.storage_key;
        let result = if self.entries.is_empty() {
            storage.remove_item(key)
        } else {
            serde_json::to_string(&self.entries)
                .map_err(HubLinkError::from)
                .and_then(|json| storage.set_item(key, &json))
        };
        if let Err(e) = result {
            warn!(error = %e, size = self.entries.len(), "failed to persist message queue");
        }
    }
}
