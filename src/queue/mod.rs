//! Outbound backlog for one connection.
//!
//! Messages that cannot be written right away wait here, ordered by
//! priority and then by arrival, until the connection is back. The queue is
//! bounded, drops what has outlived its TTL and can mirror itself into a
//! `QueueStorage` adapter so a restart does not lose the backlog.

pub mod message_queue;

pub use message_queue::{MessageQueue, QueueConfig, QueueStats, QueuedMessage};
