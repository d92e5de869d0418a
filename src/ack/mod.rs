//! Per-message delivery confirmation.
//!
//! The tracker pairs messages sent with `requiresAck` to the ACK/NACK
//! envelopes that come back, and resolves each caller's future exactly once:
//! on acknowledgement, on timeout, or when the connection is torn down.

pub mod tracker;

pub use tracker::{AckTracker, DeliveryReceiver, DeliveryResult};
