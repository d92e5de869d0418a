//! Executor side of the link.
//!
//! `ReliableConnection` owns one socket to the hub and keeps it usable
//! across drops: it reconnects with exponential backoff, queues outbound
//! messages while the socket is down and drains them in priority order once
//! it is back, tracks acknowledgements and runs the heartbeat.
//!
//! All of that state lives in a single task. The handle talks to it over a
//! command channel and exposes its state, inbound messages and lifecycle
//! events as typed subscriptions.

pub mod connection;
pub mod state;

pub use connection::ReliableConnection;
pub use state::{
    ClientConfig, ConnectionEvent, ConnectionState, ConnectionStats, MAX_RECONNECT_DELAY,
    reconnect_delay,
};
