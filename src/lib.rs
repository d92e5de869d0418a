//! # HubLink
//!
//! `hublink` is a reliable messaging layer between a central hub and remote
//! executors connected over WebSockets. The transport is allowed to drop,
//! stall or be torn down; this crate makes delivery look reliable on top of
//! it.
//!
//! ## Core Modules
//!
//! - `message`: The wire envelope, priorities and acknowledgements.
//! - `heartbeat`: Timer-driven liveness probes and latency tracking.
//! - `queue`: Bounded, priority-ordered outbound backlog with TTL expiry.
//! - `persistence`: Storage adapters the queue mirrors itself into (in-memory and `sled`).
//! - `ack`: Correlates acknowledged sends with the ACKs that come back.
//! - `client`: The executor's reconnecting connection.
//! - `pool`: The hub's session registry, with authentication, capacity limits and sweeps.
//! - `transport`: The WebSocket accept loop and the control envelopes shared by both sides.
//! - `config`: Layered configuration loading.
//! - `utils`: Error type and logging setup.

pub mod ack;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod message;
pub mod persistence;
pub mod pool;
pub mod queue;
pub mod transport;
pub mod utils;
