//! Liveness probing, independent of any socket.
//!
//! The manager only decides *when* a probe is due and *whether* the peer
//! answered in time; the owner of the connection receives `HeartbeatEvent`s
//! on a channel and does the actual I/O. Both the client state machine and
//! the server pool drive their probes through it.

pub mod manager;

pub use manager::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatStats};

#[cfg(test)]
mod tests;
