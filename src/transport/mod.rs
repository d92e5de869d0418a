//! WebSocket plumbing on the accepting side.
//!
//! `websocket` runs the accept loop: it reads the credential during the
//! upgrade, asks the pool for admission, then splits each socket into a
//! writer task fed by the session channel and a reader loop that feeds
//! frames back into the pool. `message` holds the control envelopes and
//! close codes shared with the client, and `breaker` the malformed-frame
//! policy both sides apply.

pub mod breaker;
pub mod message;
pub mod websocket;

pub use breaker::ProtocolErrorBreaker;
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod websocket_tests;
