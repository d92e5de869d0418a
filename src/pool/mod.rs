//! Server-side session registry.
//!
//! The pool is the single shared structure on the accepting side. It admits
//! authenticated executors (one live session per identity, bounded in
//! total), answers their heartbeats, and runs two sweeps: a liveness sweep
//! that pings every session and evicts the silent ones, and a slower cleanup
//! sweep that reclaims sessions whose socket is already gone.
//!
//! Concurrency notes:
//! - All session state sits behind one mutex. It is never held across an
//!   await; sockets are reached through per-session channels.
//! - Timers hold only a weak reference to the pool and re-check the session
//!   id before acting, so a timer outliving its session does nothing.

pub mod auth;
pub mod manager;
pub mod session;

pub use auth::{Authenticator, StaticKeyAuthenticator};
pub use manager::{Admission, ConnectionPool, PoolConfig, PoolEvent, ResourceReport};
pub use session::{CloseReason, ServerSession, SessionInfo};
