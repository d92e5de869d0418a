//! The `persistence` module provides the storage adapters the message queue
//! writes its backlog to, so a restarted process resumes with the messages
//! it had not yet delivered.
//!
//! Adapters follow a small key/value contract (`QueueStorage`). `SledStorage`
//! keeps the data in an embedded `sled` database; `MemoryStorage` keeps it in
//! process and is what tests and non-persistent queues use.

pub mod sled_store;
pub mod storage;

pub use sled_store::SledStorage;
pub use storage::{MemoryStorage, QueueStorage};

#[cfg(test)]
mod tests;
