//! The `message` module defines the wire envelope shared by every other
//! component: the `Message` itself, its type and priority enums, and the
//! `Acknowledgement` record that confirms processing of a message.

pub mod envelope;

pub use envelope::{Acknowledgement, Message, MessageType, Priority, now_millis};
