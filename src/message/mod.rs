// src/message/mod.rs

//! Values and envelopes that flow through mailboxes.

pub mod envelope;
pub mod value;

pub use envelope::{Call, CallId, Callback, Reply, ReplyReceiver, ReplySender};
pub use value::{Args, Value};
