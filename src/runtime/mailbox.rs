// src/runtime/mailbox.rs

//! Type aliases for server call queues.
//!
//! Call queues use `tokio::sync::mpsc`: a timed-out or rejected send hands the
//! call back to the producer, so a call's callback is never lost with it.
//! Reply queues (see [`crate::message::ReplySender`]) use `async-channel`.

use crate::message::Call;

use tokio::sync::mpsc;

/// The sending end of a server's call queue. Cloneable, shared by all producers.
pub type MailboxSender = mpsc::Sender<Call>;

/// The receiving end of a server's call queue. Owned by the serving loop.
pub type MailboxReceiver = mpsc::Receiver<Call>;

/// Default capacity for bounded mailboxes.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1;

/// Creates a new bounded mailbox channel pair.
///
/// A capacity of zero is raised to one; bounded channels cannot be zero-sized.
pub fn mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
  mpsc::channel(capacity.max(1))
}
