// src/runtime/mod.rs

//! Core asynchronous primitives: Mailboxes, event sources, and the worker pool
//! and timer services a module's event loop consumes.

pub mod cron;
pub mod mailbox;
pub mod source;
pub mod timer;
pub mod worker;

pub use cron::CronExpr;
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender};
pub use source::EventSource;
pub use timer::{FiredTimer, Timer, TimerDispatcher};
pub use worker::{Completion, WorkerPool};
