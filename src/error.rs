use std::time::Duration;
use thiserror::Error;

use crate::message::CallId;

#[derive(Error, Debug, Clone)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum RpcError {
  // --- Validation Errors ---
  #[error("function id {0}: function not registered")]
  NotRegistered(CallId),
  #[error("server {0} is not serving yet (handler table not frozen)")]
  NotServing(String),

  // --- Submission Errors ---
  #[error("server timeout: call not accepted within {0:?}")]
  SubmitTimeout(Duration),
  #[error("mailbox closed")]
  Closed,
  #[error("reply destination abandoned before a result arrived")]
  ReplyLost,

  // --- Admission Control ---
  #[error("too many calls")]
  TooManyCalls,
  #[error("asynchronous calls are disabled on this client")]
  AsyncDisabled,

  // --- Execution Errors ---
  #[error("{0}")]
  Handler(String),
  #[error("{message}")]
  Panicked { message: String, trace: Option<String> },
  #[error("argument {index}: expected {expected}")]
  BadArgument { index: usize, expected: &'static str },

  // --- Configuration ---
  #[error("invalid cron expression: {0}")]
  InvalidCron(String),
  #[error("invalid configuration value for {key}: {value}")]
  InvalidConfig { key: String, value: String },
}

impl RpcError {
  /// Shorthand for an ordinary handler failure.
  pub fn handler(msg: impl Into<String>) -> Self {
    RpcError::Handler(msg.into())
  }

  /// True if the error was produced by the fault boundary rather than returned by a handler.
  pub fn is_panic(&self) -> bool {
    matches!(self, RpcError::Panicked { .. })
  }
}

/// Result type produced by handlers and carried by replies.
pub type CallResult = Result<crate::message::Value, RpcError>;
