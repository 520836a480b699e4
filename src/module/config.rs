// src/module/config.rs

use std::time::Duration;

use crate::error::RpcError;
use crate::runtime::mailbox::DEFAULT_MAILBOX_CAPACITY;

pub const DEFAULT_RPC_QUEUE_CAPACITY: usize = DEFAULT_MAILBOX_CAPACITY;
pub const DEFAULT_ASYNC_REPLY_CAPACITY: usize = 1;
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Sizes and timeouts of one module's private subsystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
  /// Worker pool concurrency. 0 disables the pool.
  pub worker_concurrency: usize,
  /// Fired-timer queue capacity. 0 disables timers.
  pub timer_queue_capacity: usize,
  /// Call queue capacity of the data and command servers. 0 means the default.
  pub rpc_queue_capacity: usize,
  /// Asynchronous reply queue capacity of the module's client. 0 means the default.
  pub async_reply_capacity: usize,
  /// How long the servers wait for a caller to accept a reply.
  pub reply_timeout: Option<Duration>,
  /// How long an asynchronous call waits for space in the target server's queue.
  pub submit_timeout: Option<Duration>,
  /// Bytes of backtrace attached to errors from panicking handlers. 0 attaches none.
  pub stack_trace_limit: usize,
}

impl Default for ModuleConfig {
  fn default() -> Self {
    Self {
      worker_concurrency: 0,
      timer_queue_capacity: 0,
      rpc_queue_capacity: DEFAULT_RPC_QUEUE_CAPACITY,
      async_reply_capacity: DEFAULT_ASYNC_REPLY_CAPACITY,
      reply_timeout: None,
      submit_timeout: None,
      stack_trace_limit: 0,
    }
  }
}

impl ModuleConfig {
  pub fn worker_concurrency(mut self, n: usize) -> Self {
    self.worker_concurrency = n;
    self
  }

  pub fn timer_queue_capacity(mut self, n: usize) -> Self {
    self.timer_queue_capacity = n;
    self
  }

  pub fn rpc_queue_capacity(mut self, n: usize) -> Self {
    self.rpc_queue_capacity = n;
    self
  }

  pub fn async_reply_capacity(mut self, n: usize) -> Self {
    self.async_reply_capacity = n;
    self
  }

  pub fn reply_timeout(mut self, timeout: Duration) -> Self {
    self.reply_timeout = Some(timeout);
    self
  }

  pub fn submit_timeout(mut self, timeout: Duration) -> Self {
    self.submit_timeout = Some(timeout);
    self
  }

  pub fn stack_trace_limit(mut self, bytes: usize) -> Self {
    self.stack_trace_limit = bytes;
    self
  }

  /// Fills unset or zero values with their defaults. Applied before any subsystem is built.
  pub fn normalized(mut self) -> Self {
    if self.rpc_queue_capacity == 0 {
      self.rpc_queue_capacity = DEFAULT_RPC_QUEUE_CAPACITY;
    }
    if self.async_reply_capacity == 0 {
      self.async_reply_capacity = DEFAULT_ASYNC_REPLY_CAPACITY;
    }
    if self.reply_timeout.map_or(true, |t| t.is_zero()) {
      self.reply_timeout = Some(DEFAULT_REPLY_TIMEOUT);
    }
    if self.submit_timeout.map_or(true, |t| t.is_zero()) {
      self.submit_timeout = Some(DEFAULT_SUBMIT_TIMEOUT);
    }
    self
  }

  /// Reads `{prefix}_WORKER_CONCURRENCY`, `{prefix}_TIMER_QUEUE_CAPACITY`,
  /// `{prefix}_RPC_QUEUE_CAPACITY`, `{prefix}_ASYNC_REPLY_CAPACITY`,
  /// `{prefix}_REPLY_TIMEOUT_MS`, `{prefix}_SUBMIT_TIMEOUT_MS` and
  /// `{prefix}_STACK_TRACE_LIMIT`. Missing variables keep their defaults.
  pub fn from_env(prefix: &str) -> Result<Self, RpcError> {
    Self::from_lookup(prefix, |key| std::env::var(key).ok())
  }

  pub(crate) fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RpcError> {
    let var = |name: &str| {
      let key = format!("{prefix}_{name}");
      lookup(&key).map(|value| (key, value))
    };
    let mut config = Self::default();
    if let Some((key, value)) = var("WORKER_CONCURRENCY") {
      config.worker_concurrency = parse_usize_var(&key, &value)?;
    }
    if let Some((key, value)) = var("TIMER_QUEUE_CAPACITY") {
      config.timer_queue_capacity = parse_usize_var(&key, &value)?;
    }
    if let Some((key, value)) = var("RPC_QUEUE_CAPACITY") {
      config.rpc_queue_capacity = parse_usize_var(&key, &value)?;
    }
    if let Some((key, value)) = var("ASYNC_REPLY_CAPACITY") {
      config.async_reply_capacity = parse_usize_var(&key, &value)?;
    }
    if let Some((key, value)) = var("REPLY_TIMEOUT_MS") {
      config.reply_timeout = Some(parse_ms_var(&key, &value)?);
    }
    if let Some((key, value)) = var("SUBMIT_TIMEOUT_MS") {
      config.submit_timeout = Some(parse_ms_var(&key, &value)?);
    }
    if let Some((key, value)) = var("STACK_TRACE_LIMIT") {
      config.stack_trace_limit = parse_usize_var(&key, &value)?;
    }
    Ok(config)
  }
}

// --- Helper functions for parsing configuration values ---
fn parse_usize_var(key: &str, value: &str) -> Result<usize, RpcError> {
  value.trim().parse::<usize>().map_err(|_| RpcError::InvalidConfig {
    key: key.to_string(),
    value: value.to_string(),
  })
}

/// Milliseconds, non-negative.
fn parse_ms_var(key: &str, value: &str) -> Result<Duration, RpcError> {
  parse_usize_var(key, value).map(|ms| Duration::from_millis(ms as u64))
}
