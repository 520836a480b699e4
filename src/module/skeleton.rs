// src/module/skeleton.rs

//! A module: one task owning a data server, a command server, a client, and
//! optionally a worker pool and a timer dispatcher, all driven by a single loop.

use crate::error::{CallResult, RpcError};
use crate::message::{Args, CallId};
use crate::module::config::{ModuleConfig, DEFAULT_REPLY_TIMEOUT, DEFAULT_SUBMIT_TIMEOUT};
use crate::rpc::{Client, Server, ServerRef, Submission};
use crate::runtime::cron::CronExpr;
use crate::runtime::source::ready;
use crate::runtime::timer::{Timer, TimerDispatcher};
use crate::runtime::worker::WorkerPool;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

/// Name and help text of a registered console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
  pub name: CallId,
  pub help: String,
}

pub struct Module {
  name: Arc<str>,
  config: ModuleConfig,
  client: Client,
  data: Server,
  command: Server,
  pool: Option<WorkerPool>,
  timers: Option<TimerDispatcher>,
  commands: Vec<CommandInfo>,
}

impl Module {
  /// Builds every subsystem from `config` after filling in defaults.
  ///
  /// Nothing runs until [`Module::run`] or [`Module::spawn`].
  pub fn new(name: impl Into<String>, config: ModuleConfig) -> Self {
    let name: Arc<str> = Arc::from(name.into());
    let config = config.normalized();
    let reply_timeout = config.reply_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT);
    let submit_timeout = config.submit_timeout.unwrap_or(DEFAULT_SUBMIT_TIMEOUT);

    let data = Server::named(name.to_string(), config.rpc_queue_capacity, reply_timeout)
      .with_stack_trace(config.stack_trace_limit);
    let command = Server::named(format!("{}/command", name), config.rpc_queue_capacity, reply_timeout)
      .with_stack_trace(config.stack_trace_limit);
    let client = Client::new(config.async_reply_capacity, submit_timeout);
    let pool = (config.worker_concurrency > 0).then(|| WorkerPool::new(config.worker_concurrency));
    let timers = (config.timer_queue_capacity > 0).then(|| TimerDispatcher::new(config.timer_queue_capacity));

    tracing::debug!(
      module = %name,
      workers = config.worker_concurrency,
      timers = config.timer_queue_capacity,
      rpc_capacity = config.rpc_queue_capacity,
      async_capacity = config.async_reply_capacity,
      "Module created"
    );
    Self {
      name,
      config,
      client,
      data,
      command,
      pool,
      timers,
      commands: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn config(&self) -> &ModuleConfig {
    &self.config
  }

  /// Registers an asynchronous handler on the data server.
  ///
  /// # Panics
  /// On a duplicate id.
  pub fn register_handler<F, Fut>(&mut self, id: impl Into<CallId>, handler: F)
  where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
  {
    self.data.register(id, handler);
  }

  /// Registers a synchronous handler on the data server.
  pub fn register_handler_fn<F>(&mut self, id: impl Into<CallId>, handler: F)
  where
    F: Fn(Args) -> CallResult + Send + Sync + 'static,
  {
    self.data.register_fn(id, handler);
  }

  /// Registers a console command. Commands run on the same loop as data calls,
  /// through a separate queue.
  pub fn register_command<F>(&mut self, name: impl Into<CallId>, help: impl Into<String>, handler: F)
  where
    F: Fn(Args) -> CallResult + Send + Sync + 'static,
  {
    let name = name.into();
    self.command.register_fn(name.clone(), handler);
    self.commands.push(CommandInfo {
      name,
      help: help.into(),
    });
  }

  /// Registered commands, in registration order.
  pub fn commands(&self) -> &[CommandInfo] {
    &self.commands
  }

  pub fn context(&self) -> ModuleContext {
    ModuleContext {
      name: self.name.clone(),
      client: self.client.clone(),
      data: self.data.handle(),
      command: self.command.handle(),
      pool: self.pool.clone(),
      timers: self.timers.clone(),
      submit_timeout: self.config.submit_timeout.unwrap_or(DEFAULT_SUBMIT_TIMEOUT),
    }
  }

  /// Runs the event loop until `stop` resolves, then shuts the module down.
  ///
  /// Each iteration waits for whichever source is ready first and handles exactly
  /// one event from it. Handlers, callbacks, job completions and timers therefore
  /// never run concurrently with each other. A stop request that is already
  /// pending is honoured before the next event.
  pub async fn run<F>(mut self, stop: F)
  where
    F: Future<Output = ()> + Send,
  {
    self.data.start();
    self.command.start();
    tracing::info!(module = %self.name, commands = self.commands.len(), "Module running");

    tokio::pin!(stop);
    let mut replies = self.client.clone();
    loop {
      if stop.as_mut().now_or_never().is_some() {
        tracing::debug!(module = %self.name, "Stop signal received");
        break;
      }
      tokio::select! {
        _ = &mut stop => {
          tracing::debug!(module = %self.name, "Stop signal received");
          break;
        }
        reply = ready(Some(&mut replies)) => {
          self.client.dispatch(reply);
        }
        call = ready(Some(&mut self.data)) => {
          let _ = self.data.execute(call).await;
        }
        call = ready(Some(&mut self.command)) => {
          let _ = self.command.execute(call).await;
        }
        completion = ready(self.pool.as_mut()) => {
          if let Some(pool) = &self.pool {
            pool.dispatch(completion);
          }
        }
        fired = ready(self.timers.as_mut()) => {
          fired.trigger();
        }
      }
    }

    self.shutdown().await;
  }

  async fn shutdown(&mut self) {
    tracing::debug!(module = %self.name, "Module shutting down");
    self.command.close().await;
    self.data.close().await;
    if let Some(pool) = &self.pool {
      pool.close().await;
    }
    self.client.close();
    if let Some(timers) = &self.timers {
      timers.close();
    }
    tracing::info!(
      module = %self.name,
      executed = self.data.executed(),
      dropped = self.data.dropped(),
      "Module stopped"
    );
  }

  /// Runs the module on its own task.
  ///
  /// The loop stops when [`ModuleHandle::stop`] is called or the handle is dropped.
  /// Handler tables are frozen before this returns, so the servers accept calls
  /// immediately.
  pub fn spawn(mut self) -> ModuleHandle {
    self.data.start();
    self.command.start();
    let context = self.context();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(self.run(async move {
      let _ = stop_rx.await;
    }));
    ModuleHandle {
      context,
      stop_tx: Some(stop_tx),
      join,
    }
  }
}

impl fmt::Debug for Module {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Module")
      .field("name", &self.name)
      .field("data", &self.data)
      .field("commands", &self.commands.len())
      .field("pool", &self.pool)
      .field("timers", &self.timers.is_some())
      .finish()
  }
}

/// Handle for code running inside (or alongside) a module.
///
/// Every operation that needs a subsystem panics if the module was configured
/// without it.
#[derive(Clone)]
pub struct ModuleContext {
  name: Arc<str>,
  client: Client,
  data: ServerRef,
  command: ServerRef,
  pool: Option<WorkerPool>,
  timers: Option<TimerDispatcher>,
  submit_timeout: Duration,
}

impl ModuleContext {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Producer handle to this module's data server, for other modules and transports.
  pub fn server(&self) -> ServerRef {
    self.data.clone()
  }

  pub fn command_server(&self) -> ServerRef {
    self.command.clone()
  }

  pub fn client(&self) -> &Client {
    &self.client
  }

  fn timers(&self) -> &TimerDispatcher {
    match &self.timers {
      Some(timers) => timers,
      None => panic!("module {}: timers disabled (timer_queue_capacity is 0)", self.name),
    }
  }

  /// Runs `callback` on the module loop after `delay`.
  pub fn after<F>(&self, delay: Duration, callback: F) -> Timer
  where
    F: FnOnce() + Send + 'static,
  {
    self.timers().after(delay, callback)
  }

  /// Runs `callback` on the module loop at every time matching `expr`.
  pub fn cron<F>(&self, expr: CronExpr, callback: F) -> Timer
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.timers().cron(expr, callback)
  }

  /// Runs `job` off the loop, then `callback` on it.
  pub fn go<J, C>(&self, job: J, callback: C)
  where
    J: FnOnce() + Send + 'static,
    C: FnOnce() + Send + 'static,
  {
    match &self.pool {
      Some(pool) => pool.go(job, callback),
      None => panic!("module {}: worker pool disabled (worker_concurrency is 0)", self.name),
    }
  }

  /// Synchronous call to another module's server. Never target this module's own server.
  pub async fn call(&self, server: &ServerRef, id: impl Into<CallId>, args: Args) -> CallResult {
    self.client.call(server, id, args).await
  }

  fn check_async(&self) {
    if self.client.async_capacity() == 0 {
      panic!("module {}: asynchronous calls disabled (async_reply_capacity is 0)", self.name);
    }
  }

  /// Asynchronous call; `callback` runs on this module's loop with the result.
  pub async fn async_call<F>(&self, server: &ServerRef, id: impl Into<CallId>, args: Args, callback: F)
  where
    F: FnOnce(CallResult) + Send + 'static,
  {
    self.check_async();
    self.client.async_call(server, id, args, callback).await
  }

  pub async fn async_call_detached(&self, server: &ServerRef, id: impl Into<CallId>, args: Args) {
    self.check_async();
    self.client.async_call_detached(server, id, args).await
  }

  /// Fire-and-forget call to this module's own data server.
  ///
  /// Waits at most the configured submit timeout for queue space, then fails with
  /// [`RpcError::SubmitTimeout`]. Safe to use from this module's own handlers.
  pub async fn cast(&self, id: impl Into<CallId>, args: Args) -> Result<(), RpcError> {
    self
      .data
      .cast_with(id, args, Submission::Within(self.submit_timeout))
      .await
  }
}

impl fmt::Debug for ModuleContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleContext")
      .field("name", &self.name)
      .field("client", &self.client)
      .finish_non_exhaustive()
  }
}

/// A module running on its own task.
#[derive(Debug)]
pub struct ModuleHandle {
  context: ModuleContext,
  stop_tx: Option<oneshot::Sender<()>>,
  join: JoinHandle<()>,
}

impl ModuleHandle {
  pub fn context(&self) -> &ModuleContext {
    &self.context
  }

  /// Signals the loop to stop and waits for its shutdown to finish.
  pub async fn stop(mut self) -> Result<(), JoinError> {
    if let Some(stop_tx) = self.stop_tx.take() {
      let _ = stop_tx.send(());
    }
    (&mut self.join).await
  }

  pub fn is_finished(&self) -> bool {
    self.join.is_finished()
  }
}

static_assertions::assert_impl_all!(Module: Send);
static_assertions::assert_impl_all!(ModuleContext: Send, Sync, Clone);

#[cfg(test)]
mod tests {
  use super::*;
  use crate::args;
  use crate::message::Value;

  #[test]
  fn commands_are_listed_in_order() {
    let mut module = Module::new("console", ModuleConfig::default());
    module.register_command("help", "list commands", |_| Ok(Value::unit()));
    module.register_command("cpuprof", "cpu profiling", |_| Ok(Value::unit()));
    let names: Vec<&str> = module.commands().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["help", "cpuprof"]);
    assert_eq!(module.commands()[1].help, "cpu profiling");
  }

  #[test]
  fn defaults_applied_on_construction() {
    let module = Module::new("m", ModuleConfig::default().rpc_queue_capacity(0));
    assert_eq!(module.config().rpc_queue_capacity, 1);
    assert_eq!(module.config().reply_timeout, Some(Duration::from_millis(10)));
    assert_eq!(module.context().client().async_capacity(), 1);
  }

  #[test]
  #[should_panic(expected = "worker pool disabled")]
  fn go_without_pool_panics() {
    let module = Module::new("m", ModuleConfig::default());
    module.context().go(|| {}, || {});
  }

  #[test]
  #[should_panic(expected = "timers disabled")]
  fn after_without_timers_panics() {
    let module = Module::new("m", ModuleConfig::default());
    module.context().after(Duration::from_secs(1), || {});
  }

  #[tokio::test]
  async fn stop_before_any_event_shuts_down_cleanly() {
    let mut module = Module::new("idle", ModuleConfig::default());
    module.register_handler_fn("ping", |_| Ok(Value::new("pong")));
    let server = module.context().server();
    module.run(std::future::ready(())).await;
    assert!(server.is_closed());
    assert!(matches!(server.cast("ping", args![]).await, Err(RpcError::Closed)));
  }
}
