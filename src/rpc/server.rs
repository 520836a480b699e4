// src/rpc/server.rs

use crate::error::{CallResult, RpcError};
use crate::message::{Args, Call, CallId, Reply, ReplySender};
use crate::rpc::fault;
use crate::runtime::mailbox::{mailbox, MailboxReceiver, MailboxSender};
use crate::runtime::source::EventSource;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc::error::{SendError, SendTimeoutError};

/// A registered handler, stored type-erased in the handler table.
pub type Handler = Arc<dyn Fn(Args) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// How long a producer is willing to wait for space in a server's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
  /// Wait indefinitely. Used by synchronous callers, who are committed to waiting anyway.
  Blocking,
  /// Wait at most this long, then fail with `SubmitTimeout`.
  Within(Duration),
}

/// A call the queue did not accept, handed back to the producer with the reason.
#[derive(Debug)]
pub struct Rejected {
  pub error: RpcError,
  pub call: Call,
}

/// State shared between the serving side and every producer handle.
struct Shared {
  name: String,
  /// Published once by `Server::start`; read-only afterwards.
  handlers: OnceLock<HashMap<CallId, Handler>>,
  call_tx: MailboxSender,
  capacity: usize,
  reply_timeout: Duration,
  dropped: AtomicUsize,
  executed: AtomicUsize,
}

/// The serving side of a mailbox: handler table plus the receiving end of the call queue.
///
/// Owned by exactly one consumer (normally a module's event loop). Producers use
/// [`ServerRef`] handles obtained from [`Server::handle`].
pub struct Server {
  shared: Arc<Shared>,
  /// Handlers registered so far. `None` once the table has been frozen.
  registry: Option<HashMap<CallId, Handler>>,
  call_rx: MailboxReceiver,
  trace_limit: usize,
}

impl Server {
  /// Creates a server whose queue holds `capacity` calls and which waits at most
  /// `reply_timeout` for a caller to accept each reply.
  pub fn new(capacity: usize, reply_timeout: Duration) -> Self {
    Self::named("chanrpc", capacity, reply_timeout)
  }

  pub fn named(name: impl Into<String>, capacity: usize, reply_timeout: Duration) -> Self {
    let capacity = capacity.max(1);
    let (call_tx, call_rx) = mailbox(capacity);
    let shared = Arc::new(Shared {
      name: name.into(),
      handlers: OnceLock::new(),
      call_tx,
      capacity,
      reply_timeout,
      dropped: AtomicUsize::new(0),
      executed: AtomicUsize::new(0),
    });
    tracing::debug!(server = %shared.name, capacity, ?reply_timeout, "Created mailbox server");
    Self {
      shared,
      registry: Some(HashMap::new()),
      call_rx,
      trace_limit: 0,
    }
  }

  /// Attach at most `limit` bytes of backtrace to errors produced by panicking handlers.
  pub fn with_stack_trace(mut self, limit: usize) -> Self {
    self.trace_limit = limit;
    self
  }

  /// Registers an asynchronous handler for `id`.
  ///
  /// # Panics
  /// If `id` is already registered or the handler table has been frozen by [`Server::start`].
  pub fn register<F, Fut>(&mut self, id: impl Into<CallId>, handler: F)
  where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
  {
    let id = id.into();
    let name = &self.shared.name;
    let Some(registry) = self.registry.as_mut() else {
      panic!("server {}: handler table is frozen, cannot register {}", name, id);
    };
    if registry.contains_key(&id) {
      panic!("function id {}: already registered", id);
    }
    tracing::trace!(server = %name, %id, "Registered handler");
    let erased: Handler = Arc::new(move |args: Args| handler(args).boxed());
    registry.insert(id, erased);
  }

  /// Registers a synchronous handler for `id`. Same rules as [`Server::register`].
  pub fn register_fn<F>(&mut self, id: impl Into<CallId>, handler: F)
  where
    F: Fn(Args) -> CallResult + Send + Sync + 'static,
  {
    self.register(id, move |args| std::future::ready(handler(args)));
  }

  /// Freezes the handler table and publishes it to producers.
  ///
  /// This is the start barrier: every registration happens-before any validation
  /// or execution. Calling it again is a no-op.
  pub fn start(&mut self) {
    if let Some(registry) = self.registry.take() {
      let count = registry.len();
      let _ = self.shared.handlers.set(registry);
      tracing::debug!(server = %self.shared.name, handlers = count, "Handler table frozen");
    }
  }

  pub fn is_started(&self) -> bool {
    self.registry.is_none()
  }

  /// A cloneable producer handle.
  pub fn handle(&self) -> ServerRef {
    ServerRef {
      shared: self.shared.clone(),
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  fn lookup(&self, id: &CallId) -> Option<Handler> {
    match &self.registry {
      Some(registry) => registry.get(id).cloned(),
      None => self.shared.handlers.get().and_then(|h| h.get(id).cloned()),
    }
  }

  /// Runs one call and delivers its reply.
  ///
  /// Returns the error describing a trapped panic, if the handler panicked.
  ///
  /// # Panics
  /// If no handler is registered for the call's id. Producers validate ids before
  /// submitting, so this only happens on an internal inconsistency.
  pub async fn execute(&self, call: Call) -> Result<(), RpcError> {
    let Call {
      id,
      args,
      reply_to,
      callback,
    } = call;
    let Some(handler) = self.lookup(&id) else {
      panic!("server {}: no function for {}", self.shared.name, id);
    };

    tracing::trace!(server = %self.shared.name, %id, args = args.len(), "Executing call");
    let result = fault::guard_handler(|| handler(args), self.trace_limit).await;
    self.shared.executed.fetch_add(1, Ordering::Relaxed);

    let trapped = match &result {
      Err(err @ RpcError::Panicked { message, .. }) => {
        tracing::error!(server = %self.shared.name, %id, panic = %message, "Handler panicked");
        Some(err.clone())
      }
      Err(err) if reply_to.is_none() => {
        tracing::debug!(server = %self.shared.name, %id, error = %err, "Fire-and-forget call failed");
        None
      }
      _ => None,
    };

    self.deliver(reply_to, Reply::new(result, callback)).await;
    match trapped {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  /// Best-effort reply delivery, bounded by the reply timeout.
  ///
  /// Returns `false` if the reply was dropped.
  pub(crate) async fn deliver(&self, reply_to: Option<ReplySender>, reply: Reply) -> bool {
    let Some(reply_to) = reply_to else {
      return true;
    };
    match tokio::time::timeout(self.shared.reply_timeout, reply_to.send(reply)).await {
      Ok(Ok(())) => true,
      Ok(Err(_)) => {
        let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(server = %self.shared.name, dropped, "Reply destination gone, dropping reply");
        false
      }
      Err(_) => {
        let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
          server = %self.shared.name,
          timeout = ?self.shared.reply_timeout,
          dropped,
          "Reply not accepted in time, dropping reply"
        );
        false
      }
    }
  }

  /// Rejects further submissions, then executes every call still queued.
  pub async fn close(&mut self) {
    self.call_rx.close();
    let mut drained = 0usize;
    while let Ok(call) = self.call_rx.try_recv() {
      let id = call.id.clone();
      if let Err(err) = self.execute(call).await {
        tracing::error!(server = %self.shared.name, %id, error = %err, "Call failed while draining");
      }
      drained += 1;
    }
    tracing::debug!(server = %self.shared.name, drained, "Server closed");
  }

  pub fn dropped(&self) -> usize {
    self.shared.dropped.load(Ordering::Relaxed)
  }

  pub fn executed(&self) -> usize {
    self.shared.executed.load(Ordering::Relaxed)
  }
}

impl fmt::Debug for Server {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Server")
      .field("name", &self.shared.name)
      .field("started", &self.is_started())
      .field("queued", &self.handle().len())
      .finish_non_exhaustive()
  }
}

#[async_trait]
impl EventSource for Server {
  type Event = Call;

  async fn next_event(&mut self) -> Option<Call> {
    self.call_rx.recv().await
  }
}

/// Producer handle to a [`Server`]. Cheap to clone, usable from any task or thread.
#[derive(Clone)]
pub struct ServerRef {
  shared: Arc<Shared>,
}

impl ServerRef {
  /// Checks that `id` has a handler. A local table lookup; no queue slot is used.
  pub fn validate(&self, id: &CallId) -> Result<(), RpcError> {
    let handlers = self
      .shared
      .handlers
      .get()
      .ok_or_else(|| RpcError::NotServing(self.shared.name.clone()))?;
    if handlers.contains_key(id) {
      Ok(())
    } else {
      Err(RpcError::NotRegistered(id.clone()))
    }
  }

  /// Places an already validated call on the queue.
  ///
  /// On failure the call comes back inside [`Rejected`], so its callback can still be honoured.
  pub async fn submit(&self, call: Call, submission: Submission) -> Result<(), Rejected> {
    match submission {
      Submission::Blocking => self.shared.call_tx.send(call).await.map_err(|SendError(call)| Rejected {
        error: RpcError::Closed,
        call,
      }),
      Submission::Within(limit) => self.shared.call_tx.send_timeout(call, limit).await.map_err(|err| match err {
        SendTimeoutError::Timeout(call) => {
          let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
          tracing::warn!(server = %self.shared.name, ?limit, dropped, "Call not accepted in time");
          Rejected {
            error: RpcError::SubmitTimeout(limit),
            call,
          }
        }
        SendTimeoutError::Closed(call) => Rejected {
          error: RpcError::Closed,
          call,
        },
      }),
    }
  }

  /// Validated fire-and-forget submission. The handler's result is discarded.
  ///
  /// Waits for queue space indefinitely; code running on the serving loop itself
  /// must use [`ServerRef::cast_with`] and a bounded [`Submission`].
  pub async fn cast(&self, id: impl Into<CallId>, args: Args) -> Result<(), RpcError> {
    self.cast_with(id, args, Submission::Blocking).await
  }

  /// Like [`ServerRef::cast`], waiting for queue space as `submission` allows.
  pub async fn cast_with(&self, id: impl Into<CallId>, args: Args, submission: Submission) -> Result<(), RpcError> {
    let id = id.into();
    self.validate(&id)?;
    self
      .submit(Call::new(id, args), submission)
      .await
      .map_err(|rejected| rejected.error)
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// Replies abandoned plus submissions that timed out.
  pub fn dropped(&self) -> usize {
    self.shared.dropped.load(Ordering::Relaxed)
  }

  pub fn executed(&self) -> usize {
    self.shared.executed.load(Ordering::Relaxed)
  }

  /// Number of calls currently queued.
  pub fn len(&self) -> usize {
    self.shared.capacity - self.shared.call_tx.capacity()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.shared.capacity
  }

  pub fn is_closed(&self) -> bool {
    self.shared.call_tx.is_closed()
  }
}

impl fmt::Debug for ServerRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServerRef")
      .field("name", &self.shared.name)
      .field("queued", &self.len())
      .finish_non_exhaustive()
  }
}

static_assertions::assert_impl_all!(ServerRef: Send, Sync, Clone);
static_assertions::assert_impl_all!(Server: Send, Sync);
