// src/rpc/client.rs

use crate::error::{CallResult, RpcError};
use crate::message::{Args, Call, CallId, Callback, Reply, ReplyReceiver, ReplySender};
use crate::rpc::fault;
use crate::rpc::server::{Rejected, ServerRef, Submission};
use crate::runtime::source::EventSource;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Submission timeout of the throwaway client used by [`call_once`].
pub const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(1);

struct ClientInner {
  /// Both ends are `None` when the client has no asynchronous capacity.
  reply_tx: Option<ReplySender>,
  reply_rx: Option<ReplyReceiver>,
  capacity: usize,
  /// Asynchronous calls submitted whose callback has not been dispatched yet.
  pending: AtomicUsize,
  submit_timeout: Duration,
  allow_overflow: AtomicBool,
  dropped: AtomicUsize,
}

/// The calling side of the mailbox protocol.
///
/// Clones share the asynchronous reply queue and counters, so handler code can
/// hold a clone while the owning event loop dispatches the replies.
#[derive(Clone)]
pub struct Client {
  inner: Arc<ClientInner>,
}

impl Client {
  /// `async_capacity` bounds the asynchronous reply queue (0 = synchronous calls only);
  /// `submit_timeout` bounds how long an asynchronous call waits for queue space.
  pub fn new(async_capacity: usize, submit_timeout: Duration) -> Self {
    let (reply_tx, reply_rx) = if async_capacity > 0 {
      let (tx, rx) = async_channel::bounded(async_capacity);
      (Some(tx), Some(rx))
    } else {
      (None, None)
    };
    Self {
      inner: Arc::new(ClientInner {
        reply_tx,
        reply_rx,
        capacity: async_capacity,
        pending: AtomicUsize::new(0),
        submit_timeout,
        allow_overflow: AtomicBool::new(false),
        dropped: AtomicUsize::new(0),
      }),
    }
  }

  /// Lets asynchronous calls through even when as many calls as the reply queue holds are pending.
  ///
  /// With overflow allowed, a call that fails before reaching its server while the
  /// reply queue is full runs its callback in place, on the calling task.
  pub fn set_allow_overflow(&self, allow: bool) {
    self.inner.allow_overflow.store(allow, Ordering::Relaxed);
  }

  pub fn allows_overflow(&self) -> bool {
    self.inner.allow_overflow.load(Ordering::Relaxed)
  }

  /// Calls `id` on `server` and waits for the result.
  ///
  /// Unknown ids fail without touching the server's queue. Must not target the
  /// caller's own module: its loop is busy running the caller.
  pub async fn call(&self, server: &ServerRef, id: impl Into<CallId>, args: Args) -> CallResult {
    let id = id.into();
    server.validate(&id)?;

    let (slot_tx, slot_rx) = async_channel::bounded(1);
    server
      .submit(Call::new(id, args).with_reply_to(slot_tx), Submission::Blocking)
      .await
      .map_err(|rejected| rejected.error)?;

    match slot_rx.recv().await {
      Ok(reply) => reply.into_result(),
      Err(_) => Err(RpcError::ReplyLost),
    }
  }

  /// Calls `id` on `server`; `callback` later runs with the result on the loop that
  /// dispatches this client's replies.
  ///
  /// Every failure (admission control, unknown id, submission timeout) is reported
  /// through `callback` as well, exactly once.
  pub async fn async_call<F>(&self, server: &ServerRef, id: impl Into<CallId>, args: Args, callback: F)
  where
    F: FnOnce(CallResult) + Send + 'static,
  {
    self.submit_async(server, id.into(), args, Some(Box::new(callback))).await
  }

  /// Like [`Client::async_call`] without a callback. Still counts as pending until its
  /// reply is dispatched.
  pub async fn async_call_detached(&self, server: &ServerRef, id: impl Into<CallId>, args: Args) {
    self.submit_async(server, id.into(), args, None).await
  }

  async fn submit_async(&self, server: &ServerRef, id: CallId, args: Args, callback: Option<Callback>) {
    let inner = &self.inner;
    let Some(reply_tx) = inner.reply_tx.as_ref() else {
      tracing::warn!(%id, "Asynchronous call on a client without asynchronous capacity");
      if let Some(callback) = callback {
        Self::run_callback(callback, Err(RpcError::AsyncDisabled));
      }
      return;
    };

    let already_pending = inner.pending.fetch_add(1, Ordering::AcqRel);
    if !self.allows_overflow() && already_pending >= inner.capacity {
      tracing::debug!(%id, pending = already_pending, capacity = inner.capacity, "Rejecting call: too many calls");
      self.dispatch(Reply::new(Err(RpcError::TooManyCalls), callback));
      return;
    }

    if let Err(err) = server.validate(&id) {
      tracing::debug!(%id, error = %err, "Asynchronous call failed validation");
      self.push_failed(Reply::new(Err(err), callback));
      return;
    }

    let call = Call {
      id,
      args,
      reply_to: Some(reply_tx.clone()),
      callback,
    };
    if let Err(Rejected { error, call }) = server.submit(call, Submission::Within(inner.submit_timeout)).await {
      if matches!(error, RpcError::SubmitTimeout(_)) {
        inner.dropped.fetch_add(1, Ordering::Relaxed);
      }
      tracing::debug!(id = %call.id, %error, "Asynchronous call not submitted");
      self.push_failed(Reply::new(Err(error), call.callback));
    }
  }

  /// Queues a locally produced failure so its callback runs on the dispatching loop.
  ///
  /// Never waits: when the reply queue is full (only possible with overflow allowed)
  /// the failure is dispatched in place.
  fn push_failed(&self, reply: Reply) {
    if let Some(reply_tx) = self.inner.reply_tx.as_ref() {
      match reply_tx.try_send(reply) {
        Ok(()) => {}
        Err(async_channel::TrySendError::Full(reply)) => {
          tracing::debug!("Reply queue full; dispatching failure in place");
          self.dispatch(reply);
        }
        Err(async_channel::TrySendError::Closed(reply)) => {
          tracing::error!("Own reply queue closed; dispatching in place");
          self.dispatch(reply);
        }
      }
    }
  }

  /// Completes one asynchronous call: decrements the pending counter and runs its callback, if any.
  ///
  /// A panicking callback is logged and swallowed.
  pub fn dispatch(&self, reply: Reply) {
    let decremented = self
      .inner
      .pending
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    if decremented.is_err() {
      tracing::warn!("Dispatching a reply with no pending asynchronous call");
    }
    if let Some(callback) = reply.callback {
      Self::run_callback(callback, reply.result);
    }
  }

  fn run_callback(callback: Callback, result: CallResult) {
    if let Err(panic) = fault::guard_callback(move || callback(result)) {
      tracing::error!(%panic, "Callback panicked");
    }
  }

  /// Waits for the next reply on the asynchronous reply queue.
  ///
  /// Never resolves on a client without asynchronous capacity.
  pub async fn next_reply(&self) -> Reply {
    if let Some(reply_rx) = self.inner.reply_rx.as_ref() {
      if let Ok(reply) = reply_rx.recv().await {
        return reply;
      }
    }
    std::future::pending().await
  }

  /// Receives and dispatches one reply. For callers driving a client without an event loop.
  pub async fn dispatch_next(&self) {
    let reply = self.next_reply().await;
    self.dispatch(reply);
  }

  /// Only producers close a queue; the reply queue's producers are the servers, so this does nothing.
  pub fn close(&self) {
    tracing::trace!(pending = self.pending(), "Client closed");
  }

  pub fn pending(&self) -> usize {
    self.inner.pending.load(Ordering::Acquire)
  }

  /// Asynchronous calls whose submission timed out.
  pub fn dropped(&self) -> usize {
    self.inner.dropped.load(Ordering::Relaxed)
  }

  pub fn async_capacity(&self) -> usize {
    self.inner.capacity
  }

  /// Replies waiting to be dispatched.
  pub fn queued_replies(&self) -> usize {
    self.inner.reply_rx.as_ref().map_or(0, |rx| rx.len())
  }
}

impl fmt::Debug for Client {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Client")
      .field("async_capacity", &self.inner.capacity)
      .field("pending", &self.pending())
      .field("allow_overflow", &self.allows_overflow())
      .finish_non_exhaustive()
  }
}

#[async_trait]
impl EventSource for Client {
  type Event = Reply;

  async fn next_event(&mut self) -> Option<Reply> {
    match self.inner.reply_rx.as_ref() {
      Some(reply_rx) => reply_rx.recv().await.ok(),
      None => None,
    }
  }
}

/// One-shot synchronous call for call sites that hold no client of their own.
pub async fn call_once(server: &ServerRef, id: impl Into<CallId>, args: Args) -> CallResult {
  Client::new(0, ONE_SHOT_TIMEOUT).call(server, id, args).await
}

static_assertions::assert_impl_all!(Client: Send, Sync, Clone);
