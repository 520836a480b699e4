// src/message/envelope.rs

use crate::error::CallResult;
use crate::message::Args;

use std::borrow::Cow;
use std::fmt;

/// Names a registered handler. Unique per server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(Cow<'static, str>);

impl CallId {
  pub const fn from_static(id: &'static str) -> Self {
    CallId(Cow::Borrowed(id))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CallId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&'static str> for CallId {
  fn from(id: &'static str) -> Self {
    CallId(Cow::Borrowed(id))
  }
}

impl From<String> for CallId {
  fn from(id: String) -> Self {
    CallId(Cow::Owned(id))
  }
}

/// Completion callback of an asynchronous call. Runs on the owning event loop.
pub type Callback = Box<dyn FnOnce(CallResult) + Send + 'static>;

/// Where a server delivers the reply of a call.
pub type ReplySender = async_channel::Sender<Reply>;
pub type ReplyReceiver = async_channel::Receiver<Reply>;

/// A request travelling through a server's mailbox.
pub struct Call {
  pub(crate) id: CallId,
  pub(crate) args: Args,
  /// `None` for fire-and-forget calls.
  pub(crate) reply_to: Option<ReplySender>,
  pub(crate) callback: Option<Callback>,
}

impl Call {
  pub fn new(id: impl Into<CallId>, args: Args) -> Self {
    Self {
      id: id.into(),
      args,
      reply_to: None,
      callback: None,
    }
  }

  pub fn with_reply_to(mut self, reply_to: ReplySender) -> Self {
    self.reply_to = Some(reply_to);
    self
  }

  pub fn with_callback(mut self, callback: Callback) -> Self {
    self.callback = Some(callback);
    self
  }

  pub fn id(&self) -> &CallId {
    &self.id
  }

  pub fn args(&self) -> &Args {
    &self.args
  }

  pub fn expects_reply(&self) -> bool {
    self.reply_to.is_some()
  }
}

impl fmt::Debug for Call {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Call")
      .field("id", &self.id)
      .field("args", &self.args.len())
      .field("reply_to", &self.reply_to.is_some())
      .field("callback", &self.callback.is_some())
      .finish()
  }
}

/// The outcome of a call on its way back to the caller.
pub struct Reply {
  pub(crate) result: CallResult,
  /// Copied from the originating call.
  pub(crate) callback: Option<Callback>,
}

impl Reply {
  pub fn new(result: CallResult, callback: Option<Callback>) -> Self {
    Self { result, callback }
  }

  pub fn result(&self) -> &CallResult {
    &self.result
  }

  pub fn into_result(self) -> CallResult {
    self.result
  }
}

impl fmt::Debug for Reply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Reply")
      .field("result", &self.result)
      .field("callback", &self.callback.is_some())
      .finish()
  }
}
