// src/rpc/fault.rs

//! Fault boundary: turns a panic inside user code into an ordinary error value.

use crate::error::{CallResult, RpcError};

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::FutureExt;

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    return (*message).to_string();
  }
  if let Some(message) = payload.downcast_ref::<String>() {
    return message.clone();
  }
  if let Some(err) = payload.downcast_ref::<RpcError>() {
    return err.to_string();
  }
  "panic with non-string payload".to_string()
}

/// Builds the error reported for a trapped panic.
///
/// With `trace_limit > 0` a backtrace of the catch site is attached, truncated to
/// at most `trace_limit` bytes.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>, trace_limit: usize) -> RpcError {
  let message = panic_message(payload.as_ref());
  let trace = (trace_limit > 0).then(|| {
    let mut trace = Backtrace::force_capture().to_string();
    if trace.len() > trace_limit {
      let mut cut = trace_limit;
      while !trace.is_char_boundary(cut) {
        cut -= 1;
      }
      trace.truncate(cut);
    }
    trace
  });
  RpcError::Panicked { message, trace }
}

/// Drives a handler future to completion, trapping panics raised while creating or polling it.
pub(crate) async fn guard_handler<F, Fut>(make: F, trace_limit: usize) -> CallResult
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = CallResult>,
{
  let fut = match catch_unwind(AssertUnwindSafe(make)) {
    Ok(fut) => fut,
    Err(payload) => return Err(panic_error(payload, trace_limit)),
  };
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(result) => result,
    Err(payload) => Err(panic_error(payload, trace_limit)),
  }
}

/// Runs a callback, returning the panic message if it panicked.
pub(crate) fn guard_callback<F: FnOnce()>(f: F) -> Result<(), String> {
  catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}
