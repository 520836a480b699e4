// src/runtime/timer.rs

//! Timer dispatcher: timers fire on Tokio's clock, their callbacks run on the event loop.

use crate::rpc::fault;
use crate::runtime::cron::CronExpr;
use crate::runtime::source::EventSource;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

enum TimerCallback {
  Once(Box<dyn FnOnce() + Send + 'static>),
  Repeating(Arc<dyn Fn() + Send + Sync + 'static>),
}

/// Handle to a scheduled timer or cron job.
#[derive(Debug)]
pub struct Timer {
  stopped: Arc<AtomicBool>,
  task: AbortHandle,
}

impl Timer {
  /// Cancels the timer. A firing already queued on the loop is skipped.
  pub fn stop(&self) {
    self.stopped.store(true, Ordering::Release);
    self.task.abort();
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::Acquire)
  }
}

/// A timer that has fired and waits for the event loop to run it.
pub struct FiredTimer {
  callback: TimerCallback,
  stopped: Arc<AtomicBool>,
}

impl FiredTimer {
  /// Runs the callback unless the timer was stopped meanwhile. Panics are logged.
  pub fn trigger(self) {
    if self.stopped.load(Ordering::Acquire) {
      tracing::trace!("Skipping stopped timer");
      return;
    }
    let outcome = match self.callback {
      TimerCallback::Once(callback) => fault::guard_callback(callback),
      TimerCallback::Repeating(callback) => fault::guard_callback(move || callback()),
    };
    if let Err(panic) = outcome {
      tracing::error!(%panic, "Timer callback panicked");
    }
  }
}

impl fmt::Debug for FiredTimer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self.callback {
      TimerCallback::Once(_) => "once",
      TimerCallback::Repeating(_) => "repeating",
    };
    f.debug_struct("FiredTimer").field("kind", &kind).finish()
  }
}

/// Queues fired timers for a single consumer.
#[derive(Clone)]
pub struct TimerDispatcher {
  fired_tx: async_channel::Sender<FiredTimer>,
  fired_rx: async_channel::Receiver<FiredTimer>,
  shutdown: CancellationToken,
}

impl TimerDispatcher {
  pub fn new(capacity: usize) -> Self {
    let (fired_tx, fired_rx) = async_channel::bounded(capacity.max(1));
    tracing::debug!(capacity, "Created timer dispatcher");
    Self {
      fired_tx,
      fired_rx,
      shutdown: CancellationToken::new(),
    }
  }

  /// Fires `callback` once after `delay`. Must be called from within a Tokio runtime.
  pub fn after<F>(&self, delay: Duration, callback: F) -> Timer
  where
    F: FnOnce() + Send + 'static,
  {
    let stopped = Arc::new(AtomicBool::new(false));
    let fired = FiredTimer {
      callback: TimerCallback::Once(Box::new(callback)),
      stopped: stopped.clone(),
    };
    let fired_tx = self.fired_tx.clone();
    let shutdown = self.shutdown.clone();
    let task = tokio::spawn(async move {
      tokio::select! {
        _ = shutdown.cancelled() => {
          tracing::trace!("Timer dispatcher closed before timer fired");
        }
        _ = tokio::time::sleep(delay) => {
          if fired_tx.send(fired).await.is_err() {
            tracing::debug!("Timer dispatcher closed before timer fired");
          }
        }
      }
    });
    Timer {
      stopped,
      task: task.abort_handle(),
    }
  }

  /// Fires `callback` at every local time matching `expr` until stopped.
  pub fn cron<F>(&self, expr: CronExpr, callback: F) -> Timer
  where
    F: Fn() + Send + Sync + 'static,
  {
    let stopped = Arc::new(AtomicBool::new(false));
    let stopped_task = stopped.clone();
    let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(callback);
    let fired_tx = self.fired_tx.clone();
    let shutdown = self.shutdown.clone();
    let task = tokio::spawn(async move {
      loop {
        let now = Local::now();
        let Some(next) = expr.next_local(now) else {
          tracing::debug!(?expr, "Cron expression has no further matches");
          break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = tokio::time::sleep(wait) => {}
        }

        let fired = FiredTimer {
          callback: TimerCallback::Repeating(callback.clone()),
          stopped: stopped_task.clone(),
        };
        if fired_tx.send(fired).await.is_err() {
          break;
        }
      }
    });
    Timer {
      stopped,
      task: task.abort_handle(),
    }
  }

  /// Stops accepting fired timers and cancels every pending timer task.
  ///
  /// Callbacks of timers that never fired are dropped without running.
  pub fn close(&self) {
    self.shutdown.cancel();
    self.fired_rx.close();
    tracing::debug!(discarded = self.fired_rx.len(), "Timer dispatcher closed");
  }
}

impl fmt::Debug for TimerDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TimerDispatcher")
      .field("fired", &self.fired_rx.len())
      .finish()
  }
}

#[async_trait]
impl EventSource for TimerDispatcher {
  type Event = FiredTimer;

  async fn next_event(&mut self) -> Option<FiredTimer> {
    self.fired_rx.recv().await.ok()
  }
}
