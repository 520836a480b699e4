// src/runtime/worker.rs

//! A small worker pool whose completions are consumed by a module's event loop.

use crate::rpc::fault;
use crate::runtime::source::EventSource;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A finished job, carrying the callback that must run on the event loop.
pub struct Completion {
  callback: Option<Task>,
  /// Panic message if the job itself panicked.
  panicked: Option<String>,
}

impl Completion {
  pub fn panicked(&self) -> Option<&str> {
    self.panicked.as_deref()
  }
}

impl fmt::Debug for Completion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Completion")
      .field("callback", &self.callback.is_some())
      .field("panicked", &self.panicked)
      .finish()
  }
}

struct PoolInner {
  done_tx: async_channel::Sender<Completion>,
  done_rx: async_channel::Receiver<Completion>,
  permits: Arc<Semaphore>,
  /// Jobs submitted whose completion has not been dispatched yet.
  pending: AtomicUsize,
  concurrency: usize,
}

/// Runs blocking jobs off the event loop, at most `concurrency` at a time.
#[derive(Clone)]
pub struct WorkerPool {
  inner: Arc<PoolInner>,
}

impl WorkerPool {
  pub fn new(concurrency: usize) -> Self {
    let concurrency = concurrency.max(1);
    let (done_tx, done_rx) = async_channel::bounded(concurrency);
    tracing::debug!(concurrency, "Created worker pool");
    Self {
      inner: Arc::new(PoolInner {
        done_tx,
        done_rx,
        permits: Arc::new(Semaphore::new(concurrency)),
        pending: AtomicUsize::new(0),
        concurrency,
      }),
    }
  }

  /// Runs `job` on the blocking thread pool, then queues `callback` for the event loop.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn go<J, C>(&self, job: J, callback: C)
  where
    J: FnOnce() + Send + 'static,
    C: FnOnce() + Send + 'static,
  {
    self.submit(Box::new(job), Some(Box::new(callback)));
  }

  /// Runs `job` with no completion callback. Still tracked until its completion is dispatched.
  pub fn go_detached<J>(&self, job: J)
  where
    J: FnOnce() + Send + 'static,
  {
    self.submit(Box::new(job), None);
  }

  fn submit(&self, job: Task, callback: Option<Task>) {
    self.inner.pending.fetch_add(1, Ordering::AcqRel);
    let inner = self.inner.clone();
    tokio::spawn(async move {
      let permit = inner.permits.clone().acquire_owned().await;
      let outcome = tokio::task::spawn_blocking(move || fault::guard_callback(job)).await;
      drop(permit);

      let panicked = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(message)) => Some(message),
        Err(join_err) => Some(join_err.to_string()),
      };
      if inner.done_tx.send(Completion { callback, panicked }).await.is_err() {
        tracing::warn!("Worker pool closed before a job completion could be queued");
      }
    });
  }

  /// Finishes one job on the event loop: runs its callback, if any.
  pub fn dispatch(&self, completion: Completion) {
    if self
      .inner
      .pending
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
      .is_err()
    {
      tracing::warn!("Dispatching a job completion with no pending job");
    }
    if let Some(message) = &completion.panicked {
      tracing::error!(panic = %message, "Worker job panicked");
    }
    if let Some(callback) = completion.callback {
      if let Err(panic) = fault::guard_callback(callback) {
        tracing::error!(%panic, "Worker callback panicked");
      }
    }
  }

  /// Waits for every outstanding job, dispatching their callbacks.
  pub async fn close(&self) {
    let mut drained = 0usize;
    while self.pending() > 0 {
      match self.inner.done_rx.recv().await {
        Ok(completion) => {
          self.dispatch(completion);
          drained += 1;
        }
        Err(_) => break,
      }
    }
    tracing::debug!(drained, "Worker pool closed");
  }

  pub fn pending(&self) -> usize {
    self.inner.pending.load(Ordering::Acquire)
  }

  pub fn concurrency(&self) -> usize {
    self.inner.concurrency
  }
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("concurrency", &self.inner.concurrency)
      .field("pending", &self.pending())
      .finish()
  }
}

#[async_trait]
impl EventSource for WorkerPool {
  type Event = Completion;

  async fn next_event(&mut self) -> Option<Completion> {
    self.inner.done_rx.recv().await.ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicBool;
  use std::time::Duration;

  #[tokio::test]
  async fn close_waits_for_outstanding_jobs() {
    let pool = WorkerPool::new(2);
    let ran = Arc::new(AtomicUsize::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
      let ran = ran.clone();
      let callbacks = callbacks.clone();
      pool.go(
        move || {
          std::thread::sleep(Duration::from_millis(5));
          ran.fetch_add(1, Ordering::SeqCst);
        },
        move || {
          callbacks.fetch_add(1, Ordering::SeqCst);
        },
      );
    }
    assert_eq!(pool.pending(), 5);

    pool.close().await;
    assert_eq!(ran.load(Ordering::SeqCst), 5);
    assert_eq!(callbacks.load(Ordering::SeqCst), 5);
    assert_eq!(pool.pending(), 0);
  }

  #[tokio::test]
  async fn panicking_job_still_completes() {
    let mut pool = WorkerPool::new(1);
    let called = Arc::new(AtomicBool::new(false));
    let called_clone = called.clone();
    pool.go(|| panic!("job failed"), move || called_clone.store(true, Ordering::SeqCst));

    let completion = pool.next_event().await.unwrap();
    assert_eq!(completion.panicked(), Some("job failed"));
    pool.dispatch(completion);
    assert!(called.load(Ordering::SeqCst));
    assert_eq!(pool.pending(), 0);
  }
}
