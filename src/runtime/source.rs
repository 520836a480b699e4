// src/runtime/source.rs

//! A uniform "waitable source" seen by the module event loop.

use async_trait::async_trait;

/// Something the event loop can wait on.
///
/// `next_event` must be cancel-safe: the loop races several sources and drops the
/// futures that lose, so a losing source must not consume an event.
#[async_trait]
pub trait EventSource: Send {
  type Event: Send;

  /// Waits for the next event. Resolves to `None` once the source is closed and drained.
  async fn next_event(&mut self) -> Option<Self::Event>;
}

/// Waits on an optional source.
///
/// A disabled (`None`) or exhausted source never becomes ready, so it simply
/// drops out of the loop's select.
pub async fn ready<S: EventSource + ?Sized>(source: Option<&mut S>) -> S::Event {
  if let Some(source) = source {
    if let Some(event) = source.next_event().await {
      return event;
    }
  }
  std::future::pending().await
}
