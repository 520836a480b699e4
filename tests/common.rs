// tests/common.rs
#![allow(dead_code)] // Not every test binary uses every helper

use chanrpc::{CallResult, Server};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::task::JoinHandle;

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(200);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(2);

static TRACING_INIT: Once = Once::new();

/// Installs a test-writer subscriber once per test binary. `RUST_LOG` overrides the filter.
pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    let default_filter = "chanrpc=debug,warn";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_max_level(tracing::Level::TRACE)
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

/// Awaits `fut`, failing the test if it takes longer than `duration`.
pub async fn within<F: Future>(duration: Duration, fut: F) -> F::Output {
  match tokio::time::timeout(duration, fut).await {
    Ok(output) => output,
    Err(_) => panic!("operation did not complete within {:?}", duration),
  }
}

/// Starts `server` and executes its calls on a background task for the rest of the test.
pub fn serve(mut server: Server) -> JoinHandle<Server> {
  use chanrpc::runtime::EventSource;
  server.start();
  tokio::spawn(async move {
    while let Some(call) = server.next_event().await {
      let _ = server.execute(call).await;
    }
    server
  })
}

/// Shared log of callback outcomes, rendered as `tag:ok:<u32>` or `tag:err:<message>`.
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<String>>>);

impl Outcomes {
  pub fn callback(&self, tag: &'static str) -> impl FnOnce(CallResult) + Send + 'static {
    let log = self.0.clone();
    move |result: CallResult| {
      let line = match result {
        Ok(value) => match value.downcast::<u32>() {
          Ok(n) => format!("{tag}:ok:{n}"),
          Err(other) => format!("{tag}:ok:<{}>", other.type_name()),
        },
        Err(err) => format!("{tag}:err:{err}"),
      };
      log.lock().unwrap().push(line);
    }
  }

  pub fn push(&self, line: impl Into<String>) {
    self.0.lock().unwrap().push(line.into());
  }

  pub fn lines(&self) -> Vec<String> {
    self.0.lock().unwrap().clone()
  }
}
