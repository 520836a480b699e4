// tests/module.rs

use chanrpc::message::Call;
use chanrpc::{args, call_once, CronExpr, Module, ModuleConfig, RpcError, Submission, Value};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
mod common;

use common::{Outcomes, LONG_TIMEOUT};

fn adder() -> Module {
  let mut module = Module::new("adder", ModuleConfig::default().rpc_queue_capacity(16));
  module.register_handler_fn("add", |args| Ok(Value::new(args.get::<u32>(0)? + args.get::<u32>(1)?)));
  module
}

#[tokio::test]
async fn test_module_serves_calls_until_stopped() -> Result<(), RpcError> {
  common::setup_tracing();
  let handle = adder().spawn();
  let server = handle.context().server();

  let sum = common::within(LONG_TIMEOUT, call_once(&server, "add", args![20u32, 22u32])).await?;
  assert_eq!(sum.downcast::<u32>().ok(), Some(42));

  handle.stop().await.expect("module task panicked");
  assert!(server.is_closed());
  assert_eq!(server.executed(), 1);
  Ok(())
}

#[tokio::test]
async fn test_call_right_after_spawn_is_served() {
  common::setup_tracing();
  let mut module = adder();
  module.register_command("status", "report status", |_| Ok(Value::new("idle")));
  let handle = module.spawn();
  let ctx = handle.context().clone();

  // No yield between spawn and the calls: the loop task may not have been polled yet.
  let server = ctx.server();
  let command_server = ctx.command_server();
  let sum = call_once(&server, "add", args![1u32, 2u32]);
  let status = call_once(&command_server, "status", args![]);
  let (sum, status) = common::within(LONG_TIMEOUT, async { tokio::join!(sum, status) }).await;
  assert_eq!(sum.unwrap().downcast::<u32>().ok(), Some(3));
  assert_eq!(status.unwrap().downcast::<&'static str>().ok(), Some("idle"));

  handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_commands_are_served_by_the_running_loop() {
  common::setup_tracing();
  let mut module = adder();
  let executed = Arc::new(AtomicUsize::new(0));
  let executed_clone = executed.clone();
  module.register_command("status", "report status", move |_| {
    executed_clone.fetch_add(1, Ordering::SeqCst);
    Ok(Value::new(String::from("adder: ok")))
  });
  let handle = module.spawn();
  let commands = handle.context().command_server();

  let status = common::within(LONG_TIMEOUT, call_once(&commands, "status", args![])).await.unwrap();
  assert_eq!(status.downcast::<String>().ok().as_deref(), Some("adder: ok"));
  assert_eq!(executed.load(Ordering::SeqCst), 1);

  // Data handlers are not reachable through the command queue, nor the reverse.
  let err = call_once(&commands, "add", args![1u32, 1u32]).await.unwrap_err();
  assert!(matches!(err, RpcError::NotRegistered(ref id) if id.as_str() == "add"));
  let err = call_once(&handle.context().server(), "status", args![]).await.unwrap_err();
  assert!(matches!(err, RpcError::NotRegistered(_)));
  assert_eq!(commands.executed(), 1);

  handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_data_and_command_handlers_never_overlap() {
  common::setup_tracing();
  let busy = Arc::new(AtomicBool::new(false));
  let overlaps = Arc::new(AtomicUsize::new(0));
  let mut module = Module::new("isolated", ModuleConfig::default().rpc_queue_capacity(32));

  let (data_busy, data_overlaps) = (busy.clone(), overlaps.clone());
  module.register_handler("slow", move |_| {
    let busy = data_busy.clone();
    let overlaps = data_overlaps.clone();
    async move {
      if busy.swap(true, Ordering::SeqCst) {
        overlaps.fetch_add(1, Ordering::SeqCst);
      }
      tokio::time::sleep(Duration::from_millis(2)).await;
      busy.store(false, Ordering::SeqCst);
      Ok::<_, RpcError>(Value::unit())
    }
  });
  let (command_busy, command_overlaps) = (busy.clone(), overlaps.clone());
  module.register_command("poke", "touch shared state", move |_| {
    if command_busy.swap(true, Ordering::SeqCst) {
      command_overlaps.fetch_add(1, Ordering::SeqCst);
    }
    command_busy.store(false, Ordering::SeqCst);
    Ok(Value::unit())
  });
  let handle = module.spawn();
  let data = handle.context().server();
  let commands = handle.context().command_server();

  let mut calls = Vec::new();
  for i in 0..16 {
    let (server, id) = if i % 2 == 0 { (data.clone(), "slow") } else { (commands.clone(), "poke") };
    calls.push(tokio::spawn(async move { call_once(&server, id, args![]).await }));
  }
  let results = common::within(LONG_TIMEOUT, join_all(calls)).await;
  for result in results {
    result.expect("caller task panicked").expect("call failed");
  }
  assert_eq!(overlaps.load(Ordering::SeqCst), 0);
  assert_eq!(data.executed() + commands.executed(), 16);

  handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_cast_to_own_full_queue_times_out() {
  common::setup_tracing();
  let mut module = Module::new(
    "selfish",
    ModuleConfig::default()
      .rpc_queue_capacity(1)
      .submit_timeout(Duration::from_millis(20)),
  );
  let ctx = module.context();
  let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
  let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Result<(), RpcError>>();
  module.register_handler("a", move |_| {
    let ctx = ctx.clone();
    let started_tx = started_tx.clone();
    let result_tx = result_tx.clone();
    async move {
      let _ = started_tx.send(());
      tokio::time::sleep(Duration::from_millis(50)).await;
      let _ = result_tx.send(ctx.cast("b", args![]).await);
      Ok::<_, RpcError>(Value::unit())
    }
  });
  module.register_handler_fn("b", |_| Ok(Value::unit()));
  let handle = module.spawn();
  let ctx = handle.context().clone();

  ctx.cast("a", args![]).await.unwrap();
  common::within(LONG_TIMEOUT, started_rx.recv()).await;
  // "a" is running; this takes the only queue slot.
  ctx.server().cast("b", args![]).await.unwrap();

  let result = common::within(LONG_TIMEOUT, result_rx.recv()).await;
  assert!(matches!(result, Some(Err(RpcError::SubmitTimeout(_)))));
  assert!(ctx.server().dropped() >= 1);

  common::within(LONG_TIMEOUT, handle.stop()).await.unwrap();
}

#[tokio::test]
async fn test_async_call_between_modules_runs_callback() {
  common::setup_tracing();
  let adder = adder().spawn();
  let adder_server = adder.context().server();

  let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
  let mut caller = Module::new("caller", ModuleConfig::default().async_reply_capacity(4));
  let ctx = caller.context();
  caller.register_handler("kick", move |mut args| {
    let ctx = ctx.clone();
    let target = adder_server.clone();
    let tx = tx.clone();
    async move {
      let n = args.take::<u32>(0)?;
      ctx
        .async_call(&target, "add", args![n, n], move |result| {
          if let Ok(Ok(sum)) = result.map(|v| v.downcast::<u32>()) {
            let _ = tx.send(sum);
          }
        })
        .await;
      Ok::<_, RpcError>(Value::unit())
    }
  });
  let caller = caller.spawn();
  let caller_ctx = caller.context().clone();

  caller_ctx.cast("kick", args![21u32]).await.unwrap();
  let sum = common::within(LONG_TIMEOUT, rx.recv()).await;
  assert_eq!(sum, Some(42));
  assert_eq!(caller_ctx.client().pending(), 0);

  caller.stop().await.unwrap();
  adder.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_can_await_a_call_to_another_module() {
  common::setup_tracing();
  let adder = adder().spawn();
  let adder_server = adder.context().server();

  let mut proxy = Module::new("proxy", ModuleConfig::default());
  let ctx = proxy.context();
  proxy.register_handler("double", move |args| {
    let ctx = ctx.clone();
    let target = adder_server.clone();
    async move {
      let n = *args.get::<u32>(0)?;
      ctx.call(&target, "add", args![n, n]).await
    }
  });
  let proxy = proxy.spawn();

  let result = common::within(LONG_TIMEOUT, call_once(&proxy.context().server(), "double", args![8u32]))
    .await
    .unwrap();
  assert_eq!(result.downcast::<u32>().ok(), Some(16));

  proxy.stop().await.unwrap();
  adder.stop().await.unwrap();
}

#[tokio::test]
async fn test_timer_and_worker_callbacks_run_on_the_loop() {
  common::setup_tracing();
  let module = Module::new(
    "busy",
    ModuleConfig::default().worker_concurrency(2).timer_queue_capacity(4),
  );
  let ctx = module.context();
  let handle = module.spawn();

  let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
  let job_tx = tx.clone();
  let done_tx = tx.clone();
  ctx.go(
    move || {
      let _ = job_tx.send("job");
    },
    move || {
      let _ = done_tx.send("job-callback");
    },
  );
  assert_eq!(common::within(LONG_TIMEOUT, rx.recv()).await, Some("job"));
  assert_eq!(common::within(LONG_TIMEOUT, rx.recv()).await, Some("job-callback"));

  let timer_tx = tx.clone();
  let _timer = ctx.after(Duration::from_millis(20), move || {
    let _ = timer_tx.send("timer");
  });
  assert_eq!(common::within(LONG_TIMEOUT, rx.recv()).await, Some("timer"));

  let cron_tx = tx.clone();
  let every_second = CronExpr::parse("* * * * * *").unwrap();
  let cron = ctx.cron(every_second, move || {
    let _ = cron_tx.send("cron");
  });
  assert_eq!(common::within(Duration::from_secs(3), rx.recv()).await, Some("cron"));
  cron.stop();

  handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_commands_then_data_then_workers() {
  common::setup_tracing();
  let log = Outcomes::default();
  let mut module = Module::new(
    "ordered",
    ModuleConfig::default().rpc_queue_capacity(4).worker_concurrency(1),
  );
  let data_log = log.clone();
  module.register_handler_fn("store", move |_| {
    data_log.push("data");
    Ok(Value::unit())
  });
  let command_log = log.clone();
  module.register_command("status", "print module status", move |_| {
    command_log.push("command");
    Ok(Value::unit())
  });
  let ctx = module.context();

  // Queued before the loop starts; only shutdown will see them.
  ctx
    .server()
    .submit(Call::new("store", args![]), Submission::Blocking)
    .await
    .unwrap();
  ctx
    .command_server()
    .submit(Call::new("status", args![]), Submission::Blocking)
    .await
    .unwrap();
  let worker_log = log.clone();
  ctx.go(|| {}, move || worker_log.push("worker"));

  module.run(std::future::ready(())).await;
  assert_eq!(log.lines(), vec!["command", "data", "worker"]);
}

#[tokio::test]
#[should_panic(expected = "timers disabled")]
async fn test_disabled_timers_are_a_configuration_fault() {
  let module = Module::new("plain", ModuleConfig::default());
  let _ = module.context().cron(CronExpr::parse("0 * * * *").unwrap(), || {});
}
