// benches/mailbox_throughput.rs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use chanrpc::{args, Client, Module, ModuleConfig, Value};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

// --- Benchmarking Constants ---
const NUM_CALLS: u64 = 1000;
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);

fn echo_module(queue: usize) -> Module {
  let mut module = Module::new(
    "bench",
    ModuleConfig::default().rpc_queue_capacity(queue).reply_timeout(Duration::from_secs(1)),
  );
  module.register_handler_fn("echo", |mut args| Ok(args.take_value(0).unwrap_or_else(Value::unit)));
  module
}

fn sync_call_throughput(c: &mut Criterion) {
  let rt = Runtime::new().expect("Failed to create Tokio runtime");
  let mut group = c.benchmark_group("Mailbox_SyncCall");
  group.throughput(Throughput::Elements(NUM_CALLS));

  for queue in [1usize, 64].iter() {
    group.bench_with_input(BenchmarkId::from_parameter(queue), queue, |b, &queue| {
      b.to_async(&rt).iter_custom(|iters| async move {
        let handle = echo_module(queue).spawn();
        let server = handle.context().server();
        let client = Client::new(0, SUBMIT_TIMEOUT);

        let start = Instant::now();
        for _ in 0..iters {
          for i in 0..NUM_CALLS {
            let value = client.call(&server, "echo", args![i]).await.expect("call failed");
            black_box(value);
          }
        }
        let elapsed = start.elapsed();
        handle.stop().await.expect("module task panicked");
        elapsed
      });
    });
  }
  group.finish();
}

fn async_call_throughput(c: &mut Criterion) {
  let rt = Runtime::new().expect("Failed to create Tokio runtime");
  let mut group = c.benchmark_group("Mailbox_AsyncCall");
  group.throughput(Throughput::Elements(NUM_CALLS));

  group.bench_function("detached", |b| {
    b.to_async(&rt).iter_custom(|iters| async move {
      let handle = echo_module(NUM_CALLS as usize).spawn();
      let server = handle.context().server();
      let client = Client::new(NUM_CALLS as usize, SUBMIT_TIMEOUT);

      let start = Instant::now();
      for _ in 0..iters {
        for i in 0..NUM_CALLS {
          client.async_call_detached(&server, "echo", args![i]).await;
        }
        while client.pending() > 0 {
          client.dispatch_next().await;
        }
      }
      let elapsed = start.elapsed();
      handle.stop().await.expect("module task panicked");
      elapsed
    });
  });
  group.finish();
}

criterion_group!(benches, sync_call_throughput, async_call_throughput);
criterion_main!(benches);
