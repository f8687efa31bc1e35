use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use asynctasq_core::app::{PoolConfig, WorkerBuilder, WorkerConfig, child_main};
use asynctasq_core::domain::RetryStrategy;
use asynctasq_core::impls::{CallbackSink, InMemoryBroker};
use asynctasq_core::typed::{
    Handler, HandlerError, JsonSerializer, Task, TaskPolicy, TaskRegistry, make_envelope,
};

#[derive(Debug, Serialize, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

struct Add;

impl Task for Add {
    const NAME: &'static str = "demo.add";
    type Args = AddArgs;
    type Output = i64;
}

struct AddHandler;

#[async_trait]
impl Handler<Add> for AddHandler {
    async fn handle(&self, args: AddArgs) -> Result<i64, HandlerError> {
        Ok(args.a + args.b)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GreetArgs {
    name: String,
}

struct Greet;

impl Task for Greet {
    const NAME: &'static str = "demo.greet";
    type Args = GreetArgs;
    type Output = String;

    fn policy() -> TaskPolicy {
        TaskPolicy {
            max_attempts: 3,
            retry_strategy: RetryStrategy::Fixed,
            retry_delay_base: Duration::from_millis(500),
            ..TaskPolicy::default()
        }
    }
}

/// GreetHandler: 意図的に2回失敗してから成功するハンドラー
struct GreetHandler {
    remaining_failures: std::sync::atomic::AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self { remaining_failures: std::sync::atomic::AtomicU32::new(n) }
    }
}

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn handle(&self, args: GreetArgs) -> Result<String, HandlerError> {
        use std::sync::atomic::Ordering;
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }
        println!("✓ Hello, {}!", args.name);
        Ok(format!("Hello, {}!", args.name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DigestArgs {
    input: String,
    rounds: u32,
}

struct Digest;

impl Task for Digest {
    const NAME: &'static str = "demo.digest";
    type Args = DigestArgs;
    type Output = u64;

    fn cpu_bound() -> bool {
        true
    }
}

struct DigestHandler;

#[async_trait]
impl Handler<Digest> for DigestHandler {
    async fn handle(&self, args: DigestArgs) -> Result<u64, HandlerError> {
        // 故意に CPU を回すダミー（FNV-1a を rounds 回）
        let mut digest: u64 = 0xcbf2_9ce4_8422_2325;
        for _ in 0..args.rounds {
            for byte in args.input.as_bytes() {
                digest ^= u64::from(*byte);
                digest = digest.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        Ok(digest)
    }
}

fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register::<Add, _>(AddHandler).expect("register add");
    registry.register::<Greet, _>(GreetHandler::new(2)).expect("register greet");
    registry.register::<Digest, _>(DigestHandler).expect("register digest");
    registry
}

#[tokio::main]
async fn main() {
    // pool-child モード: 親プロセスの ProcessPool から起動される
    if std::env::args().nth(1).as_deref() == Some("pool-child") {
        let registry = Arc::new(build_registry());
        if let Err(err) = child_main(registry, Arc::new(JsonSerializer)).await {
            eprintln!("pool child failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("=== AsyncTasQ demo worker ===\n");

    // (A) Broker と Sink を用意
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(CallbackSink::new(|event| {
        let json = serde_json::to_string(event).unwrap_or_else(|_| "<encode error>".into());
        println!("📨 {json}");
    }));

    // (B) タスク投入（worker 起動前に積んでおく）
    let serializer = JsonSerializer;
    let now = chrono_now();
    let envelopes = vec![
        make_envelope::<Add>(&AddArgs { a: 2, b: 3 }, "default", &serializer, now)
            .expect("encode add"),
        make_envelope::<Greet>(&GreetArgs { name: "AsyncTasQ".into() }, "default", &serializer, now)
            .expect("encode greet"),
        make_envelope::<Digest>(
            &DigestArgs { input: "hello world".into(), rounds: 50_000 },
            "default",
            &serializer,
            now,
        )
        .expect("encode digest"),
    ];
    // greet は 2 回失敗するので合計 5 dispatch で完了する
    let total_dispatches = 5;
    for envelope in envelopes {
        println!("📤 Enqueued {} ({})", envelope.task_name, envelope.id);
        broker.enqueue(envelope).await.expect("enqueue");
    }

    // (C) Worker を構築して起動
    let exe = std::env::current_exe().expect("current_exe");
    let config = WorkerConfig {
        concurrency: 4,
        max_tasks: Some(total_dispatches),
        poll_empty_sleep: Duration::from_millis(50),
        process_pool_size: 1,
        ..WorkerConfig::default()
    };
    let worker = WorkerBuilder::new(config)
        .register::<Add, _>(AddHandler)
        .expect("register add")
        .register::<Greet, _>(GreetHandler::new(2))
        .expect("register greet")
        .register::<Digest, _>(DigestHandler)
        .expect("register digest")
        .expect_tasks(&[Add::NAME, Greet::NAME, Digest::NAME])
        .broker(broker.clone())
        .sink(sink)
        .process_pool(PoolConfig::new(exe, 1).with_args(vec!["pool-child".into()]))
        .build()
        .expect("build worker");

    // (D) max_tasks に到達すると自分で drain して止まる
    match worker.run().await {
        Ok(()) => {
            let counts = broker.counts().await;
            println!(
                "\n📊 Final broker counts: ready={}, scheduled={}, leased={}, dead={}",
                counts.ready, counts.scheduled, counts.leased, counts.dead
            );
            println!("👋 Clean shutdown");
        }
        Err(err) => {
            eprintln!("worker failed: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
