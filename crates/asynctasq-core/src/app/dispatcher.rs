//! Dispatcher: executes one envelope and settles it with the broker.
//!
//! One dispatch task owns one envelope from admission to its single
//! terminal broker operation. That ownership is what makes the per-task
//! event order (`task_started` → terminal event) a hard guarantee rather
//! than a hope: nothing else ever emits events for the envelope.
//!
//! Execution flow:
//! 1. emit `task_started`
//! 2. run the handler under a deadline and two cancellation sources
//!    (forced shutdown, lost lease)
//! 3. classify the result into a `TaskOutcome`
//! 4. let the decider choose ack / retry / dead-letter
//! 5. issue exactly one terminal broker op and emit the terminal event
//!
//! A lost lease short-circuits step 4–5: the broker already owns the
//! envelope again, so issuing *any* terminal op (especially ack) would
//! break at-least-once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::domain::{
    Decider, Decision, TaskEnvelope, TaskError, TaskOutcome, WorkerEvent, events::TaskRef,
};
use crate::ports::broker::{Broker, call_with_retry};
use crate::ports::clock::Clock;
use crate::ports::event_sink::EventEmitter;
use crate::ports::serializer::Serializer;
use crate::typed::{TaskEntry, TaskRegistry};

use super::pool::ProcessPool;
use super::renewer::LeaseGuard;
use super::status::WorkerStats;

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    serializer: Arc<dyn Serializer>,
    broker: Arc<dyn Broker>,
    emitter: Arc<EventEmitter>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    pool: Option<Arc<ProcessPool>>,
    stats: Arc<WorkerStats>,
    worker_id: String,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TaskRegistry>,
        serializer: Arc<dyn Serializer>,
        broker: Arc<dyn Broker>,
        emitter: Arc<EventEmitter>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        pool: Option<Arc<ProcessPool>>,
        stats: Arc<WorkerStats>,
        worker_id: String,
    ) -> Self {
        Self { registry, serializer, broker, emitter, decider, clock, pool, stats, worker_id }
    }

    /// Run one envelope to its terminal disposition. The caller holds the
    /// gate permit for the duration of this call.
    pub async fn dispatch(
        &self,
        envelope: TaskEnvelope,
        mut lease: LeaseGuard,
        cancel: watch::Receiver<bool>,
    ) {
        let started_at = Instant::now();
        let task = TaskRef::from(&envelope);

        self.stats.record_started();
        self.emit(WorkerEvent::TaskStarted {
            ts: self.clock.now(),
            worker_id: self.worker_id.clone(),
            task: task.clone(),
        })
        .await;

        let outcome = self.execute(&envelope, &mut lease, cancel).await;

        if lease.is_lost() {
            // 延長失敗＝broker は既に envelope を取り戻している。
            // ここで ack すると redelivery と二重完了になるので何もしない。
            self.stats.record_failed();
            self.emit(WorkerEvent::TaskFailed {
                ts: self.clock.now(),
                worker_id: self.worker_id.clone(),
                task,
                error: TaskError::lease_lost(),
                terminal: false,
            })
            .await;
            return;
        }

        self.settle(&envelope, outcome, started_at, task).await;
    }

    async fn execute(
        &self,
        envelope: &TaskEnvelope,
        lease: &mut LeaseGuard,
        mut cancel: watch::Receiver<bool>,
    ) -> TaskOutcome {
        if *cancel.borrow() {
            return TaskOutcome::Rejected { reason: "worker is shutting down".into() };
        }

        let Some(entry) = self.registry.get(envelope.task_name.as_str()) else {
            return TaskOutcome::failure(TaskError::unknown_task(&envelope.task_name));
        };
        let entry = entry.clone();
        let limit = self.deadline_for(envelope, &entry);

        let work = self.run_handler(&entry, envelope);
        tokio::pin!(work);

        let deadline = async {
            match limit {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let result = tokio::select! {
            // deadline/cancellation first so a ready handler cannot slip
            // past a cancellation that fired in the same tick
            biased;
            _ = &mut deadline => return TaskOutcome::Timeout,
            _ = cancel_requested(&mut cancel) => {
                return TaskOutcome::failure(TaskError::cancelled("shutdown forced cancellation"));
            }
            _ = lease.lost() => return TaskOutcome::failure(TaskError::lease_lost()),
            result = &mut work => result,
        };

        // 完走していてもキャンセル要求済みなら黙殺させない
        if *cancel.borrow() {
            return TaskOutcome::Timeout;
        }

        match result {
            Ok(bytes) => TaskOutcome::success(bytes),
            Err(error) => TaskOutcome::failure(error),
        }
    }

    async fn run_handler(
        &self,
        entry: &TaskEntry,
        envelope: &TaskEnvelope,
    ) -> Result<Vec<u8>, TaskError> {
        if entry.cpu_bound && let Some(pool) = &self.pool {
            return pool.execute(envelope.task_name.as_str(), &envelope.payload).await;
        }
        let call = self
            .serializer
            .decode(&envelope.payload)
            .map_err(|e| TaskError::serialization(e.to_string()))?;
        entry.handler.handle_dyn(call).await
    }

    /// `timeout` bounds execution; the remaining visibility additionally
    /// bounds it only when the lease cannot be extended (with a renewable
    /// lease the initial remaining-visibility says nothing about how long
    /// the task may run).
    fn deadline_for(&self, envelope: &TaskEnvelope, entry: &TaskEntry) -> Option<Duration> {
        let timeout = envelope.timeout.or(entry.policy.timeout);
        if self.broker.capabilities().supports_extend {
            timeout
        } else {
            let remaining = envelope.remaining_visibility(self.clock.now());
            Some(timeout.map_or(remaining, |t| t.min(remaining)))
        }
    }

    async fn settle(
        &self,
        envelope: &TaskEnvelope,
        outcome: TaskOutcome,
        started_at: Instant,
        task: TaskRef,
    ) {
        if outcome.is_success() {
            if let Err(err) = call_with_retry(|| self.broker.ack(&envelope.receipt)).await {
                // at-least-once: 失えば redelivery で回収される
                tracing::warn!(task_id = %envelope.id, %err, "ack failed");
                self.warn(format!("ack failed for {}: {err}", envelope.id)).await;
            }
            self.emit(WorkerEvent::TaskCompleted {
                ts: self.clock.now(),
                worker_id: self.worker_id.clone(),
                task,
                duration_ms: started_at.elapsed().as_millis() as u64,
            })
            .await;
            return;
        }

        let Some(error) = outcome.error() else {
            return; // unreachable by construction: non-success carries an error
        };
        self.stats.record_failed();

        match self.decider.decide(envelope, &outcome) {
            Decision::Ack => {
                // custom decider decided to drop the envelope
                self.emit_failed(task, error, true).await;
                if let Err(err) = call_with_retry(|| self.broker.ack(&envelope.receipt)).await {
                    self.warn(format!("drop-ack failed for {}: {err}", envelope.id)).await;
                }
            }
            Decision::Retry { delay } => {
                self.emit_failed(task.clone(), error, false).await;
                self.emit(WorkerEvent::TaskRetrying {
                    ts: self.clock.now(),
                    worker_id: self.worker_id.clone(),
                    task,
                    next_retry_in: delay.as_secs_f64(),
                })
                .await;
                if let Err(err) =
                    call_with_retry(|| self.broker.nack(&envelope.receipt, delay)).await
                {
                    // 返せなければ visibility 失効に任せる
                    tracing::warn!(task_id = %envelope.id, %err, "nack failed");
                    self.warn(format!("nack failed for {}: {err}", envelope.id)).await;
                }
            }
            Decision::DeadLetter => {
                self.emit_failed(task, error.clone(), true).await;
                if self.broker.capabilities().supports_dead_letter {
                    if let Err(err) = call_with_retry(|| {
                        self.broker.move_to_dead_letter(&envelope.receipt, &error)
                    })
                    .await
                    {
                        tracing::warn!(task_id = %envelope.id, %err, "dead-letter failed");
                        self.warn(format!("dead-letter failed for {}: {err}", envelope.id)).await;
                    }
                } else {
                    // DLQ なし: terminal イベントを残して ack で落とす
                    if let Err(err) = call_with_retry(|| self.broker.ack(&envelope.receipt)).await
                    {
                        self.warn(format!("terminal ack failed for {}: {err}", envelope.id)).await;
                    }
                }
            }
        }
    }

    async fn emit_failed(&self, task: TaskRef, error: TaskError, terminal: bool) {
        self.emit(WorkerEvent::TaskFailed {
            ts: self.clock.now(),
            worker_id: self.worker_id.clone(),
            task,
            error,
            terminal,
        })
        .await;
    }

    async fn warn(&self, message: String) {
        self.emit(WorkerEvent::WorkerWarning {
            ts: self.clock.now(),
            worker_id: self.worker_id.clone(),
            message,
        })
        .await;
    }

    async fn emit(&self, event: WorkerEvent) {
        self.emitter.emit(event).await;
    }
}

/// Resolves when forced cancellation is requested; pending forever if the
/// worker never asks (or the channel closes without asking).
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|&requested| requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, ErrorKind, Receipt, RetryPolicy, RetryStrategy, WorkerState};
    use crate::impls::inmem_broker::InMemoryBroker;
    use crate::impls::sinks::MemorySink;
    use crate::ports::broker::{BrokerCapabilities, BrokerError};
    use crate::ports::clock::SystemClock;
    use crate::typed::{Handler, HandlerError, JsonSerializer, Task, TaskPolicy, make_envelope};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

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

        fn policy() -> TaskPolicy {
            TaskPolicy {
                retry_strategy: RetryStrategy::Fixed,
                retry_delay_base: Duration::from_millis(10),
                ..TaskPolicy::default()
            }
        }
    }

    struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, args: AddArgs) -> Result<i64, HandlerError> {
            Ok(args.a + args.b)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct NoArgs {}

    struct Slow;

    impl Task for Slow {
        const NAME: &'static str = "demo.slow";
        type Args = NoArgs;
        type Output = ();

        fn policy() -> TaskPolicy {
            TaskPolicy { timeout: Some(Duration::from_millis(100)), ..TaskPolicy::default() }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl Handler<Slow> for SlowHandler {
        async fn handle(&self, _args: NoArgs) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    struct TestRig {
        broker: Arc<InMemoryBroker>,
        sink: Arc<MemorySink>,
        dispatcher: Dispatcher,
        cancel_tx: watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
    }

    fn rig() -> TestRig {
        let mut registry = TaskRegistry::new();
        registry.register::<Add, _>(AddHandler).unwrap();
        registry.register::<Slow, _>(SlowHandler).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        let sink = MemorySink::new();
        let emitter = Arc::new(EventEmitter::new(vec![sink.clone()]));
        let decider = Arc::new(DefaultDecider::new(RetryPolicy {
            base_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        }));

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(JsonSerializer),
            broker.clone(),
            emitter,
            decider,
            Arc::new(SystemClock),
            None,
            Arc::new(WorkerStats::default()),
            "w-test".into(),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        TestRig { broker, sink, dispatcher, cancel_tx, cancel_rx }
    }

    async fn pull_one(broker: &InMemoryBroker) -> TaskEnvelope {
        broker
            .dequeue(&["default".to_string()], 1, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn success_path_acks_once_with_ordered_events() {
        let rig = rig();
        let envelope =
            make_envelope::<Add>(&AddArgs { a: 2, b: 3 }, "default", &JsonSerializer, Utc::now())
                .unwrap();
        rig.broker.enqueue(envelope).await.unwrap();
        let envelope = pull_one(&rig.broker).await;

        rig.dispatcher.dispatch(envelope, LeaseGuard::inert(), rig.cancel_rx.clone()).await;

        assert_eq!(rig.sink.event_types(), ["task_started", "task_completed"]);
        let counts = rig.broker.counts().await;
        assert_eq!(counts.leased + counts.ready + counts.scheduled + counts.dead, 0);

        // result bytes carried on the completion path decode back to 5
        match &rig.sink.snapshot()[1] {
            WorkerEvent::TaskCompleted { task, .. } => assert_eq!(task.attempt, 1),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_handler_is_retried_with_events_in_order() {
        let rig = rig();

        struct Flaky {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Handler<Add> for Flaky {
            async fn handle(&self, _args: AddArgs) -> Result<i64, HandlerError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("flaked"))
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register::<Add, _>(Flaky { calls: AtomicU32::new(0) }).unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(JsonSerializer),
            rig.broker.clone(),
            Arc::new(EventEmitter::new(vec![rig.sink.clone()])),
            Arc::new(DefaultDecider::default()),
            Arc::new(SystemClock),
            None,
            Arc::new(WorkerStats::default()),
            "w-test".into(),
        );

        let envelope =
            make_envelope::<Add>(&AddArgs { a: 1, b: 1 }, "default", &JsonSerializer, Utc::now())
                .unwrap();
        rig.broker.enqueue(envelope).await.unwrap();
        let envelope = pull_one(&rig.broker).await;

        dispatcher.dispatch(envelope, LeaseGuard::inert(), rig.cancel_rx.clone()).await;

        assert_eq!(rig.sink.event_types(), ["task_started", "task_failed", "task_retrying"]);
        match &rig.sink.snapshot()[1] {
            WorkerEvent::TaskFailed { error, terminal, .. } => {
                assert_eq!(error.kind, ErrorKind::User);
                assert!(!terminal);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // the envelope went back to the broker (scheduled for retry)
        let counts = rig.broker.counts().await;
        assert_eq!(counts.scheduled + counts.ready, 1);
        assert_eq!(counts.leased, 0);
    }

    #[tokio::test]
    async fn timeout_produces_a_timeout_failure_and_retry() {
        let rig = rig();
        let envelope =
            make_envelope::<Slow>(&NoArgs {}, "default", &JsonSerializer, Utc::now()).unwrap();
        rig.broker.enqueue(envelope).await.unwrap();
        let envelope = pull_one(&rig.broker).await;

        let started = Instant::now();
        rig.dispatcher.dispatch(envelope, LeaseGuard::inert(), rig.cancel_rx.clone()).await;
        assert!(started.elapsed() < Duration::from_secs(5), "deadline did not cut execution");

        assert_eq!(rig.sink.event_types(), ["task_started", "task_failed", "task_retrying"]);
        match &rig.sink.snapshot()[1] {
            WorkerEvent::TaskFailed { error, .. } => assert_eq!(error.kind, ErrorKind::Timeout),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_task_is_poison_and_dead_letters_immediately() {
        let rig = rig();
        let envelope = TaskEnvelope::new(
            crate::domain::TaskName::new("demo.never_registered"),
            "default",
            b"{}".to_vec(),
            Utc::now(),
        );
        rig.broker.enqueue(envelope).await.unwrap();
        let envelope = pull_one(&rig.broker).await;

        rig.dispatcher.dispatch(envelope, LeaseGuard::inert(), rig.cancel_rx.clone()).await;

        assert_eq!(rig.sink.event_types(), ["task_started", "task_failed"]);
        match &rig.sink.snapshot()[1] {
            WorkerEvent::TaskFailed { error, terminal, .. } => {
                assert_eq!(error.kind, ErrorKind::UnknownTask);
                assert!(terminal);
            }
            other => panic!("expected terminal failure, got {other:?}"),
        }
        assert_eq!(rig.broker.counts().await.dead, 1);
    }

    #[tokio::test]
    async fn undecodable_payload_dead_letters() {
        let rig = rig();
        let envelope = TaskEnvelope::new(
            crate::domain::TaskName::new("demo.add"),
            "default",
            b"\x00garbage".to_vec(),
            Utc::now(),
        );
        rig.broker.enqueue(envelope).await.unwrap();
        let envelope = pull_one(&rig.broker).await;

        rig.dispatcher.dispatch(envelope, LeaseGuard::inert(), rig.cancel_rx.clone()).await;

        assert_eq!(rig.broker.counts().await.dead, 1);
        let dead = rig.broker.dead_letters().await;
        assert_eq!(dead[0].1.kind, ErrorKind::Serialization);
    }

    #[tokio::test]
    async fn forced_cancellation_nacks_with_zero_delay() {
        let rig = rig();
        let envelope =
            make_envelope::<Slow>(&NoArgs {}, "default", &JsonSerializer, Utc::now()).unwrap();
        // no timeout for this test: cancel, not deadline, must end it
        let mut envelope = envelope;
        envelope.timeout = Some(Duration::from_secs(60));
        rig.broker.enqueue(envelope).await.unwrap();
        let envelope = pull_one(&rig.broker).await;

        let dispatch = {
            let cancel = rig.cancel_rx.clone();
            async move { rig.dispatcher.dispatch(envelope, LeaseGuard::inert(), cancel).await }
        };
        let cancel_tx = rig.cancel_tx.clone();
        let canceller = async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_tx.send(true).unwrap();
        };
        tokio::join!(dispatch, canceller);

        assert_eq!(rig.sink.event_types(), ["task_started", "task_failed", "task_retrying"]);
        match &rig.sink.snapshot()[1] {
            WorkerEvent::TaskFailed { error, .. } => assert_eq!(error.kind, ErrorKind::Cancelled),
            other => panic!("expected cancellation, got {other:?}"),
        }
        // zero-delay nack: ready immediately
        assert_eq!(rig.broker.counts().await.ready, 1);
    }

    /// Broker whose `extend` always fails and which counts acks: the
    /// no-double-ack-under-lease-loss property test.
    struct LostLeaseBroker {
        acks: AtomicU32,
    }

    #[async_trait]
    impl Broker for LostLeaseBroker {
        async fn connect(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn dequeue(
            &self,
            _queues: &[String],
            _max: usize,
            _lease: Duration,
        ) -> Result<Vec<TaskEnvelope>, BrokerError> {
            Ok(vec![])
        }
        async fn ack(&self, _receipt: &Receipt) -> Result<(), BrokerError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn nack(&self, _receipt: &Receipt, _delay: Duration) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn extend(&self, _receipt: &Receipt, _additional: Duration) -> Result<(), BrokerError> {
            Err(BrokerError::LeaseExpired)
        }
        async fn move_to_dead_letter(
            &self,
            _receipt: &Receipt,
            _failure: &TaskError,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
        fn capabilities(&self) -> BrokerCapabilities {
            BrokerCapabilities {
                supports_dead_letter: true,
                supports_extend: true,
                native_delay_scheduling: true,
            }
        }
    }

    #[tokio::test]
    async fn lost_lease_never_acks() {
        let mut registry = TaskRegistry::new();
        registry.register::<Slow, _>(SlowHandler).unwrap();

        let broker = Arc::new(LostLeaseBroker { acks: AtomicU32::new(0) });
        let sink = MemorySink::new();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(JsonSerializer),
            broker.clone(),
            Arc::new(EventEmitter::new(vec![sink.clone()])),
            Arc::new(DefaultDecider::default()),
            Arc::new(SystemClock),
            None,
            Arc::new(WorkerStats::default()),
            "w-test".into(),
        );

        let mut envelope =
            make_envelope::<Slow>(&NoArgs {}, "default", &JsonSerializer, Utc::now()).unwrap();
        envelope.timeout = Some(Duration::from_secs(60));
        envelope.receipt = Receipt::new("r-1");

        // renewer against the failing broker: flags loss on the first beat
        let (_state_tx, state_rx) = watch::channel(WorkerState::Running);
        let renewer = super::super::renewer::LeaseRenewer::new(
            broker.clone(),
            Duration::from_millis(90),
            state_rx,
        );
        let lease = renewer.watch(&envelope);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        dispatcher.dispatch(envelope, lease, cancel_rx).await;

        assert_eq!(broker.acks.load(Ordering::SeqCst), 0, "ack after lease loss");
        assert_eq!(sink.event_types(), ["task_started", "task_failed"]);
        match &sink.snapshot()[1] {
            WorkerEvent::TaskFailed { error, .. } => assert_eq!(error.kind, ErrorKind::LeaseLost),
            other => panic!("expected lease-lost failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn without_extend_support_remaining_visibility_bounds_execution() {
        struct NoExtendBroker;

        #[async_trait]
        impl Broker for NoExtendBroker {
            async fn connect(&self) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn disconnect(&self) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn dequeue(
                &self,
                _queues: &[String],
                _max: usize,
                _lease: Duration,
            ) -> Result<Vec<TaskEnvelope>, BrokerError> {
                Ok(vec![])
            }
            async fn ack(&self, _receipt: &Receipt) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn nack(&self, _receipt: &Receipt, _delay: Duration) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn extend(
                &self,
                _receipt: &Receipt,
                _additional: Duration,
            ) -> Result<(), BrokerError> {
                Err(BrokerError::Unsupported("extend"))
            }
            async fn move_to_dead_letter(
                &self,
                _receipt: &Receipt,
                _failure: &TaskError,
            ) -> Result<(), BrokerError> {
                Ok(())
            }
            fn capabilities(&self) -> BrokerCapabilities {
                BrokerCapabilities {
                    supports_dead_letter: false,
                    supports_extend: false,
                    native_delay_scheduling: false,
                }
            }
        }

        // no policy timeout anywhere: only the visibility lease can bound it
        struct Stuck;

        impl Task for Stuck {
            const NAME: &'static str = "demo.stuck";
            type Args = NoArgs;
            type Output = ();
        }

        struct StuckHandler;

        #[async_trait]
        impl Handler<Stuck> for StuckHandler {
            async fn handle(&self, _args: NoArgs) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register::<Stuck, _>(StuckHandler).unwrap();

        let sink = MemorySink::new();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(JsonSerializer),
            Arc::new(NoExtendBroker),
            Arc::new(EventEmitter::new(vec![sink.clone()])),
            Arc::new(DefaultDecider::default()),
            Arc::new(SystemClock),
            None,
            Arc::new(WorkerStats::default()),
            "w-test".into(),
        );

        let mut envelope =
            make_envelope::<Stuck>(&NoArgs {}, "default", &JsonSerializer, Utc::now()).unwrap();
        envelope.visibility_deadline = Utc::now() + chrono::TimeDelta::milliseconds(200);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let started = Instant::now();
        dispatcher.dispatch(envelope, LeaseGuard::inert(), cancel_rx).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        // DLQ unsupported + attempts left => failed (not terminal) + retry
        assert_eq!(sink.event_types(), ["task_started", "task_failed", "task_retrying"]);
    }
}
