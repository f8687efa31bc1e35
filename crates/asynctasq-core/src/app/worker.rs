//! Worker core: wires everything together and owns the lifecycle.
//!
//! ```text
//! starting -> running -> draining -> stopped
//! ```
//!
//! - `starting -> running`: broker connected (with startup retries),
//!   process pool up, signal handlers installed, `worker_online` emitted.
//! - `running -> draining`: SIGTERM/SIGINT, `max_tasks` reached, or an
//!   unrecoverable poll error.
//! - `draining -> stopped`: in-flight work settled (within the grace
//!   period; a second signal or grace expiry force-cancels), pool drained,
//!   broker disconnected, `worker_offline` emitted. That is always the
//!   last event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{Decider, WorkerEvent, WorkerState};
use crate::ports::broker::{Broker, BrokerError, call_with_retry};
use crate::ports::clock::Clock;
use crate::ports::event_sink::EventEmitter;
use crate::ports::serializer::Serializer;
use crate::typed::TaskRegistry;

use super::config::{ConfigError, WorkerConfig};
use super::dispatcher::Dispatcher;
use super::gate::ConcurrencyGate;
use super::poller::Poller;
use super::pool::{PoolConfig, PoolError, ProcessPool};
use super::renewer::LeaseRenewer;
use super::status::WorkerStats;

/// Shared control surface: the state watch and the force-cancel flag.
/// The signal task, the poller and the handle all talk to the worker
/// through this; no component holds another component directly.
pub(crate) struct WorkerControl {
    state_tx: watch::Sender<WorkerState>,
    cancel_tx: watch::Sender<bool>,
}

impl WorkerControl {
    fn new() -> Arc<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self { state_tx, cancel_tx })
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn current(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// Forward-only transition; returns whether the state moved.
    pub fn advance(&self, next: WorkerState) -> bool {
        let mut moved = false;
        self.state_tx.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    pub fn request_drain(&self, reason: &str) {
        if self.advance(WorkerState::Draining) {
            tracing::info!(reason, "worker draining");
        }
    }

    pub fn force_cancel(&self) {
        tracing::warn!("force-cancelling in-flight tasks");
        let _ = self.cancel_tx.send(true);
    }
}

/// Programmatic shutdown, for embedders and tests; signals go through the
/// same paths.
#[derive(Clone)]
pub struct WorkerHandle {
    ctl: Arc<WorkerControl>,
}

impl WorkerHandle {
    /// Stop accepting work, let in-flight tasks finish (== first signal).
    pub fn shutdown(&self) {
        self.ctl.request_drain("shutdown requested via handle");
    }

    /// Drain *and* cancel in-flight tasks (== second signal).
    pub fn force_shutdown(&self) {
        self.ctl.request_drain("forced shutdown via handle");
        self.ctl.force_cancel();
    }

    pub fn state(&self) -> WorkerState {
        self.ctl.current()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker unreachable at startup: {0}")]
    BrokerUnreachable(BrokerError),

    #[error("process pool failed to start: {0}")]
    Pool(#[from] PoolError),

    #[error("interrupted before startup completed")]
    Interrupted,
}

impl WorkerError {
    /// Process exit code the embedding binary should use.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Config(_) => 2,
            WorkerError::Interrupted => 130,
            WorkerError::BrokerUnreachable(_) | WorkerError::Pool(_) => 1,
        }
    }
}

pub struct Worker {
    pub(crate) config: WorkerConfig,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) emitter: Arc<EventEmitter>,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) pool_config: Option<PoolConfig>,
    pub(crate) ctl: Arc<WorkerControl>,
}

impl Worker {
    pub(crate) fn control() -> Arc<WorkerControl> {
        WorkerControl::new()
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { ctl: Arc::clone(&self.ctl) }
    }

    /// Run to completion. `Ok(())` is a clean stop (exit code 0); the error
    /// carries the exit code otherwise.
    pub async fn run(self) -> Result<(), WorkerError> {
        self.config.validate()?;
        let worker_id = self.config.resolve_worker_id();
        tracing::info!(%worker_id, queues = ?self.config.queues, "worker starting");

        let signal_task = spawn_signal_listener(Arc::clone(&self.ctl));

        let connected = call_with_retry(|| self.broker.connect()).await;
        if let Err(err) = connected {
            signal_task.abort();
            return Err(WorkerError::BrokerUnreachable(err));
        }

        // signal while still starting: do not begin taking work
        if self.ctl.current().at_least(WorkerState::Draining) {
            let _ = self.broker.disconnect().await;
            signal_task.abort();
            return Err(WorkerError::Interrupted);
        }

        let pool = match &self.pool_config {
            Some(cfg) if cfg.size > 0 => {
                let pool = ProcessPool::new(cfg.clone()).inspect_err(|_| {
                    signal_task.abort();
                })?;
                Some(Arc::new(pool))
            }
            _ => None,
        };

        let stats = Arc::new(WorkerStats::default());
        let gate = Arc::new(ConcurrencyGate::new(self.config.concurrency));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&self.broker),
            self.config.visibility_timeout,
            self.ctl.state(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.serializer),
            Arc::clone(&self.broker),
            Arc::clone(&self.emitter),
            Arc::clone(&self.decider),
            Arc::clone(&self.clock),
            pool.clone(),
            Arc::clone(&stats),
            worker_id.clone(),
        ));

        self.emitter
            .emit(WorkerEvent::WorkerOnline { ts: self.clock.now(), worker_id: worker_id.clone() })
            .await;
        self.ctl.advance(WorkerState::Running);

        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.emitter),
            Arc::clone(&self.clock),
            Arc::clone(&stats),
            Arc::clone(&gate),
            worker_id.clone(),
            self.config.heartbeat_interval,
            self.ctl.state(),
        );

        let poller = Poller {
            broker: Arc::clone(&self.broker),
            gate: Arc::clone(&gate),
            dispatcher,
            renewer,
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&stats),
            emitter: Arc::clone(&self.emitter),
            ctl: Arc::clone(&self.ctl),
            queues: self.config.queues.clone(),
            visibility: self.config.visibility_timeout,
            empty_sleep: self.config.poll_empty_sleep,
            max_tasks: self.config.max_tasks,
            worker_id: worker_id.clone(),
        };
        if let Err(err) = poller.run().await {
            tracing::error!(%err, "poll loop failed");
        }
        self.ctl.request_drain("poll loop ended");

        // drain: in-flight work gets the grace period, then gets cancelled
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, gate.wait_until_empty()).await.is_err() {
            tracing::warn!("in-flight tasks outlived the grace period");
            self.ctl.force_cancel();
            let _ = tokio::time::timeout(FORCED_CANCEL_WAIT, gate.wait_until_empty()).await;
        }

        if let Some(pool) = &pool {
            pool.shutdown(grace).await;
        }
        if let Err(err) = self.broker.disconnect().await {
            tracing::warn!(%err, "broker disconnect failed");
        }
        heartbeat.abort();
        signal_task.abort();

        self.emitter
            .emit(WorkerEvent::WorkerOffline { ts: self.clock.now(), worker_id: worker_id.clone() })
            .await;
        self.ctl.advance(WorkerState::Stopped);
        tracing::info!(%worker_id, "worker stopped");
        Ok(())
    }
}

/// How long to wait for cancelled handlers to observe the cancellation.
const FORCED_CANCEL_WAIT: Duration = Duration::from_secs(5);

fn spawn_heartbeat(
    emitter: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
    stats: Arc<WorkerStats>,
    gate: Arc<ConcurrencyGate>,
    worker_id: String,
    period: Duration,
    mut state: watch::Receiver<WorkerState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // first tick fires immediately, right after worker_online
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = stats.snapshot(gate.in_flight());
                    emitter
                        .emit(WorkerEvent::WorkerHeartbeat {
                            ts: clock.now(),
                            worker_id: worker_id.clone(),
                            in_flight: snapshot.in_flight,
                            started_total: snapshot.started_total,
                            failed_total: snapshot.failed_total,
                            last_poll_at: snapshot.last_poll_at,
                        })
                        .await;
                }
                _ = wait_for_draining(&mut state) => return,
            }
        }
    })
}

/// Resolves once the worker state reaches at least `Draining`, without
/// holding a `watch::Ref` across an `.await` (keeps the future `Send` when
/// raced via `tokio::select!`).
async fn wait_for_draining(state: &mut watch::Receiver<WorkerState>) {
    loop {
        if state.borrow().at_least(WorkerState::Draining) {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// First SIGTERM/SIGINT drains; a second one during draining force-cancels.
/// SIGHUP is ignored.
#[cfg(unix)]
fn spawn_signal_listener(ctl: Arc<WorkerControl>) -> JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to install SIGHUP handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = term.recv() => on_stop_signal(&ctl, "SIGTERM"),
                _ = int.recv() => on_stop_signal(&ctl, "SIGINT"),
                _ = hup.recv() => tracing::debug!("ignoring SIGHUP"),
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_signal_listener(_ctl: Arc<WorkerControl>) -> JoinHandle<()> {
    tokio::spawn(std::future::pending::<()>())
}

#[cfg(unix)]
fn on_stop_signal(ctl: &WorkerControl, name: &str) {
    if ctl.current().at_least(WorkerState::Draining) {
        tracing::warn!(signal = name, "second stop signal");
        ctl.force_cancel();
    } else {
        tracing::info!(signal = name, "stop signal received");
        ctl.request_drain(name);
    }
}
