//! WorkerBuilder - ワーカーの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `register` で typed Handler を登録（重複はその場でエラー）
//! - `expect_tasks()` で期待される task 名を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
//!
//! A worker that would die on its first envelope should not start at all.

use std::sync::Arc;

use crate::domain::{Decider, DefaultDecider};
use crate::ports::broker::Broker;
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::event_sink::{EventEmitter, EventSink};
use crate::ports::serializer::Serializer;
use crate::typed::{Handler, JsonSerializer, RegistryError, Task, TaskRegistry};

use super::config::{ConfigError, WorkerConfig};
use super::pool::PoolConfig;
use super::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no broker configured")]
    MissingBroker,

    #[error("missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTasks(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: TaskRegistry,
    broker: Option<Arc<dyn Broker>>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    sinks: Vec<Arc<dyn EventSink>>,
    decider: Option<Arc<dyn Decider>>,
    pool: Option<PoolConfig>,
    expected_tasks: Option<Vec<String>>,
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: TaskRegistry::new(),
            broker: None,
            serializer: Arc::new(JsonSerializer),
            clock: Arc::new(SystemClock),
            sinks: Vec::new(),
            decider: None,
            pool: None,
            expected_tasks: None,
        }
    }

    /// Register a handler for `T`.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Configure the process pool's child command. The pool's size and
    /// recycling threshold come from `WorkerConfig` when set there; the
    /// `PoolConfig` values act as defaults.
    pub fn process_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Declare the task names this deployment must be able to run.
    pub fn expect_tasks(mut self, task_names: &[&str]) -> Self {
        self.expected_tasks = Some(task_names.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Validate and wire. Configuration errors here carry the same exit
    /// code 2 semantics as at `run()`.
    pub fn build(self) -> Result<Worker, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_tasks {
            let registered = self.registry.registered_names();
            let missing: Vec<String> =
                expected.iter().filter(|name| !registered.contains(name)).cloned().collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTasks(missing));
            }
        }

        let Some(broker) = self.broker else {
            return Err(BuildError::MissingBroker);
        };

        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry.clone())));

        let pool_config = self.pool.map(|mut pool| {
            if self.config.process_pool_size > 0 {
                pool.size = self.config.process_pool_size;
            }
            if pool.max_tasks_per_child.is_none() {
                pool.max_tasks_per_child = self.config.process_pool_max_tasks_per_child;
            }
            pool
        });

        Ok(Worker {
            config: self.config,
            broker,
            registry: Arc::new(self.registry),
            serializer: self.serializer,
            clock: self.clock,
            emitter: Arc::new(EventEmitter::new(self.sinks)),
            decider,
            pool_config,
            ctl: Worker::control(),
        })
    }

    /// Wire without validating, for exercising `run()`'s own validation
    /// paths in tests. Not part of the supported API surface.
    #[cfg(test)]
    pub(crate) fn build_unchecked(self) -> Worker {
        let broker = self.broker.expect("build_unchecked still needs a broker");
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry.clone())));
        Worker {
            config: self.config,
            broker,
            registry: Arc::new(self.registry),
            serializer: self.serializer,
            clock: self.clock,
            emitter: Arc::new(EventEmitter::new(self.sinks)),
            decider,
            pool_config: self.pool,
            ctl: Worker::control(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::inmem_broker::InMemoryBroker;
    use crate::typed::HandlerError;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct NoArgs {}

    struct Ping;

    impl Task for Ping {
        const NAME: &'static str = "test.ping";
        type Args = NoArgs;
        type Output = ();
    }

    struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(&self, _args: NoArgs) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn build_succeeds_with_expected_tasks_registered() {
        let worker = WorkerBuilder::new(WorkerConfig::default())
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .expect_tasks(&[Ping::NAME])
            .broker(Arc::new(InMemoryBroker::new()))
            .build();
        assert!(worker.is_ok());
    }

    #[test]
    fn build_reports_missing_expected_tasks() {
        let result = WorkerBuilder::new(WorkerConfig::default())
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .expect_tasks(&[Ping::NAME, "test.absent"])
            .broker(Arc::new(InMemoryBroker::new()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingTasks(missing)) if missing == vec!["test.absent".to_string()]
        ));
    }

    #[test]
    fn build_requires_a_broker() {
        let result = WorkerBuilder::new(WorkerConfig::default()).build();
        assert!(matches!(result, Err(BuildError::MissingBroker)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let result = WorkerBuilder::new(WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::default()
        })
        .broker(Arc::new(InMemoryBroker::new()))
        .build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }
}
