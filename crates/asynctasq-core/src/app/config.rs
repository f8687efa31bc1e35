//! Worker configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::domain::RetryPolicy;

/// All knobs the worker recognizes.
///
/// Loading (files, env, CLI flags) is the embedding application's concern;
/// this type only defines the keys, their defaults and their validity. A
/// `WorkerConfig` that fails `validate()` is a configuration error and maps
/// to exit code 2.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Ordered list, highest priority first.
    pub queues: Vec<String>,

    /// In-flight budget.
    pub concurrency: usize,

    /// Process this many tasks, then stop. `None` runs forever.
    pub max_tasks: Option<u64>,

    /// Stable identity; generated as `<hostname>-<pid>-<suffix>` when unset.
    pub worker_id: Option<String>,

    pub heartbeat_interval: Duration,

    /// Maximum lease duration requested on dequeue.
    pub visibility_timeout: Duration,

    /// Children for CPU-bound handlers; 0 disables the pool.
    pub process_pool_size: usize,

    /// Recycle a child after this many successful tasks.
    pub process_pool_max_tasks_per_child: Option<u32>,

    pub poll_empty_sleep: Duration,

    pub shutdown_grace: Duration,

    /// Worker-level retry defaults: fallback base delay, cap, jitter.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            concurrency: 10,
            max_tasks: None,
            worker_id: None,
            heartbeat_interval: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(3600),
            process_pool_size: 0,
            process_pool_max_tasks_per_child: None,
            poll_empty_sleep: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("queues must not be empty")]
    NoQueues,

    #[error("queue names must not be empty strings")]
    BlankQueueName,

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("max_tasks must be at least 1 when set")]
    ZeroMaxTasks,

    #[error("visibility_timeout must be positive")]
    ZeroVisibility,

    #[error("heartbeat_interval must be positive")]
    ZeroHeartbeat,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ConfigError::BlankQueueName);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_tasks == Some(0) {
            return Err(ConfigError::ZeroMaxTasks);
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ZeroVisibility);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        Ok(())
    }

    /// The configured id, or a generated `<hostname>-<pid>-<suffix>` that
    /// stays stable for the process lifetime (callers resolve once).
    pub fn resolve_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("{hostname}-{}-{:06x}", std::process::id(), rand::random::<u32>() & 0xff_ffff)
    }
}
