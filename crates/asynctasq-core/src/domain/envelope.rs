//! TaskEnvelope - 配送の“運搬用”データ。
//!
//! One envelope is one *delivery* of a task: payload plus everything the
//! worker needs to run it, retry it, and acknowledge it. The broker stamps
//! `attempt`, `visibility_deadline` and `receipt` at dequeue time.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{Receipt, TaskId, TaskName};
use super::retry::RetryStrategy;

/// The on-the-wire unit of work.
///
/// Invariants while the envelope is live on a worker:
/// - `attempt >= 1` and `attempt <= max_attempts`
/// - `visibility_deadline > now` (the lease is held)
/// - `receipt` is valid until the first ack/nack/dead-letter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub task_name: TaskName,

    /// Source queue this delivery came from.
    pub queue: String,

    /// Opaque payload; the serializer decodes it into call arguments.
    pub payload: Vec<u8>,

    /// 1-based count of prior + current delivery attempts.
    pub attempt: u32,
    pub max_attempts: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Earliest wall time the broker may hand this envelope out.
    pub available_at: DateTime<Utc>,

    /// Wall time after which the broker may redeliver (lease expiry).
    pub visibility_deadline: DateTime<Utc>,

    /// Per-task wall-clock execution limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    pub retry_strategy: RetryStrategy,
    pub retry_delay_base: Duration,

    /// Small key/value map (trace ids, priority hints).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Broker handle for ack/nack/extend. Never on the wire; the adapter
    /// that dequeued the envelope is the only party that can interpret it.
    #[serde(skip)]
    pub receipt: Receipt,
}

impl TaskEnvelope {
    /// Create an envelope ready for enqueue, with library defaults for the
    /// policy fields. Producers normally go through `typed::make_envelope`.
    pub fn new(task_name: TaskName, queue: impl Into<String>, payload: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            task_name,
            queue: queue.into(),
            payload,
            attempt: 1,
            max_attempts: 3,
            enqueued_at: now,
            available_at: now,
            visibility_deadline: now,
            timeout: None,
            retry_strategy: RetryStrategy::Exponential,
            retry_delay_base: Duration::from_secs(60),
            headers: HashMap::new(),
            receipt: Receipt::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, strategy: RetryStrategy, delay_base: Duration) -> Self {
        self.retry_strategy = strategy;
        self.retry_delay_base = delay_base;
        self
    }

    pub fn with_available_at(mut self, available_at: DateTime<Utc>) -> Self {
        self.available_at = available_at;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// How much of the lease is left, saturating at zero.
    pub fn remaining_visibility(&self, now: DateTime<Utc>) -> Duration {
        (self.visibility_deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Has every allowed attempt been used up by this delivery?
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskEnvelope {
        TaskEnvelope::new(
            TaskName::new("demo.add"),
            "default",
            b"{}".to_vec(),
            Utc::now(),
        )
    }

    #[test]
    fn remaining_visibility_saturates_at_zero() {
        let mut env = sample();
        let now = Utc::now();
        env.visibility_deadline = now - chrono::TimeDelta::seconds(5);
        assert_eq!(env.remaining_visibility(now), Duration::ZERO);

        env.visibility_deadline = now + chrono::TimeDelta::seconds(30);
        let remaining = env.remaining_visibility(now);
        assert!(remaining > Duration::from_secs(29));
        assert!(remaining <= Duration::from_secs(30));
    }

    #[test]
    fn attempts_exhausted_is_inclusive() {
        let mut env = sample().with_max_attempts(2);
        env.attempt = 1;
        assert!(!env.attempts_exhausted());
        env.attempt = 2;
        assert!(env.attempts_exhausted());
    }

    #[test]
    fn receipt_never_serializes() {
        let mut env = sample();
        env.receipt = Receipt::new("r-7");
        let wire = serde_json::to_string(&env).unwrap();
        assert!(!wire.contains("r-7"));

        let back: TaskEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.receipt, Receipt::default());
        assert_eq!(back.id, env.id);
        assert_eq!(back.task_name, env.task_name);
    }
}
