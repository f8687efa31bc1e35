//! EventSink port - イベント配信先の抽象化。
//!
//! Sinks receive every `WorkerEvent`. A sink can be local (in-process
//! callback, test capture) or remote (pub/sub channel). The `EventEmitter`
//! fans one event out to all configured sinks; a failing sink is logged and
//! skipped, it never fails the worker or reorders the stream.

use std::sync::Arc;

use crate::domain::WorkerEvent;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("event delivery failed: {0}")]
    Delivery(String),
}

/// One event destination.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &WorkerEvent) -> Result<(), SinkError>;

    /// Label used in warnings when the sink misbehaves.
    fn name(&self) -> &str {
        "sink"
    }
}

/// Fan-out to all configured sinks, in order, awaiting each.
///
/// Emission happens inline in the task that produced the event, so the
/// per-task event order is preserved end to end.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventEmitter {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub async fn emit(&self, event: WorkerEvent) {
        for sink in &self.sinks {
            if let Err(err) = sink.emit(&event).await {
                tracing::warn!(sink = sink.name(), %err, event = event.event_type(), "event sink failed");
            }
        }
    }
}
