//! Event sinks - ローカル callback、テスト用キャプチャ、in-process pub/sub。

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::domain::WorkerEvent;
use crate::ports::event_sink::{EventSink, SinkError};

/// Local sink: hands every event to an in-process callback.
pub struct CallbackSink {
    callback: Box<dyn Fn(&WorkerEvent) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&WorkerEvent) + Send + Sync + 'static) -> Self {
        Self { callback: Box::new(callback) }
    }
}

#[async_trait::async_trait]
impl EventSink for CallbackSink {
    async fn emit(&self, event: &WorkerEvent) -> Result<(), SinkError> {
        (self.callback)(event);
        Ok(())
    }

    fn name(&self) -> &str {
        "callback"
    }
}

/// Test sink that records every event for later assertions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<WorkerEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<WorkerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Event type tags in emission order, the usual thing tests assert on.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(WorkerEvent::event_type).collect()
    }
}

#[async_trait::async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: &WorkerEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// In-process pub/sub: events are serialized to JSON and published on a
/// named broadcast channel. Subscribers that fall behind lose old events
/// (broadcast semantics), which is the right trade for telemetry.
pub struct BroadcastSink {
    channel: String,
    tx: broadcast::Sender<String>,
}

impl BroadcastSink {
    pub fn new(channel: impl Into<String>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { channel: channel.into(), tx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[async_trait::async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: &WorkerEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)
            .map_err(|e| SinkError::Delivery(format!("event encode: {e}")))?;
        // no subscribers is fine; telemetry is best-effort
        let _ = self.tx.send(json);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn online() -> WorkerEvent {
        WorkerEvent::WorkerOnline { ts: Utc::now(), worker_id: "w-1".into() }
    }

    #[tokio::test]
    async fn callback_sink_invokes_the_callback() {
        let seen = Arc::new(Mutex::new(0u32));
        let sink = CallbackSink::new({
            let seen = seen.clone();
            move |_event| {
                *seen.lock().unwrap() += 1;
            }
        });
        sink.emit(&online()).await.unwrap();
        sink.emit(&online()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(&online()).await.unwrap();
        sink.emit(&WorkerEvent::WorkerOffline { ts: Utc::now(), worker_id: "w-1".into() })
            .await
            .unwrap();
        assert_eq!(sink.event_types(), ["worker_online", "worker_offline"]);
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_json_to_subscribers() {
        let sink = BroadcastSink::new("asynctasq.events", 16);
        let mut rx = sink.subscribe();

        sink.emit(&online()).await.unwrap();

        let json = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "worker_online");
        assert_eq!(sink.channel(), "asynctasq.events");
    }

    #[tokio::test]
    async fn broadcast_sink_without_subscribers_is_fine() {
        let sink = BroadcastSink::new("asynctasq.events", 16);
        sink.emit(&online()).await.unwrap();
    }
}
