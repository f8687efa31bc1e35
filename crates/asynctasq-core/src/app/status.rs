//! Worker counters for heartbeats and status queries.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Mutated from the poller and dispatch tasks, read by the heartbeat.
#[derive(Debug, Default)]
pub struct WorkerStats {
    started: AtomicU64,
    failed: AtomicU64,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time view, serialized into `worker_heartbeat` events.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub in_flight: usize,
    pub started_total: u64,
    pub failed_total: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self, at: DateTime<Utc>) {
        let mut slot = self.last_poll_at.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(at);
    }

    pub fn started_total(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, in_flight: usize) -> StatsSnapshot {
        StatsSnapshot {
            in_flight,
            started_total: self.started.load(Ordering::Relaxed),
            failed_total: self.failed.load(Ordering::Relaxed),
            last_poll_at: *self
                .last_poll_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = WorkerStats::default();
        stats.record_started();
        stats.record_started();
        stats.record_failed();

        let snap = stats.snapshot(1);
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.started_total, 2);
        assert_eq!(snap.failed_total, 1);
        assert!(snap.last_poll_at.is_none());

        let now = Utc::now();
        stats.record_poll(now);
        assert_eq!(stats.snapshot(0).last_poll_at, Some(now));
    }
}
