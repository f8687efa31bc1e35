//! Broker port - キューバックエンドの抽象化。
//!
//! Every backend adapter (in-memory, Redis, SQL table, AMQP, cloud queue)
//! implements this contract. The worker never sees connection handles or
//! wire formats; it sees envelopes, receipts and capability flags.
//!
//! # Lease authority
//! `dequeue` atomically marks envelopes invisible for the lease duration.
//! The broker is the lease authority: a worker that crashes simply never
//! issues a terminal operation and the envelope reappears after
//! `visibility_deadline`.
//!
//! # Attempt counting
//! Adapters that count deliveries broker-side stamp `attempt` at dequeue
//! (the in-memory adapter does). Adapters that cannot must re-encode the
//! incremented attempt when they requeue on nack, and say so in their docs.

use std::future::Future;
use std::time::Duration;

use crate::domain::{Receipt, TaskEnvelope, TaskError};

/// What a backend can and cannot do natively.
///
/// The worker adapts: without `supports_dead_letter` terminal failures are
/// acked-and-dropped (with a terminal event); without `supports_extend` the
/// lease renewer stays inert and execution is bounded by the remaining
/// visibility; without `native_delay_scheduling` the adapter emulates
/// delayed availability however it can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerCapabilities {
    pub supports_dead_letter: bool,
    pub supports_extend: bool,
    pub native_delay_scheduling: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Network blip, lock conflict. Worth retrying at the call site.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Auth failure, missing queue. The worker should drain.
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// The lease behind a receipt is gone; stop working on that envelope.
    #[error("lease expired")]
    LeaseExpired,

    /// The adapter does not implement this operation.
    #[error("operation not supported by this broker: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// The adapter contract.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Pull up to `max` envelopes, preferring earlier queues in `queues`
    /// when work is concurrently available, atomically leasing each for
    /// `lease`. Non-blocking or short-blocking (<= 1 s); may return fewer
    /// than `max`, including none.
    async fn dequeue(
        &self,
        queues: &[String],
        max: usize,
        lease: Duration,
    ) -> Result<Vec<TaskEnvelope>, BrokerError>;

    /// Mark terminally complete. Idempotent: acking an already-settled or
    /// expired receipt is a no-op, not an error.
    async fn ack(&self, receipt: &Receipt) -> Result<(), BrokerError>;

    /// Return to the source queue, available again at `now + requeue_delay`.
    async fn nack(&self, receipt: &Receipt, requeue_delay: Duration) -> Result<(), BrokerError>;

    /// Push the visibility deadline forward by `additional`. Failing with
    /// `LeaseExpired` is a non-fatal signal: the worker must stop processing
    /// that envelope and must not ack it.
    async fn extend(&self, receipt: &Receipt, additional: Duration) -> Result<(), BrokerError>;

    /// Terminal; the envelope becomes visible only on the dead-letter
    /// queue. Adapters without a native DLQ may synthesize one or return
    /// `Unsupported`.
    async fn move_to_dead_letter(
        &self,
        receipt: &Receipt,
        failure: &TaskError,
    ) -> Result<(), BrokerError>;

    fn capabilities(&self) -> BrokerCapabilities;
}

/// Retry a broker call on transient errors: exponential backoff starting at
/// 100 ms, at most 5 attempts. Anything non-transient (and the final
/// transient failure) is returned to the caller.
pub async fn call_with_retry<T, F, Fut>(mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(%err, attempt, "transient broker error, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            other => return other,
        }
    }
    unreachable!("loop returns on the last attempt")
}
