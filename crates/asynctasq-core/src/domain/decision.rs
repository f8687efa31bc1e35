//! Decision model: what to do with an envelope after an attempt.
//!
//! Deciders are pure functions: given the envelope and the attempt's
//! outcome they return the next action without side effects. Executing the
//! decision (the actual ack/nack/dead-letter call) is the dispatcher's job,
//! which also handles the broker-capability fallbacks.

use std::time::Duration;

use super::envelope::TaskEnvelope;
use super::outcome::TaskOutcome;
use super::retry::RetryPolicy;

/// Terminal disposition of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Done; remove from the queue.
    Ack,

    /// Return to the source queue, available again after `delay`.
    Retry { delay: Duration },

    /// Give up; park on the dead-letter queue.
    DeadLetter,
}

/// Maps (envelope, outcome) to a `Decision`.
pub trait Decider: Send + Sync {
    fn decide(&self, envelope: &TaskEnvelope, outcome: &TaskOutcome) -> Decision;
}

/// The stock decider.
///
/// - Success acks.
/// - Retriable failures retry while `attempt < max_attempts`, with the delay
///   computed from the envelope's own strategy/base and this decider's cap.
/// - Non-retriable failures (serialization, unknown task, explicit
///   do-not-retry) dead-letter immediately, whatever the attempt count.
/// - Cancellation retries with zero delay so the broker redelivers promptly
///   once a worker is back.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    /// Worker-level retry defaults: cap, jitter, and the fallback base for
    /// envelopes enqueued without an explicit delay.
    pub fallback: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(fallback: RetryPolicy) -> Self {
        Self { fallback }
    }

    fn policy_for(&self, envelope: &TaskEnvelope) -> RetryPolicy {
        let base_delay = if envelope.retry_delay_base.is_zero() {
            self.fallback.base_delay
        } else {
            envelope.retry_delay_base
        };
        RetryPolicy {
            strategy: envelope.retry_strategy,
            base_delay,
            max_delay: self.fallback.max_delay,
            jitter: self.fallback.jitter,
        }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, envelope: &TaskEnvelope, outcome: &TaskOutcome) -> Decision {
        let Some(error) = outcome.error() else {
            return Decision::Ack;
        };

        use super::outcome::ErrorKind;
        match error.kind {
            ErrorKind::Cancelled => return Decision::Retry { delay: Duration::ZERO },
            // The lease is gone: there is nothing left to ack or nack.
            // Reaching a decider with this kind is a dispatcher bug, but the
            // safe answer is to let the broker redeliver.
            ErrorKind::LeaseLost => return Decision::Retry { delay: Duration::ZERO },
            _ => {}
        }

        if !error.is_retriable() || envelope.attempts_exhausted() {
            Decision::DeadLetter
        } else {
            let delay = self.policy_for(envelope).next_delay(envelope.attempt);
            Decision::Retry { delay }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TaskName;
    use crate::domain::outcome::TaskError;
    use crate::domain::retry::RetryStrategy;
    use chrono::Utc;
    use rstest::rstest;

    fn envelope(attempt: u32, max_attempts: u32) -> TaskEnvelope {
        let mut env = TaskEnvelope::new(TaskName::new("t"), "default", vec![], Utc::now())
            .with_max_attempts(max_attempts)
            .with_retry(RetryStrategy::Exponential, Duration::from_secs(1));
        env.attempt = attempt;
        env
    }

    #[test]
    fn success_acks() {
        let decider = DefaultDecider::default();
        let d = decider.decide(&envelope(1, 3), &TaskOutcome::success(vec![]));
        assert_eq!(d, Decision::Ack);
    }

    #[rstest]
    #[case::first_of_three(1, 3, Duration::from_secs(1))]
    #[case::second_of_three(2, 3, Duration::from_secs(2))]
    fn retriable_failure_below_cap_retries(
        #[case] attempt: u32,
        #[case] max: u32,
        #[case] expected: Duration,
    ) {
        let decider = DefaultDecider::default();
        let outcome = TaskOutcome::failure(TaskError::user("boom"));
        assert_eq!(
            decider.decide(&envelope(attempt, max), &outcome),
            Decision::Retry { delay: expected }
        );
    }

    #[test]
    fn exhausted_attempts_dead_letter() {
        let decider = DefaultDecider::default();
        let outcome = TaskOutcome::failure(TaskError::user("boom"));
        assert_eq!(decider.decide(&envelope(3, 3), &outcome), Decision::DeadLetter);
    }

    #[test]
    fn timeout_is_retriable_like_a_failure() {
        let decider = DefaultDecider::default();
        assert_eq!(
            decider.decide(&envelope(1, 3), &TaskOutcome::Timeout),
            Decision::Retry { delay: Duration::from_secs(1) }
        );
        assert_eq!(decider.decide(&envelope(3, 3), &TaskOutcome::Timeout), Decision::DeadLetter);
    }

    #[rstest]
    #[case::serialization(TaskError::serialization("bad payload"))]
    #[case::unknown(TaskError::unknown_task("nope"))]
    #[case::opt_out(TaskError::do_not_retry("told you so"))]
    fn non_retriable_dead_letters_regardless_of_attempts(#[case] error: TaskError) {
        let decider = DefaultDecider::default();
        let outcome = TaskOutcome::failure(error);
        assert_eq!(decider.decide(&envelope(1, 5), &outcome), Decision::DeadLetter);
    }

    #[test]
    fn cancellation_requeues_immediately() {
        let decider = DefaultDecider::default();
        let outcome = TaskOutcome::failure(TaskError::cancelled("shutdown"));
        assert_eq!(
            decider.decide(&envelope(1, 3), &outcome),
            Decision::Retry { delay: Duration::ZERO }
        );
    }

    #[test]
    fn zero_base_delay_falls_back_to_worker_default() {
        let decider = DefaultDecider::new(RetryPolicy {
            base_delay: Duration::from_secs(7),
            ..RetryPolicy::default()
        });
        let mut env = envelope(1, 3);
        env.retry_delay_base = Duration::ZERO;
        let outcome = TaskOutcome::failure(TaskError::user("boom"));
        assert_eq!(
            decider.decide(&env, &outcome),
            Decision::Retry { delay: Duration::from_secs(7) }
        );
    }
}
