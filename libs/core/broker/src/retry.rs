//! Bounded redelivery of failed messages.
//!
//! `max_reconsume` is the total number of handler invocations a message may
//! receive: with `max_reconsume = 3` the handler runs at most three times and the
//! third failure abandons the message.

use crate::error::HandlerError;
use crate::message::Message;
use dashmap::DashMap;

/// What to do with a message after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver. `attempt` is the number of attempts made so far.
    Retry { attempt: u32 },
    /// Stop redelivering and acknowledge the message.
    Abandon { attempts: u32 },
}

/// Tracks attempts per message id and decides between redelivery and abandonment.
///
/// Only messages being handled are tracked. A requeued message carries its
/// attempt count in `reconsume_count`, which seeds the local count when it comes
/// back, wherever it comes back. The entry is dropped as soon as the outcome is
/// decided, so a retried message finished by another consumer leaves nothing behind.
#[derive(Debug)]
pub struct RetryPolicy {
    max_reconsume: u32,
    attempts: DashMap<String, u32>,
}

impl RetryPolicy {
    pub fn new(max_reconsume: u32) -> Self {
        Self {
            max_reconsume: max_reconsume.max(1),
            attempts: DashMap::new(),
        }
    }

    pub fn max_reconsume(&self) -> u32 {
        self.max_reconsume
    }

    /// Count one handler invocation for `message`, returning the running total.
    pub fn record_attempt(&self, message: &Message) -> u32 {
        let mut entry = self
            .attempts
            .entry(message.id.clone())
            .or_insert(message.reconsume_count);
        *entry += 1;
        *entry
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts.get(id).map(|count| *count).unwrap_or(0)
    }

    /// Whether another attempt is allowed after the ones already recorded.
    pub fn should_retry(&self, id: &str) -> bool {
        self.attempts(id) < self.max_reconsume
    }

    /// Decide the fate of `message` after `error`.
    ///
    /// Call after [`record_attempt`](Self::record_attempt). Permanent failures
    /// are abandoned regardless of the remaining budget.
    pub fn on_failure(&self, message: &Message, error: &HandlerError) -> RetryDecision {
        let attempts = self.attempts(&message.id).max(message.reconsume_count + 1);

        self.complete(&message.id);

        if error.is_retryable() && attempts < self.max_reconsume {
            RetryDecision::Retry { attempt: attempts }
        } else {
            RetryDecision::Abandon { attempts }
        }
    }

    /// Forget a message once it has succeeded or its failure was decided.
    pub fn complete(&self, id: &str) {
        self.attempts.remove(id);
    }

    /// Number of messages with attempts in flight.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
