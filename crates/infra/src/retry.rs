//! Retry policy for failed command applies.
//!
//! The policy is a pure function of the message's attempt counter and the
//! failure class; the consumer turns its decision into broker operations.

use std::time::Duration;

use chrono::{DateTime, Utc};

use contacts_events::FailureKind;

/// Classification of a failed processing attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Malformed body or payload; never retried.
    Validation,
    /// The store rejected the command for good; never retried.
    Permanent,
    /// The store may accept the command later.
    Transient,
}

/// What to do with a message whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver at `redeliver_at` carrying attempt counter `attempt`.
    Retry {
        attempt: u32,
        redeliver_at: DateTime<Utc>,
    },
    /// Move to the failure sink.
    FailureSink { kind: FailureKind, reason: String },
}

/// Bounded redelivery with a fixed interval.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of redeliveries after the first attempt.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Whether a message that failed on `attempt` (0 = first delivery) may be
    /// delivered again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide the next step for a message that failed on `attempt`.
    pub fn decide(
        &self,
        attempt: u32,
        class: FailureClass,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let reason = reason.into();
        match class {
            FailureClass::Validation => RetryDecision::FailureSink {
                kind: FailureKind::Validation,
                reason,
            },
            FailureClass::Permanent => RetryDecision::FailureSink {
                kind: FailureKind::Permanent,
                reason,
            },
            FailureClass::Transient if self.should_retry(attempt) => RetryDecision::Retry {
                attempt: attempt + 1,
                redeliver_at: now
                    + chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::zero()),
            },
            FailureClass::Transient => RetryDecision::FailureSink {
                kind: FailureKind::RetriesExhausted,
                reason: format!("{reason} (gave up after {} attempts)", attempt + 1),
            },
        }
    }
}
