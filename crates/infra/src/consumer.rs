//! Command consumer: processes one delivery end to end.
//!
//! ```text
//! Received → decode → validate → apply ─┬─ Ok ───────────────→ ack
//!                                       ├─ transient (budget) → publish to <queue>.retry, ack
//!                                       └─ otherwise ─────────→ publish to <queue>.failed, ack
//! ```
//!
//! The retry copy or failure record is always confirmed by the broker before
//! the original delivery is acknowledged. When that publish fails the original
//! is nacked with requeue, so a broker hiccup never loses a message.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use contacts_events::{
    Broker, CommandEnvelope, CommandKind, Delivery, FailedCommand, FailureKind,
};

use crate::retry::{FailureClass, RetryDecision, RetryPolicy};
use crate::store::{ApplyOutcome, ContactStore};

/// Terminal result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Applied and acknowledged.
    Acked(ApplyOutcome),
    /// Rescheduled through the delay queue with the given attempt counter.
    Retried { attempt: u32 },
    /// Recorded in the failure sink and acknowledged.
    FailureSink(FailureKind),
    /// Handed back to the broker because a publish or encode step failed.
    Requeued,
}

/// Applies the commands of one queue to the store.
#[derive(Debug, Clone)]
pub struct CommandConsumer<S, B> {
    kind: CommandKind,
    store: S,
    broker: B,
    policy: RetryPolicy,
}

impl<S, B> CommandConsumer<S, B>
where
    S: ContactStore,
    B: Broker,
{
    pub fn new(kind: CommandKind, store: S, broker: B) -> Self {
        Self {
            kind,
            store,
            broker,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Process a delivery. Every path settles the delivery exactly once.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let queue = self.kind.queue();

        let envelope = match CommandEnvelope::from_bytes(delivery.body()) {
            Ok(env) => env,
            Err(e) => {
                warn!(queue, error = %e, "undecodable message");
                return self
                    .sink(delivery, FailureKind::Validation, e.to_string(), 1)
                    .await;
            }
        };

        let attempt = envelope.attempt();
        debug!(
            queue,
            message_id = %envelope.message_id(),
            attempt,
            redelivered = delivery.redelivered(),
            "processing command"
        );

        if envelope.kind() != self.kind {
            let reason = format!(
                "'{}' command delivered to queue '{}'",
                envelope.kind(),
                queue
            );
            warn!(queue, message_id = %envelope.message_id(), %reason, "rejecting command");
            return self
                .sink(delivery, FailureKind::Validation, reason, attempt + 1)
                .await;
        }

        if let Err(e) = envelope.command().validate() {
            warn!(queue, message_id = %envelope.message_id(), error = %e, "rejecting command");
            return self
                .sink(delivery, FailureKind::Validation, e.to_string(), attempt + 1)
                .await;
        }

        let (class, reason) = match self.store.apply(envelope.command()).await {
            Ok(applied) => {
                if let Err(e) = delivery.ack().await {
                    // The store write is idempotent; a redelivery converges.
                    warn!(queue, message_id = %envelope.message_id(), error = %e, "ack failed");
                }
                info!(
                    queue,
                    message_id = %envelope.message_id(),
                    contact_id = %envelope.command().contact_id(),
                    attempt,
                    outcome = ?applied,
                    "command applied"
                );
                return Outcome::Acked(applied);
            }
            Err(e) if e.is_transient() => (FailureClass::Transient, e.to_string()),
            Err(e) => (FailureClass::Permanent, e.to_string()),
        };

        match self.policy.decide(attempt, class, reason.clone(), Utc::now()) {
            RetryDecision::Retry {
                attempt: next,
                redeliver_at,
            } => {
                let retry = envelope.rescheduled(next, reason);
                self.retry(delivery, &envelope, retry, redeliver_at).await
            }
            RetryDecision::FailureSink { kind, reason } => {
                error!(
                    queue,
                    message_id = %envelope.message_id(),
                    attempt,
                    failure = ?kind,
                    %reason,
                    "command moved to failure sink"
                );
                self.sink(delivery, kind, reason, attempt + 1).await
            }
        }
    }

    async fn retry(
        &self,
        delivery: Delivery,
        original: &CommandEnvelope,
        retry: CommandEnvelope,
        redeliver_at: chrono::DateTime<Utc>,
    ) -> Outcome {
        let queue = self.kind.queue();
        let retry_queue = self.kind.retry_queue();

        let body = match retry.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(queue, message_id = %original.message_id(), error = %e, "failed to encode retry");
                return requeue(delivery).await;
            }
        };

        if let Err(e) = self.broker.publish("", &retry_queue, &body).await {
            error!(
                queue,
                message_id = %original.message_id(),
                error = %e,
                "failed to schedule retry; requeueing original"
            );
            return requeue(delivery).await;
        }

        if let Err(e) = delivery.ack().await {
            warn!(queue, message_id = %original.message_id(), error = %e, "ack after retry failed");
        }

        warn!(
            queue,
            message_id = %original.message_id(),
            attempt = retry.attempt(),
            %redeliver_at,
            reason = retry.last_error().unwrap_or_default(),
            "command rescheduled"
        );
        Outcome::Retried {
            attempt: retry.attempt(),
        }
    }

    async fn sink(
        &self,
        delivery: Delivery,
        kind: FailureKind,
        reason: String,
        attempts: u32,
    ) -> Outcome {
        let queue = self.kind.queue();
        let failed_queue = self.kind.failed_queue();
        let record = FailedCommand::new(
            queue,
            self.kind.routing_key(),
            kind,
            reason,
            attempts,
            delivery.body(),
        );

        let body = match serde_json::to_vec(&record) {
            Ok(body) => body,
            Err(e) => {
                error!(queue, error = %e, "failed to encode failure record");
                return requeue(delivery).await;
            }
        };

        if let Err(e) = self.broker.publish("", &failed_queue, &body).await {
            error!(queue, error = %e, "failed to record failure; requeueing original");
            return requeue(delivery).await;
        }

        if let Err(e) = delivery.ack().await {
            warn!(queue, error = %e, "ack after failure sink failed");
        }
        Outcome::FailureSink(kind)
    }
}

async fn requeue(delivery: Delivery) -> Outcome {
    let queue = delivery.queue().to_string();
    if let Err(e) = delivery.nack(true).await {
        // Unsettled deliveries are redelivered once their channel closes.
        warn!(%queue, error = %e, "nack failed");
    }
    Outcome::Requeued
}
