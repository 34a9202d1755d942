//! Command producer.
//!
//! `submit` returns only after the broker has confirmed the message; a broker
//! that is unreachable or refuses the publish surfaces as `PublishError`. The
//! producer never retries or buffers on its own.

use thiserror::Error;
use tracing::{info, instrument, warn};

use contacts_core::MessageId;
use contacts_events::{Broker, BrokerError, CommandEnvelope, ContactCommand, EnvelopeError, EXCHANGE};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to publish command: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

/// Proof that a command is durably queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: MessageId,
    pub routing_key: &'static str,
}

/// Publishes contact commands to the contacts exchange.
#[derive(Debug, Clone)]
pub struct CommandPublisher<B> {
    broker: B,
}

impl<B: Broker> CommandPublisher<B> {
    pub fn new(broker: B) -> Self {
        Self { broker }
    }

    /// Wrap `command` in a fresh envelope and publish it under its kind's
    /// routing key.
    #[instrument(skip(self, command), fields(kind = %command.kind()), err)]
    pub async fn submit(&self, command: ContactCommand) -> Result<PublishReceipt, PublishError> {
        self.publish_envelope(&CommandEnvelope::new(command)).await
    }

    /// Publish an already-built envelope (replay keeps the original message id).
    pub async fn publish_envelope(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<PublishReceipt, PublishError> {
        let routing_key = envelope.kind().routing_key();
        let body = envelope.to_bytes()?;

        if let Err(e) = self.broker.publish(EXCHANGE, routing_key, &body).await {
            warn!(message_id = %envelope.message_id(), routing_key, error = %e, "publish failed");
            return Err(e.into());
        }

        info!(
            message_id = %envelope.message_id(),
            routing_key,
            attempt = envelope.attempt(),
            "command published"
        );
        Ok(PublishReceipt {
            message_id: envelope.message_id(),
            routing_key,
        })
    }
}
