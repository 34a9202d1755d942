//! Broker abstraction (mechanics only).
//!
//! This module provides the **command bus pattern** used by the contact pipeline: a
//! producer publishes to an exchange under a routing key, the broker routes the
//! message to the bound queue, and one consumer per queue acknowledges or
//! rejects each delivery.
//!
//! ## Design Philosophy
//!
//! The broker contract is intentionally **small** and mirrors AMQP 0.9.1:
//!
//! - **Exchange + routing key publish**: the default exchange (`""`) routes by
//!   queue name, so "send to queue X" is `publish("", "X", body)`
//! - **At-least-once delivery**: a delivery that is not acknowledged is
//!   redelivered; consumers must be idempotent
//! - **Explicit acknowledgement**: every `Delivery` ends in exactly one `ack` or
//!   `nack`; both consume the delivery, so double acknowledgement does not
//!   type-check
//! - **Confirmed publish**: `publish` returns only once the broker has taken
//!   responsibility for the message

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::topology::Topology;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker could not be reached (or the connection dropped).
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A declaration conflicted with an existing entity (AMQP 406).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A referenced exchange or queue does not exist (AMQP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The broker refused to take responsibility for a published message.
    #[error("publish not confirmed: {0}")]
    NotConfirmed(String),

    /// Acknowledging a delivery failed (usually because its channel closed).
    #[error("acknowledgement failed: {0}")]
    Ack(String),
}

/// Settles a single delivery with the broker.
///
/// Implementations are per-delivery handles; `Delivery` guarantees each one is
/// used at most once.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, awaiting settlement.
pub struct Delivery {
    queue: String,
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            body,
            redelivered,
            acker,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker delivered this message before (and it was not acked).
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Remove the message from its queue.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the message; with `requeue` it goes back to the head of its queue.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A consumer's view of one queue.
///
/// Broker implementations forward deliveries into a bounded channel (sized by
/// the prefetch count). Dropping the subscription stops delivery; use `close`
/// to also hand back deliveries that were buffered but never processed.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut sub = broker.subscribe("add-contact", 16).await?;
/// while let Some(delivery) = sub.recv().await {
///     handle(delivery).await;
/// }
/// sub.close().await;
/// ```
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            receiver,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery. `None` once the broker side has gone away.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Wait for up to `timeout` for the next delivery.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stop receiving and return buffered deliveries to the broker.
    ///
    /// Each buffered delivery is nacked with requeue, so nothing prefetched by
    /// this subscription is lost.
    pub async fn close(mut self) {
        self.receiver.close();
        while let Some(delivery) = self.receiver.recv().await {
            if let Err(e) = delivery.nack(true).await {
                warn!(queue = %self.queue, error = %e, "failed to requeue buffered delivery");
            }
        }
    }
}

/// Durable message broker (publish/subscribe with explicit acknowledgement).
///
/// ## Architecture Role
///
/// ```text
/// Producer → publish(exchange, routing_key) → Broker → queue → Subscription → Consumer
///                                                                               ├─ ack
///                                                                               └─ nack / retry / failure sink
/// ```
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; one broker handle is shared by the
/// producer and every worker. Implementations acquire whatever per-call
/// resources they need (e.g. an AMQP channel) inside each method.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchanges, queues and bindings. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Publish `body` to `exchange` under `routing_key`, waiting for the broker
    /// to confirm. Unroutable messages are dropped by the exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Start consuming `queue`, with at most `prefetch` unacknowledged deliveries.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError>;

    /// Fetch a single message without subscribing (`None` when the queue is empty).
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;
}

#[async_trait]
impl<B> Broker for std::sync::Arc<B>
where
    B: Broker + ?Sized,
{
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        (**self).declare(topology).await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        (**self).publish(exchange, routing_key, body).await
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        (**self).subscribe(queue, prefetch).await
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        (**self).get(queue).await
    }
}
