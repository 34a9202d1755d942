//! RabbitMQ-backed broker (AMQP 0.9.1 via `lapin`).
//!
//! - **Declarations**: exchanges, queues and bindings from a `Topology`; delay
//!   queues carry `x-message-ttl` plus `x-dead-letter-exchange` /
//!   `x-dead-letter-routing-key`
//! - **Publish**: persistent (delivery mode 2), `application/json`, on a
//!   confirm-mode channel; returns once the broker acks the publish
//! - **Consume**: `basic_consume` with `basic_qos(prefetch)`, forwarded into a
//!   bounded channel
//!
//! ## Channels
//!
//! One connection is shared and re-established lazily when it drops. Every
//! call opens its own channel; a subscription owns its channel until it is
//! closed, at which point unacknowledged deliveries are requeued by the broker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};

use contacts_events::{
    Acknowledger, Broker, BrokerError, Delivery, ExchangeKind, QueueSpec, Subscription, Topology,
};

const CONNECTION_NAME: &str = "contacts-pipeline";

#[derive(Debug)]
pub struct RabbitMqBroker {
    url: String,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl RabbitMqBroker {
    /// Create a broker for `url`. No connection is made until first use.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: Mutex::new(None),
        }
    }

    /// Create a broker and verify the broker is reachable.
    pub async fn connect(url: impl Into<String>) -> Result<Self, BrokerError> {
        let broker = Self::new(url);
        broker.open_channel().await?.close(200, "OK").await.ok();
        Ok(broker)
    }

    async fn open_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return conn
                    .create_channel()
                    .await
                    .map_err(|e| map_lapin_error("create_channel", e));
            }
            warn!("rabbitmq connection lost, reconnecting");
        }

        let conn = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("RabbitMQ connection failed: {}", e)))?;
        let conn = Arc::new(conn);
        *guard = Some(conn.clone());

        conn.create_channel()
            .await
            .map_err(|e| map_lapin_error("create_channel", e))
    }

    async fn declare_queue(channel: &Channel, queue: &QueueSpec) -> Result<(), BrokerError> {
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await
            .map_err(|e| map_lapin_error(&format!("queue_declare '{}'", queue.name), e))?;
        Ok(())
    }
}

fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = queue.message_ttl {
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX)),
        );
    }
    if let Some(target) = &queue.dead_letter {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(target.exchange.as_str().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(target.routing_key.as_str().into()),
        );
    }
    args
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

/// Map lapin errors by the AMQP reply text they carry.
fn map_lapin_error(operation: &str, err: lapin::Error) -> BrokerError {
    let text = err.to_string();
    if text.contains("PRECONDITION_FAILED") || text.contains("406") {
        BrokerError::PreconditionFailed(format!("{}: {}", operation, text))
    } else if text.contains("NOT_FOUND") || text.contains("404") {
        BrokerError::NotFound(format!("{}: {}", operation, text))
    } else {
        BrokerError::Connection(format!("{}: {}", operation, text))
    }
}

/// Settles one lapin delivery. For `get` deliveries it also owns the channel
/// the message was fetched on and closes it once settled.
struct LapinAcker {
    acker: Acker,
    channel: Option<Channel>,
}

impl LapinAcker {
    async fn release(&self) {
        if let Some(channel) = &self.channel {
            let _ = channel.close(200, "OK").await;
        }
    }
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let result = self
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(format!("ack failed: {}", e)));
        self.release().await;
        result
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let result = self
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(format!("nack failed: {}", e)));
        self.release().await;
        result
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    #[instrument(skip(self, topology), fields(queues = topology.queues.len()), err)]
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let channel = self.open_channel().await?;

        for exchange in &topology.exchanges {
            channel
                .exchange_declare(
                    &exchange.name,
                    exchange_kind(exchange.kind),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| map_lapin_error(&format!("exchange_declare '{}'", exchange.name), e))?;
        }

        for queue in &topology.queues {
            Self::declare_queue(&channel, queue).await?;
        }

        for binding in &topology.bindings {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| map_lapin_error(&format!("queue_bind '{}'", binding.queue), e))?;
        }

        let _ = channel.close(200, "OK").await;
        debug!(
            exchanges = topology.exchanges.len(),
            bindings = topology.bindings.len(),
            "topology declared"
        );
        Ok(())
    }

    #[instrument(skip(self, body), fields(body_len = body.len()), err)]
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let channel = self.open_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_lapin_error("confirm_select", e))?;

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| map_lapin_error("basic_publish", e))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::NotConfirmed(format!("publish confirmation failed: {}", e)));
        let _ = channel.close(200, "OK").await;

        match confirmation? {
            Confirmation::Nack(_) => Err(BrokerError::NotConfirmed(format!(
                "broker nacked publish to '{}' / '{}'",
                exchange, routing_key
            ))),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self), err)]
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        let channel = self.open_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| map_lapin_error("basic_qos", e))?;

        let mut consumer = channel
            .basic_consume(
                queue,
                &format!("{}-{}", CONNECTION_NAME, queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_lapin_error(&format!("basic_consume '{}'", queue), e))?;

        let (tx, rx) = mpsc::channel::<Delivery>(usize::from(prefetch.max(1)));
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = consumer.next() => match next {
                        Some(Ok(d)) => {
                            let delivery = Delivery::new(
                                queue_name.clone(),
                                d.data,
                                d.redelivered,
                                Box::new(LapinAcker { acker: d.acker, channel: None }),
                            );
                            if tx.send(delivery).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(queue = %queue_name, error = %e, "rabbitmq consumer failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            // Closing the channel requeues whatever was delivered but not acked.
            let _ = channel.close(200, "OK").await;
            debug!(queue = %queue_name, "rabbitmq subscription closed");
        });

        Ok(Subscription::new(queue, rx))
    }

    #[instrument(skip(self), err)]
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let channel = self.open_channel().await?;
        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| map_lapin_error(&format!("basic_get '{}'", queue), e))?;

        match message {
            Some(message) => {
                let d = message.delivery;
                Ok(Some(Delivery::new(
                    queue,
                    d.data,
                    d.redelivered,
                    Box::new(LapinAcker {
                        acker: d.acker,
                        channel: Some(channel),
                    }),
                )))
            }
            None => {
                let _ = channel.close(200, "OK").await;
                Ok(None)
            }
        }
    }
}
