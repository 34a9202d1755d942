//! Broker topology description.
//!
//! A `Topology` is plain data: brokers turn it into exchange/queue/binding
//! declarations. Declaring the same topology twice must be a no-op.

use std::time::Duration;

use crate::command::{CommandKind, EXCHANGE};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key exactly.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Where a queue sends messages that expire (or are rejected without requeue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Per-queue message TTL. Combined with `dead_letter` this turns the queue
    /// into a delay line.
    pub message_ttl: Option<Duration>,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            dead_letter: None,
        }
    }

    /// A durable queue that holds each message for `delay`, then re-publishes it
    /// to `exchange` under `routing_key`.
    pub fn delay(
        name: impl Into<String>,
        delay: Duration,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: Some(delay),
            dead_letter: Some(DeadLetterTarget {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// The contact command topology.
    ///
    /// - one durable direct exchange (`tech.challenge.direct`)
    /// - per kind: the command queue bound with its exact routing key, a delay
    ///   queue feeding back into the exchange after `retry_interval`, and a
    ///   failure sink
    pub fn contacts(retry_interval: Duration) -> Self {
        let mut topology = Topology {
            exchanges: vec![ExchangeSpec {
                name: EXCHANGE.to_string(),
                kind: ExchangeKind::Direct,
                durable: true,
            }],
            ..Default::default()
        };

        for kind in CommandKind::ALL {
            topology.queues.push(QueueSpec::durable(kind.queue()));
            topology.queues.push(QueueSpec::delay(
                kind.retry_queue(),
                retry_interval,
                EXCHANGE,
                kind.routing_key(),
            ));
            topology.queues.push(QueueSpec::durable(kind.failed_queue()));
            topology.bindings.push(BindingSpec {
                queue: kind.queue().to_string(),
                exchange: EXCHANGE.to_string(),
                routing_key: kind.routing_key().to_string(),
            });
        }

        topology
    }
}
