//! In-memory broker for tests/dev.
//!
//! Implements the subset of AMQP semantics the pipeline relies on:
//! - direct exchanges (exact routing-key match) and the default exchange
//! - durable queues with ack/nack and requeue-at-head
//! - per-queue TTL with dead-lettering (delay queues)
//! - idempotent declarations; conflicting redeclaration is rejected

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::bus::{Acknowledger, Broker, BrokerError, Delivery, Subscription};
use crate::topology::{BindingSpec, DeadLetterTarget, ExchangeSpec, QueueSpec, Topology};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeSpec>,
    bindings: HashSet<BindingSpec>,
    queues: HashMap<String, QueueState>,
    next_id: u64,
    unroutable: u64,
    unreachable: bool,
}

/// A message that must move to its dead-letter target once its TTL elapses.
struct Expiry {
    queue: String,
    id: u64,
    ttl: std::time::Duration,
}

impl Inner {
    /// Route a message and return the expiries the caller must schedule.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<Vec<Expiry>, BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: routing key is the queue name.
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                vec![]
            }
        } else {
            if !self.exchanges.contains_key(exchange) {
                return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
            }
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            self.unroutable += 1;
            debug!(exchange, routing_key, "unroutable message dropped");
            return Ok(vec![]);
        }

        let mut expiries = Vec::new();
        for queue in targets {
            self.next_id += 1;
            let id = self.next_id;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(StoredMessage {
                    id,
                    body: body.to_vec(),
                    redelivered: false,
                });
                q.notify.notify_one();
                if let (Some(ttl), Some(_)) = (q.spec.message_ttl, &q.spec.dead_letter) {
                    expiries.push(Expiry { queue, id, ttl });
                }
            }
        }
        Ok(expiries)
    }
}

/// In-memory direct-exchange broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        self.inner
            .lock()
            .map_err(|_| BrokerError::Connection("in-memory broker state poisoned".to_string()))
    }

    fn lock_reachable(&self) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        let inner = self.lock()?;
        if inner.unreachable {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        Ok(inner)
    }

    /// Simulate the broker going away (publish/declare/subscribe/get fail).
    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unreachable = !reachable;
        }
    }

    /// Messages ready for delivery in `queue` (excludes unacknowledged ones).
    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Deliveries of `queue` handed out but not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.queues.get(queue).map(|q| q.unacked.len()))
            .unwrap_or(0)
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner
                    .queues
                    .get(queue)
                    .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// Number of messages dropped because no binding matched.
    pub fn unroutable(&self) -> u64 {
        self.inner.lock().map(|inner| inner.unroutable).unwrap_or(0)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.queues.contains_key(queue))
            .unwrap_or(false)
    }

    pub fn binding_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.bindings.len()).unwrap_or(0)
    }

    fn schedule(&self, expiries: Vec<Expiry>) {
        for expiry in expiries {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(expiry.ttl).await;
                broker.expire(&expiry.queue, expiry.id);
            });
        }
    }

    /// Move an expired message to its queue's dead-letter target.
    fn expire(&self, queue: &str, id: u64) {
        let expiries = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let Some(q) = inner.queues.get_mut(queue) else {
                return;
            };
            let Some(pos) = q.ready.iter().position(|m| m.id == id) else {
                // Already consumed.
                return;
            };
            let Some(message) = q.ready.remove(pos) else {
                return;
            };
            let Some(DeadLetterTarget { exchange, routing_key }) = q.spec.dead_letter.clone() else {
                return;
            };
            debug!(queue, %exchange, %routing_key, "message expired, dead-lettering");
            inner
                .route(&exchange, &routing_key, &message.body)
                .unwrap_or_default()
        };
        self.schedule(expiries);
    }

    fn take_next(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut inner = self.lock()?;
        let q = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;

        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };
        let delivery = Delivery::new(
            queue,
            message.body.clone(),
            message.redelivered,
            Box::new(InMemoryAcker {
                broker: self.clone(),
                queue: queue.to_string(),
                id: message.id,
                settled: AtomicBool::new(false),
            }),
        );
        q.unacked.insert(message.id, message);
        Ok(Some(delivery))
    }

    fn settle(&self, queue: &str, id: u64, requeue: Option<bool>) -> Result<(), BrokerError> {
        let expiries = {
            let mut inner = self.lock()?;
            let q = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
            let mut message = q
                .unacked
                .remove(&id)
                .ok_or_else(|| BrokerError::Ack(format!("unknown delivery {id} on '{queue}'")))?;

            match requeue {
                // ack
                None => return Ok(()),
                Some(true) => {
                    // Back to its original position relative to the ready messages.
                    message.redelivered = true;
                    let pos = q
                        .ready
                        .iter()
                        .position(|m| m.id > message.id)
                        .unwrap_or(q.ready.len());
                    q.ready.insert(pos, message);
                    q.notify.notify_one();
                    return Ok(());
                }
                Some(false) => match q.spec.dead_letter.clone() {
                    Some(target) => inner.route(&target.exchange, &target.routing_key, &message.body)?,
                    None => return Ok(()),
                },
            }
        };
        self.schedule(expiries);
        Ok(())
    }

    /// Feed deliveries of `queue` into `tx` until the subscriber goes away.
    async fn forward(self, queue: String, notify: Arc<Notify>, tx: mpsc::Sender<Delivery>) {
        loop {
            let Ok(permit) = tx.reserve().await else {
                return;
            };
            loop {
                let notified = notify.notified();
                match self.take_next(&queue) {
                    Ok(Some(delivery)) => {
                        permit.send(delivery);
                        break;
                    }
                    Ok(None) => {}
                    Err(_) => return,
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tx.closed() => return,
                }
            }
        }
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    id: u64,
    settled: AtomicBool,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        self.broker.settle(&self.queue, self.id, requeue)?;
        self.settled.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}

impl Drop for InMemoryAcker {
    /// An unsettled delivery that is dropped goes back to its queue, like an
    /// unacknowledged message on a closed AMQP channel.
    fn drop(&mut self) {
        if !self.settled.load(Ordering::Acquire) {
            let _ = self.broker.settle(&self.queue, self.id, Some(true));
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut inner = self.lock_reachable()?;

        for exchange in &topology.exchanges {
            match inner.exchanges.get(&exchange.name) {
                Some(existing) if existing != exchange => {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "exchange '{}' redeclared with different arguments",
                        exchange.name
                    )));
                }
                Some(_) => {}
                None => {
                    inner.exchanges.insert(exchange.name.clone(), exchange.clone());
                }
            }
        }

        for queue in &topology.queues {
            match inner.queues.get(&queue.name) {
                Some(existing) if existing.spec != *queue => {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "queue '{}' redeclared with different arguments",
                        queue.name
                    )));
                }
                Some(_) => {}
                None => {
                    inner
                        .queues
                        .insert(queue.name.clone(), QueueState::new(queue.clone()));
                }
            }
        }

        for binding in &topology.bindings {
            if !inner.exchanges.contains_key(&binding.exchange) {
                return Err(BrokerError::NotFound(format!("exchange '{}'", binding.exchange)));
            }
            if !inner.queues.contains_key(&binding.queue) {
                return Err(BrokerError::NotFound(format!("queue '{}'", binding.queue)));
            }
            inner.bindings.insert(binding.clone());
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let expiries = self.lock_reachable()?.route(exchange, routing_key, body)?;
        self.schedule(expiries);
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        let notify = {
            let inner = self.lock_reachable()?;
            inner
                .queues
                .get(queue)
                .map(|q| q.notify.clone())
                .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?
        };

        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        tokio::spawn(self.clone().forward(queue.to_string(), notify, tx));

        Ok(Subscription::new(queue, rx))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        drop(self.lock_reachable()?);
        self.take_next(queue)
    }
}
