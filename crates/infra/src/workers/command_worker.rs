use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use contacts_events::{Broker, BrokerError, CommandKind, FailureKind};

use crate::consumer::{CommandConsumer, Outcome};
use crate::store::ContactStore;

/// Pause after handing a delivery back, so a broker that refuses publishes is
/// not hammered with the same message.
const REQUEUE_PAUSE: Duration = Duration::from_millis(500);

/// Per-worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Applied and acknowledged.
    pub acked: u64,
    /// Rescheduled through the delay queue.
    pub retried: u64,
    /// Moved to the failure sink after a permanent error or exhausted retries.
    pub failed: u64,
    /// Moved to the failure sink as invalid.
    pub rejected: u64,
    /// Handed back to the broker.
    pub requeued: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Acked(_) => self.acked += 1,
            Outcome::Retried { .. } => self.retried += 1,
            Outcome::FailureSink(FailureKind::Validation) => self.rejected += 1,
            Outcome::FailureSink(_) => self.failed += 1,
            Outcome::Requeued => self.requeued += 1,
        }
    }
}

/// Handle to control and join a command worker.
///
/// Dropping the handle without calling `shutdown` also stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    kind: CommandKind,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Tell the worker to stop taking deliveries without waiting for it.
    ///
    /// The worker finishes the delivery it is processing, then stops. Calling
    /// this more than once has no further effect.
    pub fn request_stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// The in-flight delivery (if any) is finished; prefetched deliveries are
    /// returned to the broker. Returns the final counters.
    pub async fn shutdown(mut self) -> WorkerStats {
        self.request_stop();
        if let Err(e) = self.join.await {
            warn!(queue = self.kind.queue(), error = %e, "command worker task failed");
        }
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// One worker per command kind, consuming only that kind's queue.
#[derive(Debug)]
pub struct CommandWorker;

impl CommandWorker {
    /// Subscribe to the consumer's queue and process deliveries on a tokio task.
    ///
    /// Fails if the subscription cannot be established.
    pub async fn spawn<S, B>(
        consumer: CommandConsumer<S, B>,
        prefetch: u16,
    ) -> Result<WorkerHandle, BrokerError>
    where
        S: ContactStore + 'static,
        B: Broker + 'static,
    {
        let kind = consumer.kind();
        let subscription = consumer.broker().subscribe(kind.queue(), prefetch).await?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker_stats = stats.clone();

        info!(queue = kind.queue(), prefetch, "command worker started");

        let join = tokio::spawn(async move {
            let mut subscription = subscription;
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    delivery = subscription.recv() => delivery,
                };
                let Some(delivery) = delivery else {
                    warn!(queue = kind.queue(), "subscription ended");
                    break;
                };

                let outcome = consumer.process(delivery).await;
                if let Ok(mut s) = worker_stats.lock() {
                    s.record(&outcome);
                }
                if outcome == Outcome::Requeued {
                    tokio::time::sleep(REQUEUE_PAUSE).await;
                }
            }

            subscription.close().await;
            info!(queue = kind.queue(), "command worker stopped");
        });

        Ok(WorkerHandle {
            kind,
            shutdown: Some(shutdown_tx),
            join,
            stats,
        })
    }
}
