//! Consumer tier wiring: one command worker per kind over a shared store.

use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use contacts_events::{Broker, CommandKind, Topology};
use contacts_infra::{CommandConsumer, CommandWorker, ContactStore, RetryPolicy, WorkerHandle, WorkerStats};

/// Declare the topology and start a worker for every command kind.
pub async fn start<S, B>(store: S, broker: B, prefetch: u16) -> anyhow::Result<Vec<WorkerHandle>>
where
    S: ContactStore + Clone + 'static,
    B: Broker + Clone + 'static,
{
    let policy = RetryPolicy::default();
    broker
        .declare(&Topology::contacts(policy.interval))
        .await
        .context("failed to declare broker topology")?;

    let mut workers = Vec::with_capacity(CommandKind::ALL.len());
    for kind in CommandKind::ALL {
        let consumer = CommandConsumer::new(kind, store.clone(), broker.clone()).with_policy(policy);
        let handle = CommandWorker::spawn(consumer, prefetch)
            .await
            .with_context(|| format!("failed to start worker for '{}'", kind.queue()))?;
        workers.push(handle);
    }
    Ok(workers)
}

/// Shut every worker down within one shared `grace` period.
///
/// All workers are told to stop before any is awaited, so none takes a new
/// delivery while another is still finishing its in-flight command.
pub async fn shutdown(mut workers: Vec<WorkerHandle>, grace: Duration) -> Vec<(CommandKind, WorkerStats)> {
    for worker in &mut workers {
        worker.request_stop();
    }

    let deadline = Instant::now() + grace;
    let results = join_all(workers.into_iter().map(|worker| async move {
        let kind = worker.kind();
        (kind, timeout_at(deadline, worker.shutdown()).await)
    }))
    .await;

    let mut stopped = Vec::with_capacity(results.len());
    for (kind, result) in results {
        match result {
            Ok(stats) => {
                info!(
                    queue = kind.queue(),
                    acked = stats.acked,
                    retried = stats.retried,
                    failed = stats.failed,
                    rejected = stats.rejected,
                    "worker drained"
                );
                stopped.push((kind, stats));
            }
            Err(_) => warn!(queue = kind.queue(), ?grace, "worker did not stop within grace period"),
        }
    }
    stopped
}
