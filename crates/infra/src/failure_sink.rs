//! Failure sink replay.
//!
//! Records stay in `<queue>.failed` until an operator replays them. Replay
//! republishes the original envelope with a fresh retry budget; records whose
//! body no longer decodes are put back untouched.

use tracing::{info, warn};

use contacts_events::{Broker, BrokerError, CommandEnvelope, CommandKind, Delivery, FailedCommand, EXCHANGE};

/// Result of a replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Envelopes republished to the exchange.
    pub replayed: usize,
    /// Records left in the sink because they could not be decoded.
    pub kept: usize,
}

/// Replay up to `limit` records from `kind`'s failure sink.
pub async fn replay_failed<B: Broker>(
    broker: &B,
    kind: CommandKind,
    limit: usize,
) -> Result<ReplayReport, BrokerError> {
    let failed_queue = kind.failed_queue();
    let mut report = ReplayReport::default();
    // Held unsettled until the end so `get` does not hand them out again.
    let mut keep: Vec<Delivery> = Vec::new();

    let result = async {
        while report.replayed + keep.len() < limit {
            let Some(delivery) = broker.get(&failed_queue).await? else {
                break;
            };

            let envelope = serde_json::from_slice::<FailedCommand>(delivery.body())
                .map_err(|e| e.to_string())
                .and_then(|record| record.body_bytes().map_err(|e| e.to_string()))
                .and_then(|body| CommandEnvelope::from_bytes(&body).map_err(|e| e.to_string()))
                .and_then(|env| {
                    if env.kind() == kind {
                        Ok(env)
                    } else {
                        Err(format!("'{}' envelope in '{}'", env.kind(), failed_queue))
                    }
                });

            let envelope = match envelope {
                Ok(env) => env.replayed(),
                Err(reason) => {
                    warn!(queue = %failed_queue, %reason, "failure record cannot be replayed");
                    keep.push(delivery);
                    continue;
                }
            };

            let body = match envelope.to_bytes() {
                Ok(body) => body,
                Err(e) => {
                    warn!(queue = %failed_queue, error = %e, "failed to encode replayed envelope");
                    keep.push(delivery);
                    continue;
                }
            };

            if let Err(e) = broker.publish(EXCHANGE, kind.routing_key(), &body).await {
                keep.push(delivery);
                return Err(e);
            }
            delivery.ack().await?;
            report.replayed += 1;
            info!(
                queue = %failed_queue,
                message_id = %envelope.message_id(),
                "failure record replayed"
            );
        }
        Ok::<(), BrokerError>(())
    }
    .await;

    report.kept = keep.len();
    for delivery in keep {
        if let Err(e) = delivery.nack(true).await {
            warn!(queue = %failed_queue, error = %e, "failed to return record to sink");
        }
    }

    result.map(|()| report)
}
