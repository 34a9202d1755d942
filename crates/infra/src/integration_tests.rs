//! Integration tests for the full command pipeline.
//!
//! Tests: Producer → Broker (direct exchange) → CommandWorker → Store
//!
//! Verifies:
//! - Add/Edit/Delete converge under redelivery
//! - Permanent failures land in the failure sink without touching the store
//! - Transient failures are retried 3 times, 5s apart, then sunk
//! - Routing keys never cross queues
//! - Graceful shutdown loses nothing

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use contacts_core::{Contact, ContactId, State, StateId};
    use contacts_events::{
        Broker, CommandEnvelope, CommandKind, ContactCommand, FailedCommand, FailureKind,
        InMemoryBroker, Topology,
    };

    use crate::consumer::CommandConsumer;
    use crate::failure_sink::replay_failed;
    use crate::producer::CommandPublisher;
    use crate::retry::RetryPolicy;
    use crate::store::{ContactStore, InMemoryContactStore};
    use crate::workers::{CommandWorker, WorkerHandle};

    const PREFETCH: u16 = 8;

    struct Pipeline {
        broker: InMemoryBroker,
        store: Arc<InMemoryContactStore>,
        publisher: CommandPublisher<InMemoryBroker>,
        workers: Vec<WorkerHandle>,
    }

    impl Pipeline {
        fn worker(&self, kind: CommandKind) -> &WorkerHandle {
            self.workers.iter().find(|w| w.kind() == kind).unwrap()
        }

        async fn shutdown(self) {
            for w in self.workers {
                w.shutdown().await;
            }
        }
    }

    async fn declared_broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare(&Topology::contacts(RetryPolicy::default().interval))
            .await
            .unwrap();
        broker
    }

    fn seeded_store() -> Arc<InMemoryContactStore> {
        Arc::new(InMemoryContactStore::with_states([
            State::new(StateId::new(1), "SP", "São Paulo"),
            State::new(StateId::new(2), "RJ", "Rio de Janeiro"),
        ]))
    }

    async fn spawn_worker(
        kind: CommandKind,
        store: &Arc<InMemoryContactStore>,
        broker: &InMemoryBroker,
    ) -> WorkerHandle {
        let consumer = CommandConsumer::new(kind, store.clone(), broker.clone());
        CommandWorker::spawn(consumer, PREFETCH).await.unwrap()
    }

    async fn setup() -> Pipeline {
        let broker = declared_broker().await;
        let store = seeded_store();
        let mut workers = Vec::new();
        for kind in CommandKind::ALL {
            workers.push(spawn_worker(kind, &store, &broker).await);
        }
        Pipeline {
            publisher: CommandPublisher::new(broker.clone()),
            broker,
            store,
            workers,
        }
    }

    /// Poll `cond` until it holds (virtual time under `start_paused`).
    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(120);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn contact(id: &str, name: &str) -> Contact {
        Contact::new(ContactId::new(id).unwrap(), name, StateId::new(1))
    }

    fn failure_records(broker: &InMemoryBroker, kind: CommandKind) -> Vec<FailedCommand> {
        broker
            .peek(&kind.failed_queue())
            .iter()
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn add_edit_delete_then_redelivered_delete() {
        let p = setup().await;
        let id = ContactId::new("c1").unwrap();

        p.publisher.submit(ContactCommand::add(contact("c1", "A"))).await.unwrap();
        eventually("add applied", || p.worker(CommandKind::Add).stats().acked == 1).await;

        p.publisher.submit(ContactCommand::edit(contact("c1", "B"))).await.unwrap();
        eventually("edit applied", || p.worker(CommandKind::Edit).stats().acked == 1).await;
        assert_eq!(p.store.get_contact(&id).await.unwrap().unwrap().name, "B");

        let delete = CommandEnvelope::new(ContactCommand::delete(id.clone()));
        p.publisher.publish_envelope(&delete).await.unwrap();
        eventually("delete applied", || p.worker(CommandKind::Delete).stats().acked == 1).await;

        // Same message id again, as after a lost ack.
        p.publisher.publish_envelope(&delete).await.unwrap();
        eventually("redelivery applied", || p.worker(CommandKind::Delete).stats().acked == 2).await;

        assert!(p.store.get_contact(&id).await.unwrap().is_none());
        for kind in CommandKind::ALL {
            let stats = p.worker(kind).stats();
            assert_eq!(stats.failed + stats.rejected + stats.retried, 0, "{kind}");
            assert_eq!(p.broker.depth(&kind.failed_queue()), 0);
        }
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn edit_of_unknown_contact_lands_in_failure_sink() {
        let p = setup().await;

        p.publisher
            .submit(ContactCommand::edit(contact("unknown", "X")))
            .await
            .unwrap();
        eventually("failure record", || p.broker.depth("update-contact.failed") == 1).await;

        let stats = p.worker(CommandKind::Edit).stats();
        assert_eq!((stats.acked, stats.retried, stats.failed), (0, 0, 1));
        assert!(p.store.list_contacts().await.unwrap().is_empty());

        let record = &failure_records(&p.broker, CommandKind::Edit)[0];
        assert_eq!(record.failure, FailureKind::Permanent);
        assert_eq!(record.attempts, 1);
        let original = CommandEnvelope::from_bytes(&record.body_bytes().unwrap()).unwrap();
        assert_eq!(original.command().contact_id().as_str(), "unknown");
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_three_times_five_seconds_apart() {
        let p = setup().await;
        p.store.fail_next_applies(100);

        p.publisher.submit(ContactCommand::add(contact("c9", "A"))).await.unwrap();
        eventually("failure record", || p.broker.depth("add-contact.failed") == 1).await;

        let stats = p.worker(CommandKind::Add).stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);

        let attempts = p.store.apply_attempts(&ContactId::new("c9").unwrap());
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }

        let record = &failure_records(&p.broker, CommandKind::Add)[0];
        assert_eq!(record.failure, FailureKind::RetriesExhausted);
        assert_eq!(record.attempts, 4);
        assert!(p.store.list_contacts().await.unwrap().is_empty());
        assert_eq!(p.broker.depth("add-contact.retry"), 0);
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_budget() {
        let p = setup().await;
        p.store.fail_next_applies(2);

        p.publisher.submit(ContactCommand::add(contact("c2", "A"))).await.unwrap();
        eventually("add applied", || p.worker(CommandKind::Add).stats().acked == 1).await;

        assert_eq!(p.worker(CommandKind::Add).stats().retried, 2);
        assert!(p.store.get_contact(&ContactId::new("c2").unwrap()).await.unwrap().is_some());
        assert_eq!(p.broker.depth("add-contact.failed"), 0);
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_message_does_not_block_its_queue() {
        let p = setup().await;
        p.store.fail_next_applies(1);

        p.publisher.submit(ContactCommand::add(contact("slow", "A"))).await.unwrap();
        p.publisher.submit(ContactCommand::add(contact("fast", "B"))).await.unwrap();

        let started = Instant::now();
        eventually("second add applied", || p.worker(CommandKind::Add).stats().acked == 1).await;
        assert!(Instant::now() - started < Duration::from_secs(5));
        assert!(p.store.get_contact(&ContactId::new("fast").unwrap()).await.unwrap().is_some());

        eventually("retried add applied", || p.worker(CommandKind::Add).stats().acked == 2).await;
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn each_routing_key_reaches_only_its_queue() {
        let p = setup().await;

        p.publisher.submit(ContactCommand::add(contact("r1", "A"))).await.unwrap();
        p.publisher.submit(ContactCommand::edit(contact("r2", "B"))).await.unwrap();
        p.publisher
            .submit(ContactCommand::delete(ContactId::new("r3").unwrap()))
            .await
            .unwrap();
        p.broker.publish(contacts_events::EXCHANGE, "merge.contact", b"{}").await.unwrap();

        eventually("all processed", || {
            CommandKind::ALL.iter().all(|k| {
                let s = p.worker(*k).stats();
                s.acked + s.failed == 1
            })
        })
        .await;

        for kind in CommandKind::ALL {
            assert_eq!(p.worker(kind).stats().rejected, 0, "{kind} saw a foreign command");
        }
        assert_eq!(p.broker.unroutable(), 1);
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_loses_nothing() {
        let broker = declared_broker().await;
        let store = seeded_store();
        let publisher = CommandPublisher::new(broker.clone());
        for i in 0..20 {
            publisher
                .submit(ContactCommand::add(contact(&format!("g{i:02}"), "A")))
                .await
                .unwrap();
        }

        let worker = spawn_worker(CommandKind::Add, &store, &broker).await;
        tokio::task::yield_now().await;
        let first = worker.shutdown().await;

        assert_eq!(broker.unacked("add-contact"), 0);
        assert_eq!(broker.depth("add-contact") as u64 + first.acked, 20);
        assert_eq!(store.list_contacts().await.unwrap().len() as u64, first.acked);

        let worker = spawn_worker(CommandKind::Add, &store, &broker).await;
        eventually("queue drained", || broker.depth("add-contact") == 0 && broker.unacked("add-contact") == 0)
            .await;
        let second = worker.shutdown().await;

        assert_eq!(first.acked + second.acked, 20);
        assert_eq!(store.list_contacts().await.unwrap().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_failure_is_applied_once_its_cause_is_fixed() {
        let p = setup().await;

        p.publisher.submit(ContactCommand::edit(contact("late", "B"))).await.unwrap();
        eventually("failure record", || p.broker.depth("update-contact.failed") == 1).await;

        p.publisher.submit(ContactCommand::add(contact("late", "A"))).await.unwrap();
        eventually("add applied", || p.worker(CommandKind::Add).stats().acked == 1).await;

        let report = replay_failed(&p.broker, CommandKind::Edit, 10).await.unwrap();
        assert_eq!(report.replayed, 1);
        eventually("edit applied", || p.worker(CommandKind::Edit).stats().acked == 1).await;

        let c = p.store.get_contact(&ContactId::new("late").unwrap()).await.unwrap().unwrap();
        assert_eq!(c.name, "B");
        assert_eq!(p.broker.depth("update-contact.failed"), 0);
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_fails_submit_and_changes_nothing() {
        let p = setup().await;
        p.broker.set_reachable(false);

        let result = p.publisher.submit(ContactCommand::add(contact("c1", "A"))).await;
        assert!(result.is_err());

        p.broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(p.worker(CommandKind::Add).stats(), Default::default());
        assert!(p.store.list_contacts().await.unwrap().is_empty());
        p.shutdown().await;
    }
}
