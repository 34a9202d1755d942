use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use contacts_core::{Contact, ContactDetails, ContactId, State, StateId};
use contacts_events::{Broker, CommandEnvelope, CommandKind, ContactCommand, InMemoryBroker, Topology, EXCHANGE};
use contacts_infra::{CommandConsumer, InMemoryContactStore};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn sample_envelope(i: usize) -> CommandEnvelope {
    let contact = Contact::new(ContactId::new(format!("c{i}")).unwrap(), "Ana Souza", StateId::new(1))
        .with_details(ContactDetails {
            email: Some("ana@example.com".to_string()),
            phone: Some("+55 11 99999-0000".to_string()),
            address: Some("Av. Paulista, 1000".to_string()),
        });
    CommandEnvelope::new(ContactCommand::add(contact))
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");
    let env = sample_envelope(1);
    let body = env.to_bytes().unwrap();
    group.throughput(Throughput::Bytes(body.len() as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(&env).to_bytes().unwrap()));
    group.bench_function("decode", |b| {
        b.iter(|| CommandEnvelope::from_bytes(black_box(&body)).unwrap())
    });
    group.finish();
}

fn bench_in_memory_routing(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_routing");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let bodies: Vec<Vec<u8>> = (0..batch_size)
                    .map(|i| sample_envelope(i).to_bytes().unwrap())
                    .collect();
                b.iter(|| {
                    rt.block_on(async {
                        let broker = InMemoryBroker::new();
                        broker.declare(&Topology::contacts(Duration::from_secs(5))).await.unwrap();
                        for body in &bodies {
                            broker.publish(EXCHANGE, "add.contact", body).await.unwrap();
                        }
                        while let Some(d) = broker.get("add-contact").await.unwrap() {
                            d.ack().await.unwrap();
                        }
                    })
                });
            },
        );
    }
    group.finish();
}

fn bench_consumer_apply(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("consumer_apply");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_to_in_memory_store", |b| {
        let broker = InMemoryBroker::new();
        rt.block_on(broker.declare(&Topology::contacts(Duration::from_secs(5))))
            .unwrap();
        let store = Arc::new(InMemoryContactStore::with_states([State::new(
            StateId::new(1),
            "SP",
            "São Paulo",
        )]));
        let consumer = CommandConsumer::new(CommandKind::Add, store, broker.clone());
        let mut i = 0usize;

        b.iter(|| {
            i += 1;
            let body = sample_envelope(i).to_bytes().unwrap();
            rt.block_on(async {
                broker.publish("", "add-contact", &body).await.unwrap();
                let d = broker.get("add-contact").await.unwrap().unwrap();
                black_box(consumer.process(d).await)
            })
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_codec,
    bench_in_memory_routing,
    bench_consumer_apply
);
criterion_main!(benches);
