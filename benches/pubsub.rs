// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Publish/subscribe throughput benchmarks.
//
// Run with:
//   cargo bench --bench pubsub
//
// Groups:
//   loan_drop      — loan a chunk and drop it unsent (pool round trip)
//   send_receive   — one publisher, one subscriber, full delivery loop
//   snapshot       — registry snapshot copy-out

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use shmbus::{
    PublishPolicy, Publisher, PublisherConfig, SubscribePolicy, Subscriber, SubscriberConfig,
};

const PAYLOAD: usize = 64;

fn service(tag: &str) -> String {
    format!("bench_{tag}_{}", std::process::id())
}

fn bench_loan_drop(c: &mut Criterion) {
    let svc = service("loan");
    let publisher = Publisher::create(
        &svc,
        PublisherConfig::default()
            .with_chunk_size(PAYLOAD as u32)
            .with_max_chunks(16),
    )
    .expect("publisher");

    let mut group = c.benchmark_group("loan_drop");
    group.throughput(Throughput::Elements(1));
    group.bench_function("loan_drop", |b| {
        b.iter(|| {
            let sample = publisher.loan().expect("loan");
            black_box(sample.chunk_index());
            drop(sample);
        });
    });
    group.finish();
}

fn bench_send_receive(c: &mut Criterion) {
    let svc = service("sendrecv");
    let publisher = Publisher::create(
        &svc,
        PublisherConfig::default()
            .with_chunk_size(PAYLOAD as u32)
            .with_max_chunks(64)
            .with_publish_policy(PublishPolicy::Drop),
    )
    .expect("publisher");
    let subscriber = Subscriber::create(
        &svc,
        SubscriberConfig::default()
            .with_queue_capacity(64)
            .with_read_policy(SubscribePolicy::Skip),
    )
    .expect("subscriber");

    let payload = [0xA5u8; PAYLOAD];

    let mut group = c.benchmark_group("send_receive");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));
    group.bench_function("one_sub_roundtrip", |b| {
        b.iter(|| {
            let mut sample = publisher.loan().expect("loan");
            sample.write_payload(&payload).expect("write");
            publisher.send(sample).expect("send");
            let received = subscriber.receive().expect("receive");
            black_box(received.payload()[0]);
            drop(received);
        });
    });
    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let svc = service("snapshot");
    let publisher =
        Publisher::create(&svc, PublisherConfig::default().with_max_chunks(8)).expect("publisher");
    let _subs: Vec<Subscriber> = (0..3)
        .map(|_| {
            Subscriber::create(&svc, SubscriberConfig::default().with_queue_capacity(8))
                .expect("subscriber")
        })
        .collect();

    let mut group = c.benchmark_group("snapshot");
    group.throughput(Throughput::Elements(1));
    group.bench_function("copy_out", |b| {
        b.iter(|| black_box(publisher.registry().snapshot()));
    });
    group.finish();
}

criterion_group!(benches, bench_loan_drop, bench_send_receive, bench_snapshot);
criterion_main!(benches);
