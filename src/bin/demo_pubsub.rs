// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Two-process publish/subscribe demo.
//
// Usage:
//   demo_pubsub pub <service> <count> <interval_ms>
//   demo_pubsub sub <service> <count>
//
// Start the subscriber first, then the publisher. The publisher loans a
// chunk, stamps a sequence number and a filler pattern into it, and sends;
// the subscriber prints what it receives.

use std::thread;
use std::time::Duration;

use shmbus::{
    PublishPolicy, Publisher, PublisherConfig, SubscribePolicy, Subscriber, SubscriberConfig,
};

fn run_pub(service: &str, count: u64, interval_ms: u64) {
    let config = PublisherConfig::default()
        .with_chunk_size(256)
        .with_max_chunks(64)
        .with_publish_policy(PublishPolicy::Block);
    let publisher = Publisher::create(service, config).expect("create publisher");

    println!("pub: waiting for a subscriber...");
    publisher
        .wait_for_subscribers(1, Some(Duration::from_secs(30)))
        .expect("wait_for_subscribers");
    println!("pub: subscriber connected, sending {count} messages");

    for seq in 0..count {
        let mut sample = publisher.loan().expect("loan");
        let mut payload = [0u8; 64];
        payload[..8].copy_from_slice(&seq.to_le_bytes());
        for (i, b) in payload[8..].iter_mut().enumerate() {
            *b = (i & 0xFF) as u8;
        }
        sample.write_payload(&payload).expect("write_payload");

        match publisher.send(sample) {
            Ok(delivered) => println!("pub: seq {seq} delivered to {delivered}"),
            Err(e) => println!("pub: seq {seq} failed: {e}"),
        }
        thread::sleep(Duration::from_millis(interval_ms));
    }
    println!(
        "pub: done, {} chunks free",
        publisher.pool().remaining_free()
    );
}

fn run_sub(service: &str, count: u64) {
    let config = SubscriberConfig::default()
        .with_queue_capacity(16)
        .with_read_policy(SubscribePolicy::Block)
        .with_timeout(Some(Duration::from_secs(10)));
    let subscriber = Subscriber::create(service, config).expect("create subscriber");
    println!("sub: listening on slot {}", subscriber.slot_index());

    let mut received = 0u64;
    while received < count {
        match subscriber.receive() {
            Ok(sample) => {
                let mut seq_bytes = [0u8; 8];
                seq_bytes.copy_from_slice(&sample.payload()[..8]);
                let seq = u64::from_le_bytes(seq_bytes);
                println!(
                    "sub: seq {seq}, {} bytes (chunk {})",
                    sample.payload_size(),
                    sample.chunk_index()
                );
                received += 1;
            }
            Err(e) => {
                println!("sub: receive failed: {e}");
                return;
            }
        }
    }
    println!("sub: done, received {received}");
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("pub") if args.len() >= 5 => {
            let count: u64 = args[3].parse().expect("count");
            let interval: u64 = args[4].parse().expect("interval_ms");
            run_pub(&args[2], count, interval);
        }
        Some("sub") if args.len() >= 4 => {
            let count: u64 = args[3].parse().expect("count");
            run_sub(&args[2], count);
        }
        _ => {
            eprintln!("usage: demo_pubsub pub <service> <count> <interval_ms>");
            eprintln!("       demo_pubsub sub <service> <count>");
            std::process::exit(1);
        }
    }
}
