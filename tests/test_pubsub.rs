// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// End-to-end publish/subscribe scenarios: bounded send, broadcast fan-out
// with refcount accounting, drop and overwrite under backpressure, blocking
// receive with timeout, and the no-subscriber send options.

use std::thread;
use std::time::{Duration, Instant};

use shmbus::{
    ChunkState, IpcError, LoanPolicy, PublishPolicy, Publisher, PublisherConfig, SendError,
    SubscribePolicy, Subscriber, SubscriberConfig,
};

fn service(tag: &str) -> String {
    init_tracing();
    format!("pubsub_{tag}_{}", std::process::id())
}

/// Honor RUST_LOG in test runs; repeated calls are fine.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn publisher(svc: &str, max_chunks: u32, policy: PublishPolicy) -> Publisher {
    Publisher::create(
        svc,
        PublisherConfig::default()
            .with_chunk_size(64)
            .with_max_chunks(max_chunks)
            .with_publish_policy(policy),
    )
    .expect("create publisher")
}

fn subscriber(svc: &str, queue_capacity: u32) -> Subscriber {
    Subscriber::create(
        svc,
        SubscriberConfig::default()
            .with_queue_capacity(queue_capacity)
            .with_read_policy(SubscribePolicy::Skip),
    )
    .expect("create subscriber")
}

// --- S1: one publisher, one subscriber, bounded send ---

#[test]
fn single_roundtrip_delivers_payload() {
    let svc = service("s1");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);
    let subscriber = subscriber(&svc, 8);

    let mut sample = publisher.loan().unwrap();
    sample.write_payload(&[0x01, 0x02, 0x03, 0x04]).unwrap();
    let delivered = publisher.send(sample).unwrap();
    assert_eq!(delivered, 1);

    let received = subscriber.receive().unwrap();
    assert_eq!(received.payload(), &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(received.payload_size(), 4);
    drop(received);

    assert_eq!(publisher.pool().remaining_free(), 4);
}

// --- S2: broadcast fan-out of 3 ---

#[test]
fn broadcast_counts_one_reference_per_subscriber() {
    let svc = service("s2");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);
    let subs: Vec<Subscriber> = (0..3).map(|_| subscriber(&svc, 8)).collect();
    assert_eq!(publisher.subscriber_count(), 3);

    let mut sample = publisher.loan().unwrap();
    sample.write_payload(b"broadcast").unwrap();
    assert_eq!(publisher.send(sample).unwrap(), 3);

    let received: Vec<_> = subs.iter().map(|s| s.receive().unwrap()).collect();
    let chunk = received[0].chunk_index();
    for sample in &received {
        assert_eq!(sample.payload(), b"broadcast");
        assert_eq!(sample.chunk_index(), chunk);
    }

    // One live reference per undropped sample.
    let hdr = publisher.pool().header(chunk);
    assert_eq!(hdr.ref_count(), 3);
    assert_eq!(hdr.state(), ChunkState::Received);

    drop(received);
    assert_eq!(publisher.pool().remaining_free(), 4);
    assert_eq!(publisher.pool().header(chunk).state(), ChunkState::Free);
}

// --- S3: drop policy under pressure ---

#[test]
fn drop_policy_loses_overflow_and_compensates_refs() {
    let svc = service("s3");
    let publisher = publisher(&svc, 16, PublishPolicy::Drop);
    let subscriber = subscriber(&svc, 4); // usable capacity 3

    let mut outcomes = Vec::new();
    for seq in 0..10u8 {
        let mut sample = publisher.loan().unwrap();
        sample.write_payload(&[seq]).unwrap();
        outcomes.push(publisher.send(sample));
    }

    // First 3 fit, the rest report the full channel.
    for (seq, outcome) in outcomes.iter().enumerate() {
        if seq < 3 {
            assert!(matches!(outcome, Ok(1)), "send {seq}: {outcome:?}");
        } else {
            assert!(
                matches!(outcome, Err(SendError::Delivery(IpcError::ChannelFull))),
                "send {seq}: {outcome:?}"
            );
        }
    }

    // Only the 3 enqueued chunks are still out of the pool.
    assert_eq!(publisher.pool().remaining_free(), 16 - 3);
    assert_eq!(subscriber.pending(), 3);

    for seq in 0..3u8 {
        let sample = subscriber.receive().unwrap();
        assert_eq!(sample.payload(), &[seq]);
    }
    assert_eq!(
        subscriber.receive().unwrap_err(),
        IpcError::ChannelEmpty
    );
    assert_eq!(publisher.pool().remaining_free(), 16);
}

// --- S4: overwrite policy keeps the newest ---

#[test]
fn overwrite_policy_keeps_last_messages_in_order() {
    let svc = service("s4");
    let publisher = publisher(&svc, 16, PublishPolicy::Overwrite);
    let subscriber = subscriber(&svc, 4);

    for seq in 0..10u8 {
        let mut sample = publisher.loan().unwrap();
        sample.write_payload(&[seq]).unwrap();
        assert_eq!(publisher.send(sample).unwrap(), 1, "send {seq}");
    }

    // The ring holds exactly its usable capacity; every displaced chunk
    // went back to the pool.
    assert_eq!(subscriber.pending(), 3);
    assert_eq!(publisher.pool().remaining_free(), 16 - 3);

    for seq in 7..10u8 {
        let sample = subscriber.receive().unwrap();
        assert_eq!(sample.payload(), &[seq]);
    }
    assert_eq!(publisher.pool().remaining_free(), 16);
}

// --- S5: blocking receive with timeout ---

#[test]
fn blocking_receive_times_out_without_publisher() {
    let svc = service("s5");
    let subscriber = Subscriber::create(
        &svc,
        SubscriberConfig::default()
            .with_queue_capacity(8)
            .with_read_policy(SubscribePolicy::Block)
            .with_timeout(Some(Duration::from_millis(100))),
    )
    .unwrap();

    let start = Instant::now();
    let err = subscriber.receive().unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, IpcError::ChannelTimeout);
    assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned far too late: {elapsed:?}");
}

// --- blocking paths with a live peer ---

#[test]
fn blocking_receive_wakes_on_send() {
    let svc = service("wake");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);
    let subscriber = Subscriber::create(
        &svc,
        SubscriberConfig::default()
            .with_queue_capacity(8)
            .with_read_policy(SubscribePolicy::Block)
            .with_timeout(Some(Duration::from_secs(5))),
    )
    .unwrap();

    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let mut sample = publisher.loan().unwrap();
        sample.write_payload(b"wakeup").unwrap();
        publisher.send(sample).unwrap();
    });

    loop {
        match subscriber.receive() {
            Ok(sample) => {
                assert_eq!(sample.payload(), b"wakeup");
                break;
            }
            Err(IpcError::ChannelSpuriousWakeup) => continue,
            Err(e) => panic!("receive failed: {e}"),
        }
    }
    sender.join().unwrap();
}

#[test]
fn blocking_loan_wakes_when_chunk_returns() {
    let svc = service("loanblock");
    let publisher = Publisher::create(
        &svc,
        PublisherConfig {
            chunk_size: 64,
            max_chunks: 1,
            loan_policy: LoanPolicy::Block,
            loan_timeout: Some(Duration::from_secs(5)),
            ..PublisherConfig::default()
        },
    )
    .unwrap();

    let held = publisher.loan().unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        drop(held);
    });

    // Blocks until the held sample is dropped.
    let sample = publisher.loan().unwrap();
    assert_eq!(sample.capacity(), 64);
    releaser.join().unwrap();
}

#[test]
fn loan_error_policy_fails_fast_on_exhausted_pool() {
    let svc = service("loanerr");
    let publisher = Publisher::create(
        &svc,
        PublisherConfig::default()
            .with_chunk_size(64)
            .with_max_chunks(2)
            .with_loan_policy(LoanPolicy::Error),
    )
    .unwrap();

    let a = publisher.loan().unwrap();
    let b = publisher.loan().unwrap();
    assert_eq!(publisher.loan().unwrap_err(), IpcError::PoolExhausted);
    assert_eq!(publisher.pool().remaining_free(), 0);

    drop(a);
    drop(b);
    assert_eq!(publisher.pool().remaining_free(), 2);
}

// --- loan/drop round trip ---

#[test]
fn loan_dropped_without_send_is_invisible() {
    let svc = service("loandrop");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);
    let subscriber = subscriber(&svc, 8);

    let before = publisher.pool().remaining_free();
    let sample = publisher.loan().unwrap();
    drop(sample);

    assert_eq!(publisher.pool().remaining_free(), before);
    assert_eq!(subscriber.receive().unwrap_err(), IpcError::ChannelEmpty);
}

// --- zero-subscriber send options ---

#[test]
fn send_without_subscribers_succeeds_by_default() {
    let svc = service("nosub_ok");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);

    let sample = publisher.loan().unwrap();
    assert_eq!(publisher.send(sample).unwrap(), 0);
    // The chunk went straight back to the pool.
    assert_eq!(publisher.pool().remaining_free(), 4);
}

#[test]
fn send_without_subscribers_can_hand_the_sample_back() {
    let svc = service("nosub_err");
    let publisher = Publisher::create(
        &svc,
        PublisherConfig {
            chunk_size: 64,
            max_chunks: 4,
            send_without_subscribers_is_error: true,
            ..PublisherConfig::default()
        },
    )
    .unwrap();

    let mut sample = publisher.loan().unwrap();
    sample.write_payload(b"retry me").unwrap();

    let err = publisher.send(sample).unwrap_err();
    let returned = err.into_sample().expect("sample handed back");
    // Payload survived the failed send untouched.
    assert_eq!(returned.payload(), b"retry me");

    // A subscriber arrives; the same sample can be retried.
    let subscriber = subscriber(&svc, 8);
    assert_eq!(publisher.send(returned).unwrap(), 1);
    assert_eq!(subscriber.receive().unwrap().payload(), b"retry me");
}

// --- subscriber lifecycle ---

#[test]
fn dropped_subscriber_releases_undelivered_chunks() {
    let svc = service("subdrop");
    let publisher = publisher(&svc, 8, PublishPolicy::Drop);
    let subscriber = subscriber(&svc, 8);

    for seq in 0..5u8 {
        let mut sample = publisher.loan().unwrap();
        sample.write_payload(&[seq]).unwrap();
        publisher.send(sample).unwrap();
    }
    assert_eq!(publisher.pool().remaining_free(), 3);

    drop(subscriber);
    assert_eq!(publisher.pool().remaining_free(), 8);
    assert_eq!(publisher.subscriber_count(), 0);
}

#[test]
fn messages_sent_before_subscription_are_not_seen() {
    let svc = service("latejoin");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);

    let sample = publisher.loan().unwrap();
    assert_eq!(publisher.send(sample).unwrap(), 0);

    let subscriber = subscriber(&svc, 8);
    assert_eq!(subscriber.receive().unwrap_err(), IpcError::ChannelEmpty);

    // Only messages sent after registration arrive.
    let mut sample = publisher.loan().unwrap();
    sample.write_payload(b"late").unwrap();
    assert_eq!(publisher.send(sample).unwrap(), 1);
    assert_eq!(subscriber.receive().unwrap().payload(), b"late");
}

#[test]
fn wait_for_subscribers_parks_until_one_arrives() {
    let svc = service("waitsub");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);

    let svc_clone = svc.clone();
    let joiner = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        subscriber(&svc_clone, 8)
    });

    let arrived = publisher
        .wait_for_subscribers(1, Some(Duration::from_secs(5)))
        .unwrap();
    assert!(arrived);
    assert_eq!(publisher.subscriber_count(), 1);

    drop(joiner.join().unwrap());
}

#[test]
fn wait_for_subscribers_times_out() {
    let svc = service("waitsub_to");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);

    let arrived = publisher
        .wait_for_subscribers(1, Some(Duration::from_millis(50)))
        .unwrap();
    assert!(!arrived);
}

// --- payload handling ---

#[test]
fn payload_size_travels_with_the_chunk() {
    let svc = service("paysize");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);
    let subscriber = subscriber(&svc, 8);

    let mut sample = publisher.loan().unwrap();
    assert_eq!(sample.capacity(), 64);
    assert_eq!(sample.payload_size(), 64); // defaults to full capacity

    sample.payload_mut()[..3].copy_from_slice(&[9, 8, 7]);
    sample.set_payload_size(3).unwrap();
    publisher.send(sample).unwrap();

    let received = subscriber.receive().unwrap();
    assert_eq!(received.payload_size(), 3);
    assert_eq!(&*received, &[9, 8, 7]);
}

#[test]
fn oversized_payload_is_rejected() {
    let svc = service("oversize");
    let publisher = publisher(&svc, 4, PublishPolicy::Drop);

    let mut sample = publisher.loan().unwrap();
    let too_big = vec![0u8; 65];
    assert_eq!(
        sample.write_payload(&too_big).unwrap_err(),
        IpcError::InvalidArgument
    );
    assert_eq!(sample.set_payload_size(65).unwrap_err(), IpcError::InvalidArgument);
}

// --- mixed fan-out under pressure ---

#[test]
fn slow_subscriber_does_not_stall_fast_one() {
    let svc = service("mixed");
    let publisher = publisher(&svc, 16, PublishPolicy::Drop);
    let slow = subscriber(&svc, 4); // fills after 3 messages
    let fast = subscriber(&svc, 16);

    for seq in 0..6u8 {
        let mut sample = publisher.loan().unwrap();
        sample.write_payload(&[seq]).unwrap();
        match publisher.send(sample) {
            // While slow has room both get it; afterwards only fast does.
            Ok(n) => assert!(n >= 1),
            Err(e) => panic!("send {seq} failed: {e}"),
        }
    }

    // Fast sees everything, slow only the prefix.
    for seq in 0..6u8 {
        assert_eq!(fast.receive().unwrap().payload(), &[seq]);
    }
    for seq in 0..3u8 {
        assert_eq!(slow.receive().unwrap().payload(), &[seq]);
    }
    assert_eq!(slow.receive().unwrap_err(), IpcError::ChannelEmpty);

    assert_eq!(publisher.pool().remaining_free(), 16);
}
