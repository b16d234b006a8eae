// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Wait primitive tests: park/wake across threads, polling, and the
// no-lost-wake guarantee between a pre-park check and a concurrent set.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shmbus::event_flag;
use shmbus::waitset;
use shmbus::IpcError;

#[test]
fn parked_waiter_is_woken_by_set() {
    let word = Arc::new(AtomicU32::new(event_flag::NONE));

    let waiter_word = Arc::clone(&word);
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        waitset::wait_for_flags(
            &waiter_word,
            event_flag::HAS_DATA,
            Some(Duration::from_secs(5)),
        )
        .expect("woken");
        start.elapsed()
    });

    thread::sleep(Duration::from_millis(30));
    waitset::set_flags_and_wake(&word, event_flag::HAS_DATA, true);

    let waited = waiter.join().unwrap();
    assert!(waited >= Duration::from_millis(25), "woke early: {waited:?}");
    assert!(waited < Duration::from_secs(5), "timed out instead of waking");
}

#[test]
fn wake_without_flag_does_not_satisfy_wait() {
    let word = Arc::new(AtomicU32::new(event_flag::NONE));

    let waiter_word = Arc::clone(&word);
    let waiter = thread::spawn(move || {
        waitset::wait_for_flags(
            &waiter_word,
            event_flag::HAS_DATA,
            Some(Duration::from_millis(80)),
        )
    });

    // Set an unrelated flag; the waiter re-checks and keeps waiting.
    thread::sleep(Duration::from_millis(20));
    waitset::set_flags_and_wake(&word, event_flag::HAS_SPACE, true);

    assert_eq!(waiter.join().unwrap(), Err(IpcError::WouldBlock));
}

#[test]
fn poll_sees_flag_set_by_another_thread() {
    let word = Arc::new(AtomicU32::new(event_flag::NONE));

    let setter_word = Arc::clone(&word);
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(15));
        // Cheap variant: set without waking, polling side needs no futex.
        waitset::set_flags_and_wake(&setter_word, event_flag::HAS_FREE_CHUNK, false);
    });

    assert!(waitset::poll_for_flags(
        &word,
        event_flag::HAS_FREE_CHUNK,
        Duration::from_secs(2)
    ));
    setter.join().unwrap();
}

#[test]
fn sequence_change_wakes_waiter() {
    let seq = Arc::new(AtomicU32::new(7));

    let waiter_seq = Arc::clone(&seq);
    let waiter = thread::spawn(move || {
        waitset::wait_for_change(&waiter_seq, 7, Some(Duration::from_secs(5)))
    });

    thread::sleep(Duration::from_millis(20));
    seq.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    waitset::wake_all(&seq);

    assert_eq!(waiter.join().unwrap(), Ok(()));
}

#[test]
fn sequence_wait_returns_immediately_when_already_moved() {
    let seq = AtomicU32::new(3);
    // Seen value differs from current: no parking at all.
    waitset::wait_for_change(&seq, 2, Some(Duration::from_millis(1))).unwrap();
}

#[test]
fn clear_flags_only_touches_mask() {
    let word = AtomicU32::new(event_flag::HAS_DATA | event_flag::HAS_SPACE);
    waitset::clear_flags(&word, event_flag::HAS_DATA);
    assert!(!waitset::check_flags(&word, event_flag::HAS_DATA));
    assert!(waitset::check_flags(&word, event_flag::HAS_SPACE));
}
