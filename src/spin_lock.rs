// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Adaptive backoff and a minimal spin word for shared-memory use.
//
// The spin word guards only cold paths (registry snapshot rebuilds); every
// hot path in the engine is CAS-with-backoff.

use std::sync::atomic::{AtomicU32, Ordering};

/// Adaptive backoff between CAS retries.
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Acquire a spin word living in shared memory (0 = unlocked, 1 = locked).
pub(crate) fn spin_lock_word(word: &AtomicU32) {
    let mut k = 0u32;
    while word
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        adaptive_yield(&mut k);
    }
}

/// Release a spin word.
pub(crate) fn spin_unlock_word(word: &AtomicU32) {
    word.store(0, Ordering::Release);
}
