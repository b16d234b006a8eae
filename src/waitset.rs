// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Wait primitive over a single 32-bit atomic word in shared memory.
//
// Fast path: one acquire load of the event-flags word. Slow path: park on
// the word through the platform futex with the last observed value as the
// expected tag, so a flag set strictly after the pre-park load either makes
// that load succeed or wakes the parked waiter — there is no lost-wake
// window in between.
//
// Mutation rules: the word is only ever changed with `fetch_or`/`fetch_and`
// (or by the single owner of a field, which never applies here). Flag bits
// are public to the publisher/subscriber layer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{IpcError, Result};
use crate::platform::{futex_wait, futex_wake_all, FutexWait};

/// Event-flag bits carried by each channel's waitset word and by the pool.
pub mod event_flag {
    /// No flags set.
    pub const NONE: u32 = 0;
    /// The ring holds at least one element.
    pub const HAS_DATA: u32 = 0x01;
    /// The ring has at least one free slot.
    pub const HAS_SPACE: u32 = 0x02;
    /// The chunk pool has at least one free chunk.
    pub const HAS_FREE_CHUNK: u32 = 0x04;
    // Remaining bits reserved.
}

/// Block until any flag in `mask` is set, or until `timeout` elapses
/// (`None` waits indefinitely).
///
/// Returns `Err(WouldBlock)` on timeout. Spurious wakeups are absorbed by
/// re-checking the word.
pub fn wait_for_flags(word: &AtomicU32, mask: u32, timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let current = word.load(Ordering::Acquire);
        if current & mask != 0 {
            return Ok(());
        }

        let remaining = match deadline {
            Some(dl) => {
                let r = dl.saturating_duration_since(Instant::now());
                if r.is_zero() {
                    return Err(IpcError::WouldBlock);
                }
                Some(r)
            }
            None => None,
        };

        match futex_wait(word, current, remaining) {
            FutexWait::TimedOut => return Err(IpcError::WouldBlock),
            FutexWait::Woken | FutexWait::ValueChanged => continue,
        }
    }
}

/// Busy-poll until any flag in `mask` is set, yielding between checks.
/// No system call is made. Returns `false` on timeout.
pub fn poll_for_flags(word: &AtomicU32, mask: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if word.load(Ordering::Acquire) & mask != 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }
}

/// Set the flags in `mask` (release) and, when `wake` is set, wake every
/// waiter parked on the word.
///
/// `wake = false` is the cheap variant for consumers known to be polling.
pub fn set_flags_and_wake(word: &AtomicU32, mask: u32, wake: bool) {
    word.fetch_or(mask, Ordering::Release);
    if wake {
        futex_wake_all(word);
    }
}

/// Clear the flags in `mask` (release).
pub fn clear_flags(word: &AtomicU32, mask: u32) {
    word.fetch_and(!mask, Ordering::Release);
}

/// Read-only test: is any flag in `mask` set?
pub fn check_flags(word: &AtomicU32, mask: u32) -> bool {
    word.load(Ordering::Acquire) & mask != 0
}

/// Block until `word` moves away from `seen`, or until `timeout` elapses.
///
/// Used with monotone sequence words (the registry bumps and wakes its
/// sequence counter on every register/unregister).
pub fn wait_for_change(word: &AtomicU32, seen: u32, timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if word.load(Ordering::Acquire) != seen {
            return Ok(());
        }

        let remaining = match deadline {
            Some(dl) => {
                let r = dl.saturating_duration_since(Instant::now());
                if r.is_zero() {
                    return Err(IpcError::WouldBlock);
                }
                Some(r)
            }
            None => None,
        };

        match futex_wait(word, seen, remaining) {
            FutexWait::TimedOut => return Err(IpcError::WouldBlock),
            FutexWait::Woken | FutexWait::ValueChanged => continue,
        }
    }
}

/// Wake every waiter parked on a sequence word.
pub fn wake_all(word: &AtomicU32) {
    futex_wake_all(word);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_clear_check() {
        let word = AtomicU32::new(event_flag::NONE);
        assert!(!check_flags(&word, event_flag::HAS_DATA));

        set_flags_and_wake(&word, event_flag::HAS_DATA, false);
        assert!(check_flags(&word, event_flag::HAS_DATA));
        assert!(!check_flags(&word, event_flag::HAS_SPACE));

        set_flags_and_wake(&word, event_flag::HAS_SPACE, false);
        clear_flags(&word, event_flag::HAS_DATA);
        assert!(!check_flags(&word, event_flag::HAS_DATA));
        assert!(check_flags(&word, event_flag::HAS_SPACE));
    }

    #[test]
    fn wait_fast_path_when_already_set() {
        let word = AtomicU32::new(event_flag::HAS_DATA);
        wait_for_flags(&word, event_flag::HAS_DATA, Some(Duration::from_millis(1))).unwrap();
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(event_flag::NONE);
        let start = Instant::now();
        let err =
            wait_for_flags(&word, event_flag::HAS_DATA, Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err, IpcError::WouldBlock);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
