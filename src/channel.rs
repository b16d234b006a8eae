// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// SPSC ring channel of chunk indices, one per subscriber.
//
// The channel owns no memory: both halves hold raw pointers to the head,
// tail, waitset and ring storage inside the segment. Capacity is a power of
// two and one slot stays reserved, so a ring of capacity C carries at most
// C - 1 elements. Indices are stored pre-wrapped.
//
// Role split: only the producer advances `tail`, only the owning consumer
// advances `head` — with one exception. Under the `Overwrite` publish policy
// the producer claims the oldest element by advancing `head` itself. Both
// sides therefore move `head` with compare-exchange; whoever wins the CAS
// owns the element it displaced, the loser re-reads and retries. This is the
// only place the SPSC discipline is relaxed, and it is confined to that
// single word.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::{PublishPolicy, SubscribePolicy, DEFAULT_POLL_TIMEOUT};
use crate::error::{IpcError, Result};
use crate::layout::ChannelSlot;
use crate::spin_lock::adaptive_yield;
use crate::waitset::{self, event_flag};

// ---------------------------------------------------------------------------
// Shared view of the ring state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Raw {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    waitset: *const AtomicU32, // may be null
    ring: *mut u32,
    capacity: u32,
}

impl Raw {
    fn is_valid(&self) -> bool {
        !self.head.is_null()
            && !self.tail.is_null()
            && !self.ring.is_null()
            && self.capacity > 1
            && self.capacity.is_power_of_two()
    }

    #[inline]
    fn head(&self) -> &AtomicU32 {
        unsafe { &*self.head }
    }

    #[inline]
    fn tail(&self) -> &AtomicU32 {
        unsafe { &*self.tail }
    }

    #[inline]
    fn waitset(&self) -> Option<&AtomicU32> {
        if self.waitset.is_null() {
            None
        } else {
            Some(unsafe { &*self.waitset })
        }
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    fn len(&self) -> u32 {
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Relaxed);
        tail.wrapping_sub(head) & self.mask()
    }

    unsafe fn from_slot(slot: &ChannelSlot) -> Result<Self> {
        let capacity = slot.capacity.load(Ordering::Acquire);
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(IpcError::ChannelInvalid);
        }
        Ok(Self {
            head: &slot.head,
            tail: &slot.tail,
            waitset: &slot.waitset,
            ring: slot.ring_ptr(),
            capacity,
        })
    }
}

// ---------------------------------------------------------------------------
// WriteChannel — producer half
// ---------------------------------------------------------------------------

/// Producer half of a subscriber's ring. Held transiently by the publisher
/// while iterating a registry snapshot.
pub struct WriteChannel {
    raw: Raw,
}

// The pointed-to state is process-shared atomics; moving the view between
// threads is fine as long as the single-producer discipline is kept.
unsafe impl Send for WriteChannel {}

impl WriteChannel {
    /// Build a producer view from raw ring state.
    ///
    /// # Safety
    /// All pointers must reference live ring state with at least `capacity`
    /// entries behind `ring`; `waitset` may be null (policies that need it
    /// then fail with `ChannelWaitsetUnavailable`).
    pub unsafe fn from_raw_parts(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        waitset: *const AtomicU32,
        ring: *mut u32,
        capacity: u32,
    ) -> Self {
        Self {
            raw: Raw {
                head,
                tail,
                waitset,
                ring,
                capacity,
            },
        }
    }

    /// View over an initialized channel slot.
    pub(crate) fn attach(slot: &ChannelSlot) -> Result<Self> {
        Ok(Self {
            raw: unsafe { Raw::from_slot(slot)? },
        })
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }

    /// Elements the ring can actually hold (one slot stays reserved).
    pub fn usable_capacity(&self) -> u32 {
        self.raw.capacity - 1
    }

    pub fn len(&self) -> u32 {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.raw.len() == self.raw.mask()
    }

    #[inline]
    fn commit(&self, tail: u32, next_tail: u32, value: u32, wake: bool) {
        unsafe { self.raw.ring.add(tail as usize).write(value) };
        self.raw.tail().store(next_tail, Ordering::Release);
        if let Some(ws) = self.raw.waitset() {
            waitset::set_flags_and_wake(ws, event_flag::HAS_DATA, wake);
        }
    }

    /// One producer step: enqueue `value` or report `ChannelFull`.
    /// Sets `HasData` without waking (cheap variant for polling consumers).
    pub fn write(&self, value: u32) -> Result<()> {
        if !self.raw.is_valid() {
            return Err(IpcError::ChannelInvalid);
        }
        let tail = self.raw.tail().load(Ordering::Relaxed);
        let next_tail = tail.wrapping_add(1) & self.raw.mask();
        let head = self.raw.head().load(Ordering::Acquire);
        if next_tail == head {
            return Err(IpcError::ChannelFull);
        }
        self.commit(tail, next_tail, value, false);
        Ok(())
    }

    /// Enqueue `value`, resolving a full ring according to `policy`.
    ///
    /// Returns the chunk index displaced by an `Overwrite` (its reference
    /// accounting is the caller's to settle), or `None` when nothing was
    /// dropped.
    ///
    /// `timeout` applies to `Block` and `Wait`; `None` means indefinitely
    /// for `Block` and the default poll window for `Wait`.
    pub fn write_with_policy(
        &self,
        value: u32,
        policy: PublishPolicy,
        timeout: Option<Duration>,
    ) -> Result<Option<u32>> {
        if !self.raw.is_valid() {
            return Err(IpcError::ChannelInvalid);
        }

        let mask = self.raw.mask();
        let mut dropped = None;

        loop {
            let tail = self.raw.tail().load(Ordering::Relaxed);
            let next_tail = tail.wrapping_add(1) & mask;
            let head = self.raw.head().load(Ordering::Acquire);

            if next_tail != head {
                self.commit(tail, next_tail, value, true);
                return Ok(dropped);
            }

            match policy {
                PublishPolicy::Overwrite => {
                    // Claim the oldest element; the consumer may win instead,
                    // in which case the ring is no longer full.
                    let victim = unsafe { self.raw.ring.add(head as usize).read() };
                    if self
                        .raw
                        .head()
                        .compare_exchange(
                            head,
                            head.wrapping_add(1) & mask,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        dropped = Some(victim);
                    }
                    continue;
                }
                PublishPolicy::Drop | PublishPolicy::Error => {
                    return Err(IpcError::ChannelFull);
                }
                PublishPolicy::Block => {
                    let ws = self
                        .raw
                        .waitset()
                        .ok_or(IpcError::ChannelWaitsetUnavailable)?;
                    waitset::wait_for_flags(ws, event_flag::HAS_SPACE, timeout)
                        .map_err(|_| IpcError::ChannelTimeout)?;

                    // One retry after the wakeup.
                    let tail = self.raw.tail().load(Ordering::Relaxed);
                    let next_tail = tail.wrapping_add(1) & mask;
                    let head = self.raw.head().load(Ordering::Acquire);
                    if next_tail == head {
                        return Err(IpcError::ChannelSpuriousWakeup);
                    }
                    self.commit(tail, next_tail, value, true);
                    return Ok(dropped);
                }
                PublishPolicy::Wait => {
                    let ws = self
                        .raw
                        .waitset()
                        .ok_or(IpcError::ChannelWaitsetUnavailable)?;
                    let window = timeout.unwrap_or(DEFAULT_POLL_TIMEOUT);
                    if !waitset::poll_for_flags(ws, event_flag::HAS_SPACE, window) {
                        return Err(IpcError::ChannelTimeout);
                    }

                    let tail = self.raw.tail().load(Ordering::Relaxed);
                    let next_tail = tail.wrapping_add(1) & mask;
                    let head = self.raw.head().load(Ordering::Acquire);
                    if next_tail == head {
                        return Err(IpcError::ChannelFull);
                    }
                    self.commit(tail, next_tail, value, true);
                    return Ok(dropped);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ReadChannel — consumer half
// ---------------------------------------------------------------------------

/// Consumer half of a subscriber's ring. Owned by exactly one subscriber.
pub struct ReadChannel {
    raw: Raw,
}

unsafe impl Send for ReadChannel {}

impl ReadChannel {
    /// Build a consumer view from raw ring state.
    ///
    /// # Safety
    /// Same contract as [`WriteChannel::from_raw_parts`].
    pub unsafe fn from_raw_parts(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        waitset: *const AtomicU32,
        ring: *mut u32,
        capacity: u32,
    ) -> Self {
        Self {
            raw: Raw {
                head,
                tail,
                waitset,
                ring,
                capacity,
            },
        }
    }

    /// View over an initialized channel slot.
    pub(crate) fn attach(slot: &ChannelSlot) -> Result<Self> {
        Ok(Self {
            raw: unsafe { Raw::from_slot(slot)? },
        })
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }

    pub fn len(&self) -> u32 {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    /// One consumer step, or `None` when the ring is empty.
    ///
    /// `head` is advanced by CAS: an overwriting producer may displace the
    /// element this consumer just looked at, in which case the read retries
    /// on the next element.
    fn try_read(&self) -> Option<u32> {
        let mask = self.raw.mask();
        let mut k = 0u32;
        loop {
            let head = self.raw.head().load(Ordering::Relaxed);
            let tail = self.raw.tail().load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let value = unsafe { self.raw.ring.add(head as usize).read() };
            let next_head = head.wrapping_add(1) & mask;
            if self
                .raw
                .head()
                .compare_exchange(head, next_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(ws) = self.raw.waitset() {
                    waitset::set_flags_and_wake(ws, event_flag::HAS_SPACE, true);
                    if next_head == tail {
                        waitset::clear_flags(ws, event_flag::HAS_DATA);
                    }
                }
                return Some(value);
            }
            // Lost the head race to an overwriting producer.
            adaptive_yield(&mut k);
        }
    }

    /// Dequeue one chunk index or report `ChannelEmpty` (clearing `HasData`).
    pub fn read(&self) -> Result<u32> {
        if !self.raw.is_valid() {
            return Err(IpcError::ChannelInvalid);
        }
        match self.try_read() {
            Some(v) => Ok(v),
            None => {
                if let Some(ws) = self.raw.waitset() {
                    waitset::clear_flags(ws, event_flag::HAS_DATA);
                }
                Err(IpcError::ChannelEmpty)
            }
        }
    }

    /// Dequeue one chunk index, resolving an empty ring according to
    /// `policy`.
    pub fn read_with_policy(
        &self,
        policy: SubscribePolicy,
        timeout: Option<Duration>,
    ) -> Result<u32> {
        if !self.raw.is_valid() {
            return Err(IpcError::ChannelInvalid);
        }

        if let Some(v) = self.try_read() {
            return Ok(v);
        }

        match policy {
            SubscribePolicy::Skip | SubscribePolicy::Error => {
                if let Some(ws) = self.raw.waitset() {
                    waitset::clear_flags(ws, event_flag::HAS_DATA);
                }
                Err(IpcError::ChannelEmpty)
            }
            SubscribePolicy::Block => {
                let ws = self
                    .raw
                    .waitset()
                    .ok_or(IpcError::ChannelWaitsetUnavailable)?;
                waitset::wait_for_flags(ws, event_flag::HAS_DATA, timeout)
                    .map_err(|_| IpcError::ChannelTimeout)?;
                // One retry after the wakeup.
                self.try_read().ok_or(IpcError::ChannelSpuriousWakeup)
            }
            SubscribePolicy::Wait => {
                let ws = self
                    .raw
                    .waitset()
                    .ok_or(IpcError::ChannelWaitsetUnavailable)?;
                let window = timeout.unwrap_or(DEFAULT_POLL_TIMEOUT);
                if !waitset::poll_for_flags(ws, event_flag::HAS_DATA, window) {
                    return Err(IpcError::ChannelTimeout);
                }
                self.try_read().ok_or(IpcError::ChannelEmpty)
            }
        }
    }

    /// Look at the next chunk index without consuming it.
    pub fn peek(&self) -> Option<u32> {
        if !self.raw.is_valid() {
            return None;
        }
        let head = self.raw.head().load(Ordering::Relaxed);
        let tail = self.raw.tail().load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        Some(unsafe { self.raw.ring.add(head as usize).read() })
    }
}
