// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Channel registry: tracks which queue slots belong to live subscribers and
// publishes a double-buffered snapshot for lock-free iteration by
// publishers.
//
// Slot ownership is a bit in `ready_mask`. Registration rebuilds the
// inactive snapshot from the mask (low to high), then flips the active
// index with release ordering. Rebuild-and-flip is serialized by a spin
// word so two concurrent registrations never write the same buffer; the
// flip itself stays a single atomic store, so publishers read snapshots
// without any lock.
//
// A monotone sequence counter doubles as a futex word: it is bumped and
// woken on every registry change so publishers can park until a subscriber
// arrives.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::config::mode::MaskBits;
use crate::error::{IpcError, Result};
use crate::layout::SubscriberSnapshot;
use crate::segment::Segment;
use crate::spin_lock::{spin_lock_word, spin_unlock_word};
use crate::waitset;

/// Handle to the segment's registry. Cheap to clone; all state lives in the
/// control block.
#[derive(Clone)]
pub struct ChannelRegistry {
    segment: Arc<Segment>,
}

impl ChannelRegistry {
    pub fn new(segment: Arc<Segment>) -> Self {
        Self { segment }
    }

    /// Mask covering the slot indices this segment actually lays out.
    fn valid_mask(&self) -> MaskBits {
        let n = self.segment.max_channels();
        if n >= MaskBits::BITS {
            !0
        } else {
            ((1 as MaskBits) << n) - 1
        }
    }

    /// Claim a slot: the lowest free one, or `requested` specifically.
    ///
    /// Returns `Retry` when the `fetch_or` found the bit already set (a
    /// concurrent claim won); callers may simply invoke again. `Exhausted`
    /// when every slot is taken, `ChannelAlreadyInUse` when the requested
    /// slot is owned.
    pub fn allocate_slot(&self, requested: Option<u32>) -> Result<u32> {
        let reg = &self.segment.control().registry;
        let mask = reg.ready_mask.load(Ordering::Acquire);

        let target = match requested {
            Some(i) => {
                if i >= self.segment.max_channels() {
                    return Err(IpcError::InvalidChannelIndex);
                }
                if mask & ((1 as MaskBits) << i) != 0 {
                    return Err(IpcError::ChannelAlreadyInUse);
                }
                i
            }
            None => {
                let available = !mask & self.valid_mask();
                if available == 0 {
                    return Err(IpcError::Exhausted);
                }
                available.trailing_zeros()
            }
        };

        let bit = (1 as MaskBits) << target;
        let old = reg.ready_mask.fetch_or(bit, Ordering::AcqRel);
        if old & bit != 0 {
            return Err(IpcError::Retry);
        }

        self.bump_sequence();
        tracing::debug!(slot = target, "channel slot allocated");
        Ok(target)
    }

    /// Publish a freshly claimed slot to the snapshot and bump the
    /// subscriber count. The slot's bit must already be set by
    /// [`allocate_slot`](Self::allocate_slot).
    pub fn register(&self, slot_index: u32) -> Result<()> {
        if slot_index >= self.segment.max_channels() {
            return Err(IpcError::InvalidChannelIndex);
        }
        let reg = &self.segment.control().registry;
        if reg.ready_mask.load(Ordering::Acquire) & ((1 as MaskBits) << slot_index) == 0 {
            return Err(IpcError::ChannelNotFound);
        }

        self.rebuild_and_flip();
        reg.subscriber_count.fetch_add(1, Ordering::AcqRel);
        self.bump_sequence();
        tracing::debug!(slot = slot_index, "subscriber registered");
        Ok(())
    }

    /// Release a slot. Returns `false` (and changes nothing) when the bit
    /// was already clear, so unregistering twice is harmless.
    pub fn unregister(&self, slot_index: u32) -> bool {
        if slot_index >= self.segment.max_channels() {
            return false;
        }
        let reg = &self.segment.control().registry;
        let bit = (1 as MaskBits) << slot_index;

        loop {
            let mask = reg.ready_mask.load(Ordering::Acquire);
            if mask & bit == 0 {
                return false;
            }
            if reg
                .ready_mask
                .compare_exchange_weak(mask, mask & !bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        self.rebuild_and_flip();
        reg.subscriber_count.fetch_sub(1, Ordering::AcqRel);
        self.bump_sequence();
        tracing::debug!(slot = slot_index, "subscriber unregistered");
        true
    }

    /// Rebuild the inactive snapshot from `ready_mask` and flip the active
    /// index. Serialized against other writers by the registry spin word.
    fn rebuild_and_flip(&self) {
        let ctrl = self.segment.control();
        let reg = &ctrl.registry;

        spin_lock_word(&reg.lock);

        let active = (reg.active_snapshot_index.load(Ordering::Acquire) & 1) as usize;
        let write_idx = 1 - active;

        let mut snap = SubscriberSnapshot::cleared();
        let mut m = reg.ready_mask.load(Ordering::Acquire);
        while m != 0 {
            let idx = m.trailing_zeros() as u8;
            snap.queue_indices[snap.count as usize] = idx;
            snap.count += 1;
            m &= m - 1; // clear lowest set bit
        }
        snap.version = unsafe { (*ctrl.snapshot_cell(active)).version }.wrapping_add(1);

        unsafe { ctrl.snapshot_cell(write_idx).write(snap) };
        reg.active_snapshot_index
            .store(write_idx as u8, Ordering::Release);

        spin_unlock_word(&reg.lock);
    }

    /// Copy out the active snapshot.
    ///
    /// The copy is retried if the active index flipped mid-copy, so the
    /// returned record is always internally consistent. A registration that
    /// lands after the index was loaded is simply not visible yet; the
    /// publisher picks it up on its next send.
    pub fn snapshot(&self) -> SubscriberSnapshot {
        let ctrl = self.segment.control();
        let reg = &ctrl.registry;
        loop {
            let idx = (reg.active_snapshot_index.load(Ordering::Acquire) & 1) as usize;
            let copy = unsafe { ctrl.snapshot_cell(idx).read() };
            fence(Ordering::Acquire);
            if (reg.active_snapshot_index.load(Ordering::Acquire) & 1) as usize == idx {
                return copy;
            }
        }
    }

    /// Mark the slot ready for publisher iteration.
    pub fn activate_slot(&self, slot_index: u32) -> Result<()> {
        let slot = self.segment.channel_slot(slot_index)?;
        slot.active.store(1, Ordering::Release);
        Ok(())
    }

    /// Pull the slot out of publisher iteration (it may still be in a
    /// snapshot; publishers re-check the marker before enqueueing).
    pub fn deactivate_slot(&self, slot_index: u32) -> Result<()> {
        let slot = self.segment.channel_slot(slot_index)?;
        slot.active.store(0, Ordering::Release);
        Ok(())
    }

    pub fn subscriber_count(&self) -> u32 {
        self.segment
            .control()
            .registry
            .subscriber_count
            .load(Ordering::Acquire) as u32
    }

    /// Current ready mask (diagnostics and tests).
    pub fn ready_mask(&self) -> MaskBits {
        self.segment
            .control()
            .registry
            .ready_mask
            .load(Ordering::Acquire)
    }

    /// Current value of the registry change counter.
    pub fn sequence(&self) -> u32 {
        self.segment
            .control()
            .registry
            .sequence
            .load(Ordering::Acquire)
    }

    /// Park until the registry changes away from `seen` (futex on the
    /// sequence word).
    pub fn wait_for_change(
        &self,
        seen: u32,
        timeout: Option<std::time::Duration>,
    ) -> Result<()> {
        waitset::wait_for_change(&self.segment.control().registry.sequence, seen, timeout)
    }

    fn bump_sequence(&self) {
        let seq = &self.segment.control().registry.sequence;
        seq.fetch_add(1, Ordering::AcqRel);
        waitset::wake_all(seq);
    }
}
