// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Lock-free chunk pool over the segment's payload region.
//
// The free list is a Treiber stack of chunk indices threaded through the
// chunk headers. The pool is fixed-size and indices are never invented, so
// the classic ABA hazard reduces to losing a CAS and retrying: the `next`
// pointer is always re-read through the currently observed head.
//
// Reference counting: `allocate` hands out a chunk with one reference (the
// loaning publisher). Fan-out adds one reference per successful enqueue.
// Whoever decrements the count from one to zero returns the chunk to the
// free list and raises `HAS_FREE_CHUNK` for blocked loans.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{violation, IpcError, Result};
use crate::layout::{ChunkHeader, ChunkState, INVALID_CHUNK_INDEX};
use crate::segment::Segment;
use crate::spin_lock::adaptive_yield;
use crate::waitset::{self, event_flag};

/// Link every chunk onto the free list. Called once by the segment creator
/// before magic/version are published.
pub(crate) fn initialize_pool(segment: &Segment) {
    let max = segment.max_chunks();
    for i in 0..max {
        let next = if i + 1 < max { i + 1 } else { INVALID_CHUNK_INDEX };
        segment.chunk_header(i).initialize(i, next);
    }

    let ctrl = segment.control();
    ctrl.pool.free_count.store(max, Ordering::Release);
    ctrl.pool.free_list_head.store(0, Ordering::Release);
    waitset::set_flags_and_wake(&ctrl.pool.waitset, event_flag::HAS_FREE_CHUNK, false);
}

/// Handle to the segment's chunk pool. Cheap to clone; all state lives in
/// shared memory.
#[derive(Clone)]
pub struct ChunkPool {
    segment: Arc<Segment>,
}

impl ChunkPool {
    pub fn new(segment: Arc<Segment>) -> Self {
        Self { segment }
    }

    /// Pop a free chunk. On success the chunk is `Loaned` with refcount one
    /// and its payload size preset to the full chunk size.
    pub fn allocate(&self) -> Result<u32> {
        let ctrl = self.segment.control();
        let mut k = 0u32;

        loop {
            let head = ctrl.pool.free_list_head.load(Ordering::Acquire);
            if head == INVALID_CHUNK_INDEX {
                // Drop the stale flag, then look once more: a concurrent
                // release may have pushed between the load and the clear.
                waitset::clear_flags(&ctrl.pool.waitset, event_flag::HAS_FREE_CHUNK);
                if ctrl.pool.free_list_head.load(Ordering::Acquire) == INVALID_CHUNK_INDEX {
                    return Err(IpcError::PoolExhausted);
                }
                continue;
            }

            let hdr = self.segment.chunk_header(head);
            let next = hdr.next_free_index();

            if ctrl
                .pool
                .free_list_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                ctrl.pool.free_count.fetch_sub(1, Ordering::AcqRel);

                let prev = hdr.swap_state(ChunkState::Loaned);
                if prev != ChunkState::Free {
                    violation(
                        "pool",
                        format_args!("allocated chunk {head} was {}", prev.as_str()),
                    );
                }
                hdr.store_ref_count(1);
                hdr.set_next_free_index(INVALID_CHUNK_INDEX);
                hdr.set_payload_size(self.segment.chunk_size());
                return Ok(head);
            }
            adaptive_yield(&mut k);
        }
    }

    /// Push a chunk whose refcount already hit zero back onto the free list.
    fn deallocate(&self, index: u32) {
        let hdr = self.segment.chunk_header(index);

        let prev = hdr.swap_state(ChunkState::Free);
        if prev == ChunkState::Free {
            violation("pool", format_args!("double free of chunk {index}"));
        }
        if hdr.ref_count() != 0 {
            violation(
                "pool",
                format_args!("freeing chunk {index} with live references"),
            );
        }

        let ctrl = self.segment.control();
        let mut k = 0u32;
        loop {
            let head = ctrl.pool.free_list_head.load(Ordering::Acquire);
            hdr.set_next_free_index(head);
            if ctrl
                .pool
                .free_list_head
                .compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            adaptive_yield(&mut k);
        }
        ctrl.pool.free_count.fetch_add(1, Ordering::AcqRel);
        waitset::set_flags_and_wake(&ctrl.pool.waitset, event_flag::HAS_FREE_CHUNK, true);
    }

    /// Drop one reference on `index`; frees the chunk when the count
    /// transitions from one to zero.
    pub fn release_ref(&self, index: u32) {
        let hdr = self.segment.chunk_header(index);
        let prev = hdr.sub_ref();
        if prev == 0 {
            violation("pool", format_args!("refcount underflow on chunk {index}"));
        }
        if prev == 1 {
            self.deallocate(index);
        }
    }

    /// Add `n` references ahead of a fan-out.
    pub(crate) fn add_refs(&self, index: u32, n: u8) {
        self.segment.chunk_header(index).add_refs(n);
    }

    /// Header of chunk `index`. Out-of-range indices abort.
    pub fn header(&self, index: u32) -> &ChunkHeader {
        self.segment.chunk_header(index)
    }

    pub(crate) fn payload_ptr(&self, index: u32) -> *mut u8 {
        self.segment.chunk_payload_ptr(index)
    }

    /// Event-flags word carrying `HAS_FREE_CHUNK`.
    pub(crate) fn waitset(&self) -> &std::sync::atomic::AtomicU32 {
        &self.segment.control().pool.waitset
    }

    // -- observability ------------------------------------------------------

    /// Chunks currently on the free list.
    pub fn remaining_free(&self) -> u32 {
        self.segment
            .control()
            .pool
            .free_count
            .load(Ordering::Acquire)
    }

    /// Chunks currently allocated.
    pub fn allocated(&self) -> u32 {
        self.max_chunks() - self.remaining_free()
    }

    pub fn is_exhausted(&self) -> bool {
        self.segment
            .control()
            .pool
            .free_list_head
            .load(Ordering::Acquire)
            == INVALID_CHUNK_INDEX
    }

    pub fn max_chunks(&self) -> u32 {
        self.segment.max_chunks()
    }

    pub fn chunk_size(&self) -> u32 {
        self.segment.chunk_size()
    }

    /// Walk the free list and return its length. Aborts if the walk exceeds
    /// the pool size (a cycle) or crosses a chunk that is not `Free`.
    ///
    /// Only meaningful while no other process is mutating the pool; meant
    /// for tests and diagnostics.
    pub fn free_list_len(&self) -> u32 {
        let ctrl = self.segment.control();
        let mut cursor = ctrl.pool.free_list_head.load(Ordering::Acquire);
        let mut len = 0u32;
        while cursor != INVALID_CHUNK_INDEX {
            if len > self.max_chunks() {
                violation("pool", format_args!("free list cycle detected"));
            }
            let hdr = self.segment.chunk_header(cursor);
            if hdr.state() != ChunkState::Free {
                violation(
                    "pool",
                    format_args!("free list crosses {} chunk {cursor}", hdr.state().as_str()),
                );
            }
            cursor = hdr.next_free_index();
            len += 1;
        }
        len
    }
}
