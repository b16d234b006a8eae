// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// On-segment data structures and sizing arithmetic.
//
// Everything here is `repr(C)` and position-independent: the segment holds
// indices and byte offsets only, never host-absolute pointers, so every
// process can map it at a different address. Layout:
//
//   offset 0:                control block          (cache-line aligned)
//   offset queue_region:     channel_slot[0..max_channels-1]
//                            each slot: ChannelSlot + u32 ring[queue_capacity]
//   offset pool_region:      chunk[0..max_chunks-1]
//                            each chunk: ChunkHeader + payload[chunk_size]
//
// All offsets are constants once the creator's geometry is known; attachers
// read the geometry back from the control block.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::config::{mode, SegmentConfig};
use crate::error::violation;

/// Magic word at offset 0 of every valid segment ("SHMB").
pub const SEGMENT_MAGIC: u32 = 0x5348_4D42;

/// Layout version this build produces and accepts. The size regime is folded
/// in so that, e.g., a shrink build can never attach a normal segment.
pub const LAYOUT_VERSION: u32 = 0x0001_0000 | mode::MODE_ID;

/// Cache line size used for all region alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Segments are rounded up to this boundary (2 MiB, huge-page friendly).
pub const SEGMENT_ALIGNMENT: usize = 2 * 1024 * 1024;

/// Sentinel chunk index: free-list terminator and ring-slot filler.
pub const INVALID_CHUNK_INDEX: u32 = u32::MAX;

/// Sentinel filler for unused snapshot entries.
pub const INVALID_SLOT_ENTRY: u8 = 0xFF;

/// Round `n` up to a multiple of `align` (a power of two).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Chunk state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a chunk.
///
/// ```text
/// Free -> Loaned      (pool allocate)
/// Loaned -> Sent      (publisher send)
/// Sent -> Received    (subscriber receive)
/// {Loaned, Sent, Received} -> Free   (last reference released)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    /// Linked on the free list, refcount zero.
    Free = 0,
    /// Exclusively owned by one publisher, refcount one.
    Loaned = 1,
    /// Enqueued for at least one subscriber.
    Sent = 2,
    /// Dequeued by at least one subscriber.
    Received = 3,
}

impl ChunkState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::Loaned),
            2 => Some(Self::Sent),
            3 => Some(Self::Received),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Loaned => "loaned",
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkHeader — 16 bytes in front of every payload
// ---------------------------------------------------------------------------

/// Header preceding each chunk payload in the pool region.
#[repr(C)]
pub struct ChunkHeader {
    /// `ChunkState` discriminant.
    state: AtomicU8,
    /// Live references: loaning publisher plus every undropped received
    /// sample plus every copy still sitting in a ring.
    ref_count: AtomicU8,
    _pad: [u8; 2],
    /// Bytes of valid payload, written by the loaning publisher.
    payload_size: AtomicU32,
    /// Next chunk on the free list, `INVALID_CHUNK_INDEX` at the tail.
    next_free_index: AtomicU32,
    /// This chunk's own index.
    chunk_index: AtomicU32,
}

impl ChunkHeader {
    pub(crate) fn initialize(&self, index: u32, next_free: u32) {
        self.state.store(ChunkState::Free as u8, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.payload_size.store(0, Ordering::Relaxed);
        self.chunk_index.store(index, Ordering::Relaxed);
        self.next_free_index.store(next_free, Ordering::Release);
    }

    /// Current state; aborts on a discriminant the protocol cannot produce.
    pub fn state(&self) -> ChunkState {
        let raw = self.state.load(Ordering::Acquire);
        match ChunkState::from_u8(raw) {
            Some(s) => s,
            None => violation("chunk", format_args!("impossible state {raw}")),
        }
    }

    /// Swap the state, returning the previous one.
    pub(crate) fn swap_state(&self, next: ChunkState) -> ChunkState {
        let raw = self.state.swap(next as u8, Ordering::AcqRel);
        match ChunkState::from_u8(raw) {
            Some(s) => s,
            None => violation("chunk", format_args!("impossible state {raw}")),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire) as u32
    }

    pub(crate) fn store_ref_count(&self, n: u8) {
        self.ref_count.store(n, Ordering::Release);
    }

    /// Add `n` references; returns the previous count.
    pub(crate) fn add_refs(&self, n: u8) -> u8 {
        self.ref_count.fetch_add(n, Ordering::AcqRel)
    }

    /// Drop one reference; returns the previous count.
    pub(crate) fn sub_ref(&self) -> u8 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel)
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_payload_size(&self, n: u32) {
        self.payload_size.store(n, Ordering::Relaxed);
    }

    pub fn next_free_index(&self) -> u32 {
        self.next_free_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_free_index(&self, next: u32) {
        self.next_free_index.store(next, Ordering::Relaxed);
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ChannelSlot — fixed header of each subscriber queue
// ---------------------------------------------------------------------------

/// Header of one subscriber queue slot. The `u32` chunk-index ring follows
/// immediately after this struct in memory.
///
/// `head` is advanced by the owning consumer; `tail` only by the producer.
/// Under the `Overwrite` publish policy the producer may also advance `head`,
/// which is why both sides move `head` with compare-exchange rather than a
/// blind store.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ChannelSlot {
    /// Nonzero once the owning subscriber is ready to be iterated.
    pub active: AtomicU8,
    /// Reserved minimum delivery interval (milliseconds) for rate limiting.
    pub min_interval: AtomicU8,
    _pad: [u8; 2],
    /// Ring capacity (power of two). Zero marks an uninitialized slot.
    pub capacity: AtomicU32,
    /// Consumer index (wrapped).
    pub head: AtomicU32,
    /// Producer index (wrapped).
    pub tail: AtomicU32,
    /// Event-flags word for the wait primitive.
    pub waitset: AtomicU32,
}

impl ChannelSlot {
    /// Reset the slot. `capacity` may be zero (slot parked, not usable).
    pub(crate) fn initialize(&self, capacity: u32) {
        self.active.store(0, Ordering::Relaxed);
        self.min_interval.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.waitset
            .store(crate::waitset::event_flag::NONE, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// Pointer to the ring that follows this header.
    ///
    /// # Safety
    /// The slot must live inside a segment laid out by this crate, with at
    /// least `capacity` ring entries behind it.
    pub(crate) unsafe fn ring_ptr(&self) -> *mut u32 {
        (self as *const ChannelSlot).add(1) as *mut u32
    }
}

// ---------------------------------------------------------------------------
// SubscriberSnapshot — compact registry view
// ---------------------------------------------------------------------------

/// Value-copyable record of the currently registered subscriber queues,
/// in ascending slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SubscriberSnapshot {
    /// Number of valid entries in `queue_indices`.
    pub count: u8,
    /// Bumped on every rebuild.
    pub version: u8,
    /// Slot indices of registered subscribers, low to high;
    /// `INVALID_SLOT_ENTRY` beyond `count`.
    pub queue_indices: [u8; mode::MAX_CHANNELS],
}

impl SubscriberSnapshot {
    pub(crate) fn cleared() -> Self {
        Self {
            count: 0,
            version: 0,
            queue_indices: [INVALID_SLOT_ENTRY; mode::MAX_CHANNELS],
        }
    }

    /// The valid prefix of `queue_indices`.
    pub fn indices(&self) -> &[u8] {
        &self.queue_indices[..self.count as usize]
    }
}

// ---------------------------------------------------------------------------
// ControlBlock — fixed on-segment header
// ---------------------------------------------------------------------------

/// Geometry and identity, one cache line.
#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub max_chunks: AtomicU32,
    pub chunk_size: AtomicU32,
    pub max_channels: AtomicU32,
    pub queue_capacity: AtomicU32,
    /// Number of currently attached processes.
    pub attach_count: AtomicU32,
}

/// Chunk-pool shared state, one cache line.
#[repr(C, align(64))]
pub struct PoolState {
    /// Head of the free list, `INVALID_CHUNK_INDEX` when exhausted.
    pub free_list_head: AtomicU32,
    /// Chunks currently on the free list.
    pub free_count: AtomicU32,
    /// Event-flags word carrying `HAS_FREE_CHUNK` for blocking loans.
    pub waitset: AtomicU32,
}

/// Registry control words, one cache line.
#[repr(C, align(64))]
pub struct RegistryControl {
    /// Bit `i` set = slot `i` allocated to a live subscriber.
    pub ready_mask: mode::AtomicMask,
    /// Monotone change counter, used as a futex word for registry changes.
    pub sequence: AtomicU32,
    /// Spin word serializing snapshot rebuild + flip.
    pub lock: AtomicU32,
    /// Which of the two snapshots publishers should read (0 or 1).
    pub active_snapshot_index: AtomicU8,
    /// Registered subscriber count.
    pub subscriber_count: AtomicU8,
}

/// Fixed header at offset 0 of the segment.
#[repr(C, align(64))]
pub struct ControlBlock {
    pub header: SegmentHeader,
    pub pool: PoolState,
    pub registry: RegistryControl,
    /// Double-buffered snapshots; writers mutate the inactive one only,
    /// under `registry.lock`, then flip `active_snapshot_index`.
    pub snapshots: [UnsafeCell<SubscriberSnapshot>; 2],
}

// The snapshot cells are only written under the registry spin word and only
// read through the seqlock-style retry in the registry; everything else in
// the block is atomic.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    /// Write the initial state for a freshly created segment. Magic and
    /// version are NOT published here; call [`publish`](Self::publish) after
    /// the rest of the segment (slots, pool) is initialized.
    pub(crate) fn initialize(&self, cfg: &SegmentConfig) {
        self.header.magic.store(0, Ordering::Relaxed);
        self.header.version.store(0, Ordering::Relaxed);
        self.header.max_chunks.store(cfg.max_chunks, Ordering::Relaxed);
        self.header.chunk_size.store(cfg.chunk_size, Ordering::Relaxed);
        self.header
            .max_channels
            .store(cfg.max_channels, Ordering::Relaxed);
        self.header
            .queue_capacity
            .store(cfg.queue_capacity, Ordering::Relaxed);
        self.header.attach_count.store(0, Ordering::Relaxed);

        self.pool
            .free_list_head
            .store(INVALID_CHUNK_INDEX, Ordering::Relaxed);
        self.pool.free_count.store(0, Ordering::Relaxed);
        self.pool
            .waitset
            .store(crate::waitset::event_flag::NONE, Ordering::Relaxed);

        self.registry.ready_mask.store(0, Ordering::Relaxed);
        self.registry.sequence.store(0, Ordering::Relaxed);
        self.registry.lock.store(0, Ordering::Relaxed);
        self.registry
            .active_snapshot_index
            .store(0, Ordering::Relaxed);
        self.registry.subscriber_count.store(0, Ordering::Relaxed);

        for cell in &self.snapshots {
            unsafe { cell.get().write(SubscriberSnapshot::cleared()) };
        }
    }

    /// Publish magic and version with release ordering. Everything stored
    /// before this call is visible to any process whose `validate` succeeds.
    pub(crate) fn publish(&self) {
        self.header.version.store(LAYOUT_VERSION, Ordering::Release);
        self.header.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Check magic and layout version.
    pub fn validate(&self) -> bool {
        self.header.magic.load(Ordering::Acquire) == SEGMENT_MAGIC
            && self.header.version.load(Ordering::Acquire) == LAYOUT_VERSION
    }

    pub(crate) fn snapshot_cell(&self, index: usize) -> *mut SubscriberSnapshot {
        self.snapshots[index & 1].get()
    }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Bytes reserved for the control block region.
pub fn control_block_size() -> usize {
    align_up(std::mem::size_of::<ControlBlock>(), CACHE_LINE_SIZE)
}

/// Byte offset of the channel-slot region.
pub fn queue_region_offset() -> usize {
    control_block_size()
}

/// Cache-line-aligned stride of one channel slot (header + ring).
pub fn channel_slot_stride(queue_capacity: u32) -> usize {
    align_up(
        std::mem::size_of::<ChannelSlot>() + queue_capacity as usize * std::mem::size_of::<u32>(),
        CACHE_LINE_SIZE,
    )
}

/// Cache-line-aligned stride of one chunk (header + payload).
pub fn chunk_stride(chunk_size: u32) -> usize {
    align_up(
        std::mem::size_of::<ChunkHeader>() + chunk_size as usize,
        CACHE_LINE_SIZE,
    )
}

/// Byte offset of the chunk pool region.
pub fn pool_region_offset(max_channels: u32, queue_capacity: u32) -> usize {
    queue_region_offset() + max_channels as usize * channel_slot_stride(queue_capacity)
}

/// Total segment size for a configuration, rounded up to
/// [`SEGMENT_ALIGNMENT`].
pub fn total_segment_size(cfg: &SegmentConfig) -> usize {
    let raw = pool_region_offset(cfg.max_channels, cfg.queue_capacity)
        + cfg.max_chunks as usize * chunk_stride(cfg.chunk_size);
    align_up(raw, SEGMENT_ALIGNMENT)
}
