// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Segment manager: creates or attaches the named shared-memory segment and
// hands out typed views into its regions.
//
// Creation is exactly-once. The winner of the `O_EXCL` race initializes the
// whole segment (control block, parked channel slots with sentinel-filled
// rings, linked chunk pool) and only then publishes magic + version with
// release ordering. A loser that maps the segment mid-initialization sees
// magic still unset and polls it for a short grace window before giving up
// with `InvalidMagic`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SegmentConfig;
use crate::error::{violation, IpcError, Result};
use crate::layout::{
    self, ChannelSlot, ChunkHeader, ControlBlock, INVALID_CHUNK_INDEX,
};
use crate::platform::ShmObject;
use crate::pool;
use crate::shm_name;

/// How long an attacher waits for a racing creator to finish initializing.
const ATTACH_GRACE: Duration = Duration::from_millis(500);

/// A mapped shared-memory segment plus its cached geometry.
///
/// All cross-process state lives in the mapping; a `Segment` value itself
/// holds only the base pointer, strides, and lifecycle bookkeeping.
#[derive(Debug)]
pub struct Segment {
    shm: ShmObject,
    service: String,
    is_creator: bool,
    auto_cleanup: bool,
    // Geometry, read back from the control block at attach time.
    max_chunks: u32,
    chunk_size: u32,
    max_channels: u32,
    queue_capacity: u32,
    queue_slot_stride: usize,
    chunk_stride: usize,
    pool_offset: usize,
}

impl Segment {
    /// Create the named segment or attach to an existing one.
    ///
    /// `config` supplies the geometry when this call ends up creating the
    /// segment; on attach the authoritative geometry is read back from the
    /// control block and `config` only contributes `auto_cleanup`.
    pub fn attach(service: &str, config: &SegmentConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let posix_name = shm_name::segment_name(service);
        let total = layout::total_segment_size(config);

        let (shm, is_creator) = match ShmObject::create_exclusive(&posix_name, total)? {
            Some(shm) => (shm, true),
            None => {
                // The racing creator may not have sized the object yet;
                // retry the open within the same grace window validation
                // gets below.
                let deadline = Instant::now() + ATTACH_GRACE;
                let shm = loop {
                    match ShmObject::open_existing(&posix_name) {
                        Ok(shm) if shm.size() >= layout::control_block_size() => break shm,
                        Ok(_) | Err(IpcError::SegmentMapFailed) => {
                            if Instant::now() >= deadline {
                                return Err(IpcError::SegmentMapFailed);
                            }
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => return Err(e),
                    }
                };
                (shm, false)
            }
        };

        let ctrl = unsafe { &*(shm.base() as *const ControlBlock) };

        if is_creator {
            // ftruncate produced an all-zero mapping; lay the regions down.
            ctrl.initialize(config);
        } else {
            let deadline = Instant::now() + ATTACH_GRACE;
            while !ctrl.validate() {
                if Instant::now() >= deadline {
                    return Err(IpcError::InvalidMagic);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let max_chunks = ctrl.header.max_chunks.load(Ordering::Acquire);
        let chunk_size = ctrl.header.chunk_size.load(Ordering::Acquire);
        let max_channels = ctrl.header.max_channels.load(Ordering::Acquire);
        let queue_capacity = ctrl.header.queue_capacity.load(Ordering::Acquire);

        let chunk_stride = layout::chunk_stride(chunk_size);
        let pool_offset = layout::pool_region_offset(max_channels, queue_capacity);

        if !is_creator {
            // The stat'd size must cover the geometry the control block
            // claims, otherwise the object is not one of ours.
            let expected = pool_offset + max_chunks as usize * chunk_stride;
            if shm.size() < expected {
                return Err(IpcError::InvalidMagic);
            }
        }

        let segment = Self {
            shm,
            service: service.to_string(),
            is_creator,
            auto_cleanup: config.auto_cleanup,
            max_chunks,
            chunk_size,
            max_channels,
            queue_capacity,
            queue_slot_stride: layout::channel_slot_stride(queue_capacity),
            chunk_stride,
            pool_offset,
        };

        if is_creator {
            segment.init_channel_slots();
            pool::initialize_pool(&segment);
            segment.control().publish();
        }

        segment
            .control()
            .header
            .attach_count
            .fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            service,
            creator = is_creator,
            max_chunks,
            chunk_size,
            max_channels,
            queue_capacity,
            "segment attached"
        );

        Ok(Arc::new(segment))
    }

    /// Park every channel slot (capacity zero) and fill its ring with the
    /// invalid-index sentinel so a torn entry can never alias chunk 0.
    fn init_channel_slots(&self) {
        for i in 0..self.max_channels {
            let slot = self.channel_slot_unchecked(i);
            slot.initialize(0);
            let ring = unsafe { slot.ring_ptr() };
            for j in 0..self.queue_capacity as usize {
                unsafe { ring.add(j).write(INVALID_CHUNK_INDEX) };
            }
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Base pointer of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.shm.base()
    }

    /// The on-segment control block.
    pub fn control(&self) -> &ControlBlock {
        unsafe { &*(self.shm.base() as *const ControlBlock) }
    }

    /// Whether this process created (and initialized) the segment.
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// The service name this segment was attached under.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn max_chunks(&self) -> u32 {
        self.max_chunks
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn max_channels(&self) -> u32 {
        self.max_channels
    }

    pub fn queue_capacity(&self) -> u32 {
        self.queue_capacity
    }

    /// Header of channel slot `index`.
    pub fn channel_slot(&self, index: u32) -> Result<&ChannelSlot> {
        if index >= self.max_channels {
            return Err(IpcError::InvalidChannelIndex);
        }
        Ok(self.channel_slot_unchecked(index))
    }

    fn channel_slot_unchecked(&self, index: u32) -> &ChannelSlot {
        unsafe {
            let addr = self
                .shm
                .base()
                .add(layout::queue_region_offset() + index as usize * self.queue_slot_stride);
            &*(addr as *const ChannelSlot)
        }
    }

    /// Header of chunk `index`. Out-of-range indices are a protocol break.
    pub(crate) fn chunk_header(&self, index: u32) -> &ChunkHeader {
        if index >= self.max_chunks {
            violation(
                "segment",
                format_args!("chunk index {index} out of range (max {})", self.max_chunks),
            );
        }
        unsafe {
            let addr = self
                .shm
                .base()
                .add(self.pool_offset + index as usize * self.chunk_stride);
            &*(addr as *const ChunkHeader)
        }
    }

    /// Payload bytes of chunk `index` (immediately after its header).
    pub(crate) fn chunk_payload_ptr(&self, index: u32) -> *mut u8 {
        // Bounds enforced by chunk_header.
        let _ = self.chunk_header(index);
        unsafe {
            self.shm.base().add(
                self.pool_offset
                    + index as usize * self.chunk_stride
                    + std::mem::size_of::<ChunkHeader>(),
            )
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let prev = self
            .control()
            .header
            .attach_count
            .fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(service = %self.service, remaining = prev.saturating_sub(1), "segment detached");
        if prev <= 1 && self.auto_cleanup {
            self.shm.unlink();
        }
    }
}
