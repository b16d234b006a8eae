// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Build-time size regimes, runtime configuration, and the publish/subscribe
// policy enums.
//
// The size regime fixes the width of the registry's ready mask and the upper
// bounds on channel count and queue capacity. Segments are only compatible
// between processes built with the same regime; the regime id is folded into
// the layout version so a mismatched attach is rejected at validation.

use std::time::Duration;

use crate::error::{IpcError, Result};

#[cfg(all(feature = "mode_shrink", feature = "mode_extend"))]
compile_error!("features `mode_shrink` and `mode_extend` are mutually exclusive");

// ---------------------------------------------------------------------------
// Size regimes
// ---------------------------------------------------------------------------

/// Shrink regime: embedded targets, 8-bit ready mask.
#[cfg(feature = "mode_shrink")]
pub mod mode {
    /// Integer type backing the registry ready mask.
    pub type MaskBits = u8;
    /// Atomic counterpart of [`MaskBits`].
    pub type AtomicMask = std::sync::atomic::AtomicU8;

    pub const NAME: &str = "shrink";
    pub const MODE_ID: u32 = 1;
    /// Upper bound on channel slots (< mask width).
    pub const MAX_CHANNELS: usize = 2;
    /// Upper bound on per-subscriber queue capacity.
    pub const QUEUE_CAPACITY: usize = 64;
    pub const DEFAULT_MAX_CHUNKS: u32 = 64;
    pub const DEFAULT_CHUNK_SIZE: u32 = 16;
}

/// Extend regime: high fan-out, 64-bit ready mask.
#[cfg(feature = "mode_extend")]
pub mod mode {
    pub type MaskBits = u64;
    pub type AtomicMask = std::sync::atomic::AtomicU64;

    pub const NAME: &str = "extend";
    pub const MODE_ID: u32 = 3;
    pub const MAX_CHANNELS: usize = 62;
    pub const QUEUE_CAPACITY: usize = 1024;
    pub const DEFAULT_MAX_CHUNKS: u32 = 1024;
    pub const DEFAULT_CHUNK_SIZE: u32 = 1024;
}

/// Normal regime (default): 32-bit ready mask.
#[cfg(not(any(feature = "mode_shrink", feature = "mode_extend")))]
pub mod mode {
    pub type MaskBits = u32;
    pub type AtomicMask = std::sync::atomic::AtomicU32;

    pub const NAME: &str = "normal";
    pub const MODE_ID: u32 = 2;
    pub const MAX_CHANNELS: usize = 30;
    pub const QUEUE_CAPACITY: usize = 256;
    pub const DEFAULT_MAX_CHUNKS: u32 = 1024;
    pub const DEFAULT_CHUNK_SIZE: u32 = 1024;
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What `Publisher::loan` does when the chunk pool is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoanPolicy {
    /// Return `PoolExhausted` immediately.
    Error,
    /// Busy-poll the pool's `HasFreeChunk` flag.
    Wait,
    /// Park on the pool's `HasFreeChunk` flag until the timeout.
    #[default]
    Block,
}

/// What a producer-side write does when the subscriber's ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Drop the oldest unread element, then write.
    Overwrite,
    /// Report `ChannelFull`; the message is not enqueued for this subscriber.
    #[default]
    Drop,
    /// Same behavior as `Drop`; lets callers state the intent that a full
    /// queue is a fault rather than expected backpressure.
    Error,
    /// Park on `HasSpace` until the timeout.
    Block,
    /// Busy-poll `HasSpace`; shorter default timeout than `Block`.
    Wait,
}

/// What a consumer-side read does when its ring is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribePolicy {
    /// Return `ChannelEmpty` immediately.
    Skip,
    /// Same as `Skip`, stated as a fault.
    Error,
    /// Busy-poll `HasData`.
    Wait,
    /// Park on `HasData` until the timeout.
    #[default]
    Block,
}

/// Default timeout applied by the `Wait` (busy-poll) policies.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Segment configuration
// ---------------------------------------------------------------------------

/// Geometry and lifecycle options for a shared segment.
///
/// Only the creator's geometry matters: attachers read the authoritative
/// values back from the control block.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Number of chunks in the payload pool (>= 1).
    pub max_chunks: u32,
    /// Payload bytes per chunk (>= 1).
    pub chunk_size: u32,
    /// Number of channel slots to lay out (1..=`mode::MAX_CHANNELS`).
    pub max_channels: u32,
    /// Ring capacity per channel slot; power of two, at most
    /// `mode::QUEUE_CAPACITY`.
    pub queue_capacity: u32,
    /// Unlink the backing object when the last attached process detaches.
    pub auto_cleanup: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_chunks: mode::DEFAULT_MAX_CHUNKS,
            chunk_size: mode::DEFAULT_CHUNK_SIZE,
            max_channels: mode::MAX_CHANNELS as u32,
            queue_capacity: mode::QUEUE_CAPACITY as u32,
            auto_cleanup: true,
        }
    }
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chunks == 0 || self.chunk_size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if self.max_channels == 0 || self.max_channels as usize > mode::MAX_CHANNELS {
            return Err(IpcError::InvalidArgument);
        }
        if !self.queue_capacity.is_power_of_two()
            || self.queue_capacity as usize > mode::QUEUE_CAPACITY
        {
            return Err(IpcError::InvalidArgument);
        }
        Ok(())
    }

    pub fn with_max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: u32) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

// ---------------------------------------------------------------------------
// Publisher configuration
// ---------------------------------------------------------------------------

/// Configuration for a publisher port.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Payload bytes per chunk, used when this publisher creates the segment.
    pub chunk_size: u32,
    /// Pool size, used when this publisher creates the segment.
    pub max_chunks: u32,
    /// Behavior of `loan()` on an exhausted pool.
    pub loan_policy: LoanPolicy,
    /// Deadline for `Wait`/`Block` loans. `None` parks indefinitely.
    pub loan_timeout: Option<Duration>,
    /// Default per-subscriber write policy used by `send()`.
    pub publish_policy: PublishPolicy,
    /// Deadline for `Wait`/`Block` writes.
    pub publish_timeout: Option<Duration>,
    /// When `true`, `send()` with zero registered subscribers fails and
    /// hands the sample back; when `false` it succeeds with a delivery
    /// count of zero and the chunk returns to the pool.
    pub send_without_subscribers_is_error: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            chunk_size: mode::DEFAULT_CHUNK_SIZE,
            max_chunks: mode::DEFAULT_MAX_CHUNKS,
            loan_policy: LoanPolicy::default(),
            loan_timeout: Some(Duration::from_millis(100)),
            publish_policy: PublishPolicy::default(),
            publish_timeout: Some(Duration::from_millis(100)),
            send_without_subscribers_is_error: false,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chunks == 0 || self.chunk_size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        Ok(())
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    pub fn with_publish_policy(mut self, policy: PublishPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    pub fn with_loan_policy(mut self, policy: LoanPolicy) -> Self {
        self.loan_policy = policy;
        self
    }
}

// ---------------------------------------------------------------------------
// Subscriber configuration
// ---------------------------------------------------------------------------

/// Configuration for a subscriber port.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Ring capacity for this subscriber's channel; power of two, at most
    /// the segment's queue capacity.
    pub queue_capacity: u32,
    /// Behavior of `receive()` on an empty ring.
    pub read_policy: SubscribePolicy,
    /// Deadline for `Wait`/`Block` reads. `None` parks indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            queue_capacity: mode::QUEUE_CAPACITY as u32,
            read_policy: SubscribePolicy::default(),
            timeout: Some(Duration::from_millis(100)),
        }
    }
}

impl SubscriberConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.queue_capacity.is_power_of_two()
            || self.queue_capacity as usize > mode::QUEUE_CAPACITY
        {
            return Err(IpcError::InvalidArgument);
        }
        Ok(())
    }

    pub fn with_queue_capacity(mut self, queue_capacity: u32) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_read_policy(mut self, policy: SubscribePolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}
