// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Subscriber port: owns one channel slot for its lifetime, receives chunk
// indices from it and wraps them as read-only samples.
//
// Creation order matters: the slot capacity is validated before the slot is
// claimed, so nothing between claim and activation can fail and leak a
// ready-mask bit. Teardown mirrors it: deactivate (publishers stop
// enqueueing), unregister (snapshot rebuilt), then drain the ring so
// undelivered chunks give their references back to the pool.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::ReadChannel;
use crate::config::{SegmentConfig, SubscribePolicy, SubscriberConfig};
use crate::error::{violation, IpcError, Result};
use crate::layout::{ChunkState, INVALID_CHUNK_INDEX};
use crate::pool::ChunkPool;
use crate::registry::ChannelRegistry;
use crate::sample::ReceivedSample;
use crate::segment::Segment;

/// Lost-CAS retries before `create` gives up claiming a slot.
const SLOT_CLAIM_RETRIES: u32 = 64;

/// A typed handle for receiving from a named service.
pub struct Subscriber {
    segment: Arc<Segment>,
    pool: ChunkPool,
    registry: ChannelRegistry,
    slot_index: u32,
    config: SubscriberConfig,
}

impl Subscriber {
    /// Attach to (or create) the service segment, claim a channel slot,
    /// initialize its ring and register it with the registry.
    pub fn create(service: &str, config: SubscriberConfig) -> Result<Self> {
        config.validate()?;

        let segment = Segment::attach(service, &SegmentConfig::default())?;

        // The segment's queue region fixes the largest usable ring; a
        // subscriber asking for less just uses a prefix of its slot.
        let capacity = config.queue_capacity.min(segment.queue_capacity());
        if capacity < 2 {
            return Err(IpcError::InvalidArgument);
        }

        let registry = ChannelRegistry::new(Arc::clone(&segment));

        let mut slot_index = None;
        for _ in 0..SLOT_CLAIM_RETRIES {
            match registry.allocate_slot(None) {
                Ok(i) => {
                    slot_index = Some(i);
                    break;
                }
                Err(IpcError::Retry) => continue,
                Err(e) => return Err(e),
            }
        }
        let slot_index = slot_index.ok_or(IpcError::Retry)?;

        // A reused slot may carry stale state from its previous owner;
        // reset the header and refill the ring with the sentinel.
        let slot = segment.channel_slot(slot_index)?;
        slot.initialize(capacity);
        unsafe {
            let ring = slot.ring_ptr();
            for j in 0..segment.queue_capacity() as usize {
                ring.add(j).write(INVALID_CHUNK_INDEX);
            }
        }

        registry.register(slot_index)?;
        registry.activate_slot(slot_index)?;

        tracing::debug!(service, slot = slot_index, capacity, "subscriber created");

        Ok(Self {
            pool: ChunkPool::new(Arc::clone(&segment)),
            registry,
            segment,
            slot_index,
            config,
        })
    }

    /// Receive with the configured policy and timeout.
    pub fn receive(&self) -> Result<ReceivedSample> {
        self.receive_with_policy(self.config.read_policy, self.config.timeout)
    }

    /// Receive one sample, resolving an empty ring according to `policy`.
    ///
    /// The reference the publisher pre-added for this subscriber travels
    /// with the returned sample and is released on its drop.
    pub fn receive_with_policy(
        &self,
        policy: SubscribePolicy,
        timeout: Option<Duration>,
    ) -> Result<ReceivedSample> {
        let slot = self.segment.channel_slot(self.slot_index)?;
        if !slot.is_active() {
            // Slot was forcibly freed out from under us.
            return Err(IpcError::ChannelInvalid);
        }

        let channel = ReadChannel::attach(slot)?;
        let index = channel.read_with_policy(policy, timeout)?;

        if index == INVALID_CHUNK_INDEX {
            violation("subscriber", format_args!("sentinel index dequeued"));
        }

        let prev = self.pool.header(index).swap_state(ChunkState::Received);
        if !matches!(prev, ChunkState::Sent | ChunkState::Received) {
            violation(
                "subscriber",
                format_args!("received chunk {index} in state {}", prev.as_str()),
            );
        }

        Ok(ReceivedSample::from_raw(self.pool.clone(), index))
    }

    /// Messages currently waiting in this subscriber's ring.
    pub fn pending(&self) -> u32 {
        self.segment
            .channel_slot(self.slot_index)
            .ok()
            .and_then(|slot| ReadChannel::attach(slot).ok())
            .map_or(0, |ch| ch.len())
    }

    pub fn slot_index(&self) -> u32 {
        self.slot_index
    }

    pub fn service(&self) -> &str {
        self.segment.service()
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.registry.deactivate_slot(self.slot_index);
        self.registry.unregister(self.slot_index);

        // Undelivered chunks in the ring still carry this subscriber's
        // reference; give them back. Publishers stop enqueueing once the
        // active marker is clear, so one pass drains everything that made
        // it in.
        if let Ok(slot) = self.segment.channel_slot(self.slot_index) {
            if let Ok(channel) = ReadChannel::attach(slot) {
                while let Ok(index) = channel.read() {
                    if index != INVALID_CHUNK_INDEX {
                        self.pool.release_ref(index);
                    }
                }
            }
            slot.initialize(0);
        }
        tracing::debug!(slot = self.slot_index, "subscriber dropped");
    }
}
