// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Publisher port: loan a chunk, write the payload in place, send the chunk
// index to every registered subscriber.
//
// Send is fan-out with pre-increment accounting: the chunk's refcount is
// raised by the snapshot count before the first enqueue, each failed
// enqueue compensates by one, and the publisher's own original reference
// is released last. Subscribers can therefore pop and drop concurrently
// with the loop without ever observing a count borrowed from the future,
// and the final release is the owner of last resort — whatever happened
// per subscriber, the chunk either reached someone or went back to the
// pool. A send never leaks a chunk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::channel::WriteChannel;
use crate::config::{
    LoanPolicy, PublishPolicy, PublisherConfig, SegmentConfig, DEFAULT_POLL_TIMEOUT,
};
use crate::error::{violation, IpcError, Result};
use crate::layout::ChunkState;
use crate::pool::ChunkPool;
use crate::registry::ChannelRegistry;
use crate::sample::LoanedSample;
use crate::segment::Segment;
use crate::waitset::{self, event_flag};

/// Failure of a consuming [`Publisher::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// No subscriber is registered and the publisher is configured to treat
    /// that as an error. The untouched sample is handed back so the caller
    /// can retry or drop it.
    #[error("no subscribers registered")]
    NoSubscribers(LoanedSample),

    /// Every enqueue failed; the chunk went back to the pool. Carries the
    /// first representative per-subscriber error.
    #[error("delivery failed: {0}")]
    Delivery(IpcError),
}

impl SendError {
    /// Recover the sample from a `NoSubscribers` failure.
    pub fn into_sample(self) -> Option<LoanedSample> {
        match self {
            Self::NoSubscribers(sample) => Some(sample),
            Self::Delivery(_) => None,
        }
    }
}

/// A typed handle for publishing into a named service.
pub struct Publisher {
    segment: Arc<Segment>,
    pool: ChunkPool,
    registry: ChannelRegistry,
    config: PublisherConfig,
}

impl Publisher {
    /// Attach to (or create) the service segment and build a publisher.
    ///
    /// When the segment already exists its pool geometry wins; a publisher
    /// whose configured chunk size does not fit the existing pool is
    /// rejected with `InvalidArgument`.
    pub fn create(service: &str, config: PublisherConfig) -> Result<Self> {
        config.validate()?;

        let seg_cfg = SegmentConfig::default()
            .with_max_chunks(config.max_chunks)
            .with_chunk_size(config.chunk_size);
        let segment = Segment::attach(service, &seg_cfg)?;

        if segment.chunk_size() < config.chunk_size {
            return Err(IpcError::InvalidArgument);
        }

        Ok(Self {
            pool: ChunkPool::new(Arc::clone(&segment)),
            registry: ChannelRegistry::new(Arc::clone(&segment)),
            segment,
            config,
        })
    }

    /// Loan a chunk for in-place writing.
    ///
    /// On an exhausted pool the configured [`LoanPolicy`] decides: fail
    /// immediately, busy-poll `HasFreeChunk`, or park on it until the loan
    /// timeout runs out.
    pub fn loan(&self) -> Result<LoanedSample> {
        match self.pool.allocate() {
            Ok(idx) => return Ok(LoanedSample::from_raw(self.pool.clone(), idx)),
            Err(IpcError::PoolExhausted) => {}
            Err(e) => return Err(e),
        }

        if self.config.loan_policy == LoanPolicy::Error {
            return Err(IpcError::PoolExhausted);
        }

        let deadline = self.config.loan_timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(dl) => {
                    let r = dl.saturating_duration_since(Instant::now());
                    if r.is_zero() {
                        return Err(IpcError::PoolExhausted);
                    }
                    Some(r)
                }
                None => None,
            };

            match self.config.loan_policy {
                LoanPolicy::Wait => {
                    let window = remaining.unwrap_or(DEFAULT_POLL_TIMEOUT).min(DEFAULT_POLL_TIMEOUT);
                    waitset::poll_for_flags(self.pool.waitset(), event_flag::HAS_FREE_CHUNK, window);
                }
                LoanPolicy::Block => {
                    if waitset::wait_for_flags(
                        self.pool.waitset(),
                        event_flag::HAS_FREE_CHUNK,
                        remaining,
                    )
                    .is_err()
                    {
                        return Err(IpcError::PoolExhausted);
                    }
                }
                LoanPolicy::Error => unreachable!(),
            }

            match self.pool.allocate() {
                Ok(idx) => return Ok(LoanedSample::from_raw(self.pool.clone(), idx)),
                Err(IpcError::PoolExhausted) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send with the configured default policy and timeout.
    pub fn send(&self, sample: LoanedSample) -> std::result::Result<usize, SendError> {
        self.send_with_policy(sample, self.config.publish_policy, self.config.publish_timeout)
    }

    /// Send `sample` to every subscriber in the current registry snapshot,
    /// resolving full rings according to `policy`.
    ///
    /// Returns the number of subscribers the chunk was enqueued for.
    /// Subscribers that register after the snapshot was taken do not see
    /// this message.
    pub fn send_with_policy(
        &self,
        sample: LoanedSample,
        policy: PublishPolicy,
        timeout: Option<Duration>,
    ) -> std::result::Result<usize, SendError> {
        let snap = self.registry.snapshot();
        let fanout = snap.count as usize;

        if fanout == 0 {
            if self.config.send_without_subscribers_is_error {
                return Err(SendError::NoSubscribers(sample));
            }
            // Nothing to deliver; dropping the sample recycles the chunk.
            return Ok(0);
        }

        let chunk = sample.into_raw();
        let hdr = self.pool.header(chunk);

        let prev = hdr.swap_state(ChunkState::Sent);
        if prev != ChunkState::Loaned {
            violation(
                "publisher",
                format_args!("sending chunk {chunk} in state {}", prev.as_str()),
            );
        }

        // One reference per enqueue about to be attempted, on top of the
        // publisher's own. Failed enqueues compensate below.
        self.pool.add_refs(chunk, fanout as u8);

        let mut delivered = 0usize;
        let mut first_err: Option<IpcError> = None;

        for &qi in snap.indices() {
            match self.enqueue_one(qi as u32, chunk, policy, timeout) {
                Ok(dropped) => {
                    delivered += 1;
                    if let Some(victim) = dropped {
                        // Overwrite displaced an undelivered chunk; settle
                        // its ring reference.
                        self.pool.release_ref(victim);
                    }
                }
                Err(e) => {
                    self.pool.release_ref(chunk);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    tracing::trace!(slot = qi, error = %e, "enqueue skipped subscriber");
                }
            }
        }

        // Owner of last resort: drop the publisher's original reference.
        // If nobody got the chunk this is the 1 -> 0 transition that
        // returns it to the pool.
        self.pool.release_ref(chunk);

        if delivered > 0 {
            Ok(delivered)
        } else {
            Err(SendError::Delivery(
                first_err.unwrap_or(IpcError::ChannelNotFound),
            ))
        }
    }

    fn enqueue_one(
        &self,
        slot_index: u32,
        chunk: u32,
        policy: PublishPolicy,
        timeout: Option<Duration>,
    ) -> Result<Option<u32>> {
        let slot = self.segment.channel_slot(slot_index)?;
        if !slot.is_active() {
            return Err(IpcError::ChannelNotFound);
        }
        let channel = WriteChannel::attach(slot)?;
        channel.write_with_policy(chunk, policy, timeout)
    }

    /// Park until at least `count` subscribers are registered.
    /// Returns `Ok(false)` on timeout.
    pub fn wait_for_subscribers(&self, count: u32, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Read the sequence before the count so a registration landing
            // in between wakes the wait below instead of being missed.
            let seen = self.registry.sequence();
            if self.registry.subscriber_count() >= count {
                return Ok(true);
            }
            let remaining = match deadline {
                Some(dl) => {
                    let r = dl.saturating_duration_since(Instant::now());
                    if r.is_zero() {
                        return Ok(false);
                    }
                    Some(r)
                }
                None => None,
            };
            match self.registry.wait_for_change(seen, remaining) {
                Ok(()) => continue,
                Err(IpcError::WouldBlock) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    // -- observability ------------------------------------------------------

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn subscriber_count(&self) -> u32 {
        self.registry.subscriber_count()
    }

    pub fn service(&self) -> &str {
        self.segment.service()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }
}
