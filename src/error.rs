// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Error taxonomy for the shared-memory pub/sub engine.
//
// Every recoverable failure surfaces as an `IpcError` returned to the
// immediate caller; nothing unwinds across the public API. Broken shared
// memory invariants (impossible chunk states, out-of-range indices handed to
// the pool) go through `violation()`: a structured line on stderr, then
// process abort. Those cannot be recovered from — the segment is shared and
// already corrupt.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = IpcError> = std::result::Result<T, E>;

/// All recoverable error kinds produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    // -- segment ------------------------------------------------------------
    /// `shm_open(O_CREAT | O_EXCL)` or `ftruncate` failed.
    #[error("shared memory segment creation failed")]
    SegmentCreateFailed,

    /// `mmap` of the segment failed.
    #[error("shared memory segment mapping failed")]
    SegmentMapFailed,

    /// The named segment does not exist and creation was not requested.
    #[error("shared memory segment not found")]
    SegmentNotFound,

    /// `fstat` on an existing segment failed.
    #[error("shared memory segment stat failed")]
    SegmentStatFailed,

    /// Magic or layout version of an existing segment does not match this
    /// build. The segment is rejected without side effects.
    #[error("segment magic or layout version mismatch")]
    InvalidMagic,

    // -- chunk pool ---------------------------------------------------------
    /// No free chunk is available.
    #[error("chunk pool exhausted")]
    PoolExhausted,

    // -- channel ------------------------------------------------------------
    /// The channel slot has not been initialized (capacity is zero) or the
    /// owning subscriber is gone.
    #[error("channel not initialized")]
    ChannelInvalid,

    /// The ring is full and the caller's policy asked to report it.
    #[error("channel full")]
    ChannelFull,

    /// The ring is empty and the caller's policy asked to report it.
    #[error("channel empty")]
    ChannelEmpty,

    /// A blocking or polling channel operation ran out of time.
    #[error("channel operation timed out")]
    ChannelTimeout,

    /// The policy needs an event-flags word but the channel has none.
    #[error("channel has no waitset attached")]
    ChannelWaitsetUnavailable,

    /// Woken from a blocking wait but the ring condition is still unmet.
    /// Callers may simply retry.
    #[error("spurious wakeup, condition still unmet")]
    ChannelSpuriousWakeup,

    /// The requested policy is not supported by this channel half.
    #[error("policy not supported on this channel")]
    ChannelPolicyNotSupported,

    /// The requested channel slot is already owned by a live subscriber.
    #[error("channel slot already in use")]
    ChannelAlreadyInUse,

    /// The channel slot exists but is not active (subscriber not ready or
    /// already tearing down).
    #[error("channel slot not found or inactive")]
    ChannelNotFound,

    // -- registry -----------------------------------------------------------
    /// A slot index outside `0..max_channels`.
    #[error("channel index out of range")]
    InvalidChannelIndex,

    /// Lost a CAS race on the ready mask; the operation may be re-invoked.
    #[error("lost a registry race, call again")]
    Retry,

    /// Every channel slot is taken.
    #[error("all channel slots are taken")]
    Exhausted,

    // -- general ------------------------------------------------------------
    /// A configuration or argument failed validation.
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation would block and the caller asked not to.
    #[error("operation would block")]
    WouldBlock,

    /// A resource other than chunks or slots ran out.
    #[error("resource exhausted")]
    ResourceExhausted,
}

impl IpcError {
    /// `true` for errors that a caller can sensibly retry without changing
    /// anything (`Retry`, full/empty under drop-style policies, timeouts).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Retry
                | Self::ChannelFull
                | Self::ChannelEmpty
                | Self::ChannelTimeout
                | Self::ChannelSpuriousWakeup
                | Self::PoolExhausted
                | Self::WouldBlock
        )
    }

    /// `true` when the caller is expected to re-invoke the same operation.
    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

// ---------------------------------------------------------------------------
// Violation path
// ---------------------------------------------------------------------------

/// Abort the process after reporting a broken shared-memory invariant.
///
/// Used when a chunk index is out of range or a chunk is found in a state
/// the protocol cannot produce. The segment is shared with other processes,
/// so continuing would propagate corruption.
#[cold]
pub(crate) fn violation(component: &str, detail: std::fmt::Arguments<'_>) -> ! {
    eprintln!("[shmbus violation] {component}: {detail}");
    std::process::abort();
}
