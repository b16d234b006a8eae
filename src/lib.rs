// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Zero-copy, lock-free shared-memory publish/subscribe for a single host.
//
// A named segment holds a control block, one SPSC ring of chunk indices per
// subscriber, and a pool of fixed-size payload chunks. Publishers loan a
// chunk, write the payload in place and send the index; subscribers receive
// the index and read the same bytes. Reference counting on the chunk
// headers makes broadcast fan-out safe, and a futex-backed wait primitive
// provides the blocking flavors of every operation. No mutex is taken on
// any message path.

pub mod shm_name;

mod platform;
mod spin_lock;

pub mod error;
pub use error::{IpcError, Result};

pub mod config;
pub use config::{
    mode, LoanPolicy, PublishPolicy, PublisherConfig, SegmentConfig, SubscribePolicy,
    SubscriberConfig,
};

pub mod layout;
pub use layout::{
    ChannelSlot, ChunkHeader, ChunkState, ControlBlock, SubscriberSnapshot, INVALID_CHUNK_INDEX,
    LAYOUT_VERSION, SEGMENT_MAGIC,
};

pub mod waitset;
pub use waitset::event_flag;

pub mod segment;
pub use segment::Segment;

pub mod pool;
pub use pool::ChunkPool;

pub mod channel;
pub use channel::{ReadChannel, WriteChannel};

pub mod registry;
pub use registry::ChannelRegistry;

pub mod sample;
pub use sample::{LoanedSample, ReceivedSample};

pub mod publisher;
pub use publisher::{Publisher, SendError};

pub mod subscriber;
pub use subscriber::Subscriber;
