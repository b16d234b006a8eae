// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// RAII sample handles over a single chunk.
//
// Two distinct types instead of one tagged handle: the type system then
// makes it impossible to send a received sample or write through one.
// Both are move-only; a drop on any exit path settles the chunk's
// reference count, so a sample can never leak a chunk inside one process.
// (A process that dies while holding a loaned sample leaks at most that
// one chunk — the publisher's send path is the owner of last resort for
// everything already in flight.)

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::error::{IpcError, Result};
use crate::pool::ChunkPool;

// ---------------------------------------------------------------------------
// LoanedSample — exclusive, writable, publisher-owned
// ---------------------------------------------------------------------------

/// Exclusive ownership of a loaned chunk. The payload is writable; the
/// sample is consumed by `Publisher::send` or returns the chunk to the pool
/// on drop.
pub struct LoanedSample {
    pool: ChunkPool,
    chunk_index: u32,
}

impl LoanedSample {
    pub(crate) fn from_raw(pool: ChunkPool, chunk_index: u32) -> Self {
        Self { pool, chunk_index }
    }

    /// Give up ownership without touching the refcount (send path).
    pub(crate) fn into_raw(self) -> u32 {
        let idx = self.chunk_index;
        std::mem::forget(self);
        idx
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    /// Full writable capacity of the chunk in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.chunk_size() as usize
    }

    /// Bytes of valid payload (defaults to the full capacity after loan).
    pub fn payload_size(&self) -> usize {
        self.pool.header(self.chunk_index).payload_size() as usize
    }

    /// Shrink the valid payload to `n` bytes.
    pub fn set_payload_size(&mut self, n: usize) -> Result<()> {
        if n > self.capacity() {
            return Err(IpcError::InvalidArgument);
        }
        self.pool.header(self.chunk_index).set_payload_size(n as u32);
        Ok(())
    }

    /// The valid payload, read-only.
    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.pool.payload_ptr(self.chunk_index), self.payload_size())
        }
    }

    /// The full chunk capacity, writable in place.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.payload_ptr(self.chunk_index), self.capacity())
        }
    }

    /// Copy `bytes` into the chunk and set the payload size to match.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity() {
            return Err(IpcError::InvalidArgument);
        }
        self.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        self.set_payload_size(bytes.len())
    }
}

impl Deref for LoanedSample {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl DerefMut for LoanedSample {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.payload_size();
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.payload_ptr(self.chunk_index), len)
        }
    }
}

impl Drop for LoanedSample {
    fn drop(&mut self) {
        // Loan dropped without sending: refcount 1 -> 0, chunk returns to
        // the pool, no subscriber observes anything.
        self.pool.release_ref(self.chunk_index);
    }
}

impl fmt::Debug for LoanedSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoanedSample")
            .field("chunk_index", &self.chunk_index)
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ReceivedSample — shared, read-only, subscriber-owned
// ---------------------------------------------------------------------------

/// One subscriber's reference on a delivered chunk. The payload is
/// read-only; dropping the sample releases the reference and may free the
/// chunk.
pub struct ReceivedSample {
    pool: ChunkPool,
    chunk_index: u32,
}

impl ReceivedSample {
    pub(crate) fn from_raw(pool: ChunkPool, chunk_index: u32) -> Self {
        Self { pool, chunk_index }
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    pub fn payload_size(&self) -> usize {
        self.pool.header(self.chunk_index).payload_size() as usize
    }

    /// The delivered payload.
    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.pool.payload_ptr(self.chunk_index), self.payload_size())
        }
    }
}

impl Deref for ReceivedSample {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl Drop for ReceivedSample {
    fn drop(&mut self) {
        self.pool.release_ref(self.chunk_index);
    }
}

impl fmt::Debug for ReceivedSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedSample")
            .field("chunk_index", &self.chunk_index)
            .field("payload_size", &self.payload_size())
            .finish()
    }
}
