// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// Platform selection. The engine needs two things from the host: a named
// shared-memory object mapped read/write, and a park/wake primitive on a
// 32-bit word in that memory.

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub use posix::{futex_wait, futex_wake_all, FutexWait, ShmObject};

#[cfg(not(unix))]
compile_error!("shmbus requires a POSIX shared-memory platform");
