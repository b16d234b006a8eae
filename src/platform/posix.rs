// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmbus contributors
//
// POSIX shared memory (shm_open/ftruncate/mmap) and the futex-backed
// park/wake primitive.
//
// On Linux the park/wake pair is the raw futex syscall with FUTEX_WAIT /
// FUTEX_WAKE (the non-private form, since the word lives in memory shared
// between processes). Other unices get a sleep-poll fallback: `futex_wait`
// naps briefly and reports a spurious wake, `futex_wake_all` is a no-op.
// Callers must therefore always re-check their condition after waking,
// which the waitset layer does.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::error::{IpcError, Result};

// ---------------------------------------------------------------------------
// ShmObject — a named, mapped shared-memory object
// ---------------------------------------------------------------------------

/// A named POSIX shared-memory object mapped read/write into this process.
///
/// The mapping is released on drop; the backing object is only removed by an
/// explicit [`ShmObject::unlink`] / [`unlink_by_name`].
#[derive(Debug)]
pub struct ShmObject {
    mem: *mut u8,
    size: usize,
    name: String, // POSIX name (with leading '/')
}

// The mapped region is shared between processes by design; all mutation of
// shared state goes through atomics with the orderings the protocol defines.
unsafe impl Send for ShmObject {}
unsafe impl Sync for ShmObject {}

impl ShmObject {
    /// Exactly-once creation: `O_CREAT | O_EXCL` of `size` bytes.
    ///
    /// Returns `Ok(None)` when the object already exists (the caller lost
    /// the create race and should attach instead).
    pub fn create_exclusive(posix_name: &str, size: usize) -> Result<Option<Self>> {
        let c_name = c_name(posix_name)?;
        let perms: libc::mode_t = 0o666;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        if fd == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Ok(None);
            }
            return Err(IpcError::SegmentCreateFailed);
        }

        unsafe { libc::fchmod(fd, perms) };

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(IpcError::SegmentCreateFailed);
        }

        let mem = Self::map(fd, size)?;
        Ok(Some(Self {
            mem,
            size,
            name: posix_name.to_string(),
        }))
    }

    /// Open and map an existing object; the size is taken from `fstat`.
    pub fn open_existing(posix_name: &str) -> Result<Self> {
        let c_name = c_name(posix_name)?;
        let perms: libc::mode_t = 0o666;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
        if fd == -1 {
            return Err(IpcError::SegmentNotFound);
        }

        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut sb) } != 0 {
            unsafe { libc::close(fd) };
            return Err(IpcError::SegmentStatFailed);
        }
        let size = sb.st_size as usize;

        let mem = Self::map(fd, size)?;
        Ok(Self {
            mem,
            size,
            name: posix_name.to_string(),
        })
    }

    fn map(fd: i32, size: usize) -> Result<*mut u8> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(IpcError::SegmentMapFailed);
        }
        Ok(mem as *mut u8)
    }

    /// Base of the mapped region.
    pub fn base(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Remove the backing object. Existing mappings stay valid.
    pub fn unlink(&self) {
        unlink_by_name(&self.name);
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        }
    }
}

/// Remove a named shm object without an open handle.
pub fn unlink_by_name(posix_name: &str) {
    if let Ok(c) = CString::new(posix_name.as_bytes()) {
        unsafe { libc::shm_unlink(c.as_ptr()) };
    }
}

fn c_name(posix_name: &str) -> Result<CString> {
    if posix_name.is_empty() {
        return Err(IpcError::InvalidArgument);
    }
    CString::new(posix_name.as_bytes()).map_err(|_| IpcError::InvalidArgument)
}

// ---------------------------------------------------------------------------
// Futex park/wake
// ---------------------------------------------------------------------------

/// Result of one park attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexWait {
    /// Woken by a waker (or spuriously); re-check the condition.
    Woken,
    /// The word no longer held the expected value at park time.
    ValueChanged,
    /// The timeout elapsed while parked.
    TimedOut,
}

/// Park on `word` while it holds `expected`, for at most `timeout`
/// (`None` parks indefinitely).
///
/// The caller must re-check its condition on every return: `Woken` does not
/// imply the condition holds, and `ValueChanged` only says the word moved.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    let ts;
    let ts_ptr: *const libc::timespec = match timeout {
        Some(t) => {
            ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            };
            &ts
        }
        None => ptr::null(),
    };

    // FUTEX_WAIT (not _PRIVATE): the word is shared between processes.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *mut u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        )
    };

    if rc == 0 {
        return FutexWait::Woken;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ETIMEDOUT) => FutexWait::TimedOut,
        Some(libc::EAGAIN) => FutexWait::ValueChanged,
        // EINTR and anything else: surface as a wake, caller re-checks.
        _ => FutexWait::Woken,
    }
}

/// Wake every process parked on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *mut u32,
            libc::FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Sleep-poll fallback for unices without a futex: nap briefly, report a
/// spurious wake. Bounded by the caller's deadline loop.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    use std::sync::atomic::Ordering;

    const NAP: Duration = Duration::from_millis(1);
    if word.load(Ordering::Acquire) != expected {
        return FutexWait::ValueChanged;
    }
    std::thread::sleep(timeout.map_or(NAP, |t| t.min(NAP)));
    FutexWait::Woken
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn futex_wake_all(_word: &AtomicU32) {
    // Sleepers re-check on their next poll tick.
}
