//! Accept serialization across execution units.
//!
//! All I/O units of all worker processes compete once per reactor cycle for
//! a single lock; only the holder registers the listening sockets' read
//! events for that cycle. Hold times are microseconds, so the lock is a
//! compare-and-swap word rather than a blocking OS mutex.
//!
//! The lock word lives in an anonymous shared mapping created by the
//! supervisor before any worker is forked, so every worker process operates
//! on the same word and at most one unit in the whole process set can hold
//! the lock at any instant.

use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identity of an execution unit, unique across the process set.
///
/// Built from the owning process id and the unit's index so holder checks
/// work across fork boundaries.
pub type UnitId = u64;

/// Sentinel holder value meaning "no unit holds the lock".
const NO_HOLDER: u64 = u64::MAX;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

#[repr(C)]
struct LockState {
    word: AtomicU32,
    holder: AtomicU64,
}

/// The cross-process accept lock.
pub struct AcceptLock {
    state: ptr::NonNull<LockState>,
}

// The mapping is plain shared memory holding atomics.
unsafe impl Send for AcceptLock {}
unsafe impl Sync for AcceptLock {}

impl AcceptLock {
    /// Create the lock in a fresh `MAP_SHARED | MAP_ANONYMOUS` mapping.
    ///
    /// Must be called before worker processes are forked so they inherit
    /// the mapping.
    pub fn new() -> io::Result<AcceptLock> {
        let len = size_of::<LockState>();
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let state = addr as *mut LockState;
        unsafe {
            ptr::write(
                state,
                LockState {
                    word: AtomicU32::new(UNLOCKED),
                    holder: AtomicU64::new(NO_HOLDER),
                },
            );
        }
        // mmap returns page-aligned, non-null memory on success.
        Ok(AcceptLock {
            state: ptr::NonNull::new(state).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "accept lock mapping is null")
            })?,
        })
    }

    fn state(&self) -> &LockState {
        unsafe { self.state.as_ref() }
    }

    /// Try to take the lock for `unit`. Non-blocking; returns whether the
    /// acquisition succeeded.
    pub fn try_acquire(&self, unit: UnitId) -> bool {
        let state = self.state();
        if state
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            state.holder.store(unit, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Whether `unit` is the current holder.
    pub fn holds(&self, unit: UnitId) -> bool {
        self.state().holder.load(Ordering::Acquire) == unit
    }

    /// Release the lock. A no-op unless `unit` is the current holder.
    pub fn release(&self, unit: UnitId) {
        let state = self.state();
        if state
            .holder
            .compare_exchange(unit, NO_HOLDER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            state.word.store(UNLOCKED, Ordering::Release);
        }
    }
}

impl fmt::Debug for AcceptLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let holder = self.state().holder.load(Ordering::Relaxed);
        f.debug_struct("AcceptLock")
            .field("locked", &(self.state().word.load(Ordering::Relaxed) == LOCKED))
            .field(
                "holder",
                &if holder == NO_HOLDER { None } else { Some(holder) },
            )
            .finish()
    }
}

impl Drop for AcceptLock {
    fn drop(&mut self) {
        let len = size_of::<LockState>();
        if unsafe { libc::munmap(self.state.as_ptr() as *mut libc::c_void, len) } == -1 {
            log::error!(
                "unmapping accept lock failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}
