//! Async-I/O completion notifier.
//!
//! Disk-I/O completions happen on threads outside the reactor. The notifier
//! bridges them into the event loop: completion contexts call
//! [`NotifyHandle::signal`], which wakes the owning unit's reactor through
//! an `eventfd` the unit has registered like any other readable descriptor.
//!
//! Bursts of completions collapse into a single wakeup: `signal` only
//! writes to the eventfd when it transitions the `noticed` flag from clear
//! to set; the flag, not the write call, is the de-duplication mechanism.
//! Teardown is counted: [`Notifier::release`] blocks until every completion
//! tracked with [`NotifyHandle::track_start`] has reported
//! [`NotifyHandle::track_done`], and only then closes the descriptor, so no
//! in-flight completion can touch a dead descriptor.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::error;

struct Inner {
    fd: AtomicI32,
    noticed: AtomicBool,
    pending: AtomicU64,
    release: AtomicBool,
    drained: Mutex<()>,
    cond: Condvar,
}

/// The consuming side of the wakeup primitive, owned by one execution unit.
pub struct Notifier {
    inner: Arc<Inner>,
}

/// The signalling side, held by completion contexts. Cheap to clone and
/// safe to use from any thread.
#[derive(Clone)]
pub struct NotifyHandle {
    inner: Arc<Inner>,
}

impl Notifier {
    /// Create a notifier backed by a fresh eventfd.
    pub fn new() -> io::Result<Notifier> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Notifier {
            inner: Arc::new(Inner {
                fd: AtomicI32::new(fd),
                noticed: AtomicBool::new(false),
                pending: AtomicU64::new(0),
                release: AtomicBool::new(false),
                drained: Mutex::new(()),
                cond: Condvar::new(),
            }),
        })
    }

    /// The wakeup descriptor, for registration with a reactor.
    pub fn fd(&self) -> RawFd {
        self.inner.fd.load(Ordering::Acquire)
    }

    /// A handle for completion contexts.
    pub fn handle(&self) -> NotifyHandle {
        NotifyHandle { inner: self.inner.clone() }
    }

    /// Drain the wakeup descriptor and clear the noticed flag.
    ///
    /// Called by the owning unit when the descriptor reports readable.
    /// Returns the number of wakeup writes drained.
    pub fn consume(&self) -> io::Result<u64> {
        let fd = self.inner.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "notifier already released",
            ));
        }

        let mut buf = [0; 8];
        let count = loop {
            let n = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    // A spurious wakeup with nothing queued.
                    io::ErrorKind::WouldBlock => break 0,
                    _ => return Err(err),
                }
            }
            break u64::from_ne_bytes(buf);
        };

        self.inner.noticed.store(false, Ordering::Release);
        Ok(count)
    }

    /// Block until the pending-completion counter reaches zero, then close
    /// the wakeup descriptor.
    ///
    /// Releasing twice is an error.
    pub fn release(&self) -> io::Result<()> {
        if self.inner.release.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "notifier already released",
            ));
        }

        let mut guard = match self.inner.drained.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while self.inner.pending.load(Ordering::Acquire) != 0 {
            let (next, _) = match self
                .inner
                .cond
                .wait_timeout(guard, Duration::from_millis(100))
            {
                Ok(ok) => ok,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard = next;
        }
        drop(guard);

        let fd = self.inner.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 && unsafe { libc::close(fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl NotifyHandle {
    /// Record that a completion is in flight.
    pub fn track_start(&self) {
        let _ = self.inner.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that a tracked completion has been fully delivered.
    ///
    /// The last decrement while a release is in progress wakes the
    /// releasing thread.
    pub fn track_done(&self) {
        let previous = self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "track_done without matching track_start");
        if previous == 1 && self.inner.release.load(Ordering::Acquire) {
            self.inner.cond.notify_all();
        }
    }

    /// Wake the owning unit, collapsing concurrent signals into a single
    /// wakeup write.
    pub fn signal(&self) -> io::Result<()> {
        if self
            .inner
            .noticed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A wakeup is already on its way.
            return Ok(());
        }

        let fd = self.inner.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "notifier already released",
            ));
        }

        let value: u64 = 1;
        let buf = value.to_ne_bytes();
        loop {
            let n = unsafe {
                libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(());
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("fd", &self.inner.fd.load(Ordering::Relaxed))
            .field("noticed", &self.inner.noticed.load(Ordering::Relaxed))
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .field("release", &self.inner.release.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Debug for NotifyHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NotifyHandle")
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let fd = self.inner.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 && unsafe { libc::close(fd) } == -1 {
            error!(
                "closing notifier fd failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Notifier;

    #[test]
    fn burst_of_signals_is_one_wakeup() {
        let notifier = Notifier::new().unwrap();
        let handle = notifier.handle();

        handle.signal().unwrap();
        handle.signal().unwrap();
        handle.signal().unwrap();

        // One wakeup write despite three signals.
        assert_eq!(notifier.consume().unwrap(), 1);

        // After consuming, the next signal wakes again.
        handle.signal().unwrap();
        assert_eq!(notifier.consume().unwrap(), 1);
    }

    #[test]
    fn consume_without_signal_is_empty() {
        let notifier = Notifier::new().unwrap();
        assert_eq!(notifier.consume().unwrap(), 0);
    }

    #[test]
    fn release_waits_for_pending() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let notifier = Notifier::new().unwrap();
        let handle = notifier.handle();

        handle.track_start();

        let (released_tx, released_rx) = mpsc::channel();
        let releaser = thread::spawn(move || {
            notifier.release().unwrap();
            released_tx.send(()).unwrap();
        });

        // Release must not complete while a completion is still pending.
        assert!(released_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());

        handle.track_done();
        released_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("release did not finish after last track_done");
        releaser.join().unwrap();

        // The wakeup descriptor is gone.
        assert!(handle.signal().is_err());
    }
}
