//! Collection of testing utilities.

// Not all functions are used in all tests, causing warnings of unused
// functions while other tests are actually using them.
#![allow(dead_code)]

use std::thread::sleep;
use std::time::{Duration, Instant};

/// Initialise the test setup, things like logging etc.
pub fn init() {
    let env = env_logger::Env::new().filter("LOG_LEVEL");
    // Logger could already be set, so we ignore the result.
    drop(env_logger::Builder::from_env(env).is_test(true).try_init());
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses; returns whether it held.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10));
    }
}

/// A connected non-blocking unix stream pair, closed on drop.
pub struct FdPair {
    pub left: i32,
    pub right: i32,
}

impl FdPair {
    pub fn new() -> FdPair {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0,
            "socketpair failed"
        );
        for &fd in &fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            assert_ne!(flags, -1);
            assert_ne!(
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) },
                -1
            );
        }
        FdPair { left: fds[0], right: fds[1] }
    }

    /// Write `data` into the `right` end, making `left` readable.
    pub fn make_left_readable(&self, data: &[u8]) {
        let n = unsafe {
            libc::write(self.right, data.as_ptr() as *const libc::c_void, data.len())
        };
        assert_eq!(n, data.len() as isize);
    }
}

impl Drop for FdPair {
    fn drop(&mut self) {
        unsafe {
            if self.left >= 0 {
                libc::close(self.left);
            }
            if self.right >= 0 {
                libc::close(self.right);
            }
        }
    }
}
