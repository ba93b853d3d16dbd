//! Monotonic millisecond clock.
//!
//! Timer deadlines and restart stamps are plain `u64` milliseconds measured
//! from a per-process origin. Each execution unit caches the value once per
//! cycle; handlers compare against the cached value instead of calling into
//! the OS for every timer operation.

use std::time::Instant;

/// A monotonic clock returning milliseconds since its creation.
#[derive(Copy, Clone, Debug)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Create a new clock, anchored at the current instant.
    pub fn new() -> Clock {
        Clock { origin: Instant::now() }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * 1_000 + u64::from(elapsed.subsec_millis())
    }

    /// Seconds elapsed since the clock was created.
    ///
    /// Used for the supervisor's restart stamps, which only need second
    /// resolution.
    pub fn now_secs(&self) -> u64 {
        self.now() / 1_000
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::Clock;

    #[test]
    fn clock_advances() {
        let clock = Clock::new();
        let start = clock.now();
        sleep(Duration::from_millis(20));
        assert!(clock.now() >= start + 20);
    }

    #[test]
    fn seconds_track_milliseconds() {
        let clock = Clock::new();
        assert_eq!(clock.now_secs(), clock.now() / 1_000);
    }
}
