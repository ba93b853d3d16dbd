//! Deadline-ordered timers.
//!
//! Each execution unit owns one `TimerTree`, keyed by absolute deadline in
//! clock milliseconds. The tree stores `(deadline, token, direction)` entries
//! so the owning event can be recovered without pointer tricks; the event's
//! `deadline` field mirrors the key and doubles as the timer-armed flag.

use std::collections::BTreeSet;

use log::trace;

use crate::event::{Direction, Event, Token};

/// Default re-arm coalescing threshold in milliseconds.
///
/// Re-arming a timer whose new deadline is within this distance of the
/// current one leaves the tree untouched, bounding tree churn for
/// connections that re-arm on every I/O operation.
pub const DEFAULT_LAZY_DELAY_MS: u64 = 300;

/// Ordered set of pending deadlines for one execution unit.
#[derive(Debug)]
pub struct TimerTree {
    entries: BTreeSet<(u64, Token, Direction)>,
    lazy_delay: u64,
}

impl TimerTree {
    /// Create an empty tree with the default coalescing threshold.
    pub fn new() -> TimerTree {
        TimerTree::with_lazy_delay(DEFAULT_LAZY_DELAY_MS)
    }

    /// Create an empty tree with a custom coalescing threshold.
    pub fn with_lazy_delay(lazy_delay: u64) -> TimerTree {
        TimerTree {
            entries: BTreeSet::new(),
            lazy_delay,
        }
    }

    /// Arm `event`'s timer to fire `delta_ms` after `now`.
    ///
    /// If the event already has a timer and the new deadline differs from
    /// the current one by less than the lazy-delay threshold, this is a
    /// no-op.
    pub fn add(
        &mut self,
        event: &mut Event,
        token: Token,
        direction: Direction,
        now: u64,
        delta_ms: u64,
    ) {
        let key = now + delta_ms;

        if let Some(current) = event.deadline {
            let diff = key as i64 - current as i64;
            if diff.abs() < self.lazy_delay as i64 {
                return;
            }
            let _ = self.entries.remove(&(current, token, direction));
        }

        trace!("arming timer: token={}, deadline={}", token, key);
        event.deadline = Some(key);
        let _ = self.entries.insert((key, token, direction));
    }

    /// Disarm `event`'s timer, if armed.
    pub fn remove(&mut self, event: &mut Event, token: Token, direction: Direction) {
        if let Some(deadline) = event.deadline.take() {
            trace!("removing timer: token={}, deadline={}", token, deadline);
            let _ = self.entries.remove(&(deadline, token, direction));
        }
    }

    /// The smallest pending deadline, or `None` when the tree is empty.
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.entries.iter().next().map(|&(deadline, _, _)| deadline)
    }

    /// Milliseconds from `now` until the earliest deadline; zero when it is
    /// already overdue, `None` when no timer is armed.
    pub fn next_timeout(&self, now: u64) -> Option<u64> {
        self.earliest_deadline()
            .map(|deadline| deadline.saturating_sub(now))
    }

    /// Pop the earliest entry whose deadline is at or before `now`.
    ///
    /// Callers loop this until it returns `None`, marking the event timed
    /// out and running its handler between calls; a handler may re-arm a
    /// timer on the same event while expiry is in progress.
    pub fn expire_next(&mut self, now: u64) -> Option<(Token, Direction)> {
        let &(deadline, token, direction) = self.entries.iter().next()?;
        if deadline > now {
            return None;
        }
        let _ = self.entries.remove(&(deadline, token, direction));
        Some((token, direction))
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerTree {
    fn default() -> TimerTree {
        TimerTree::new()
    }
}
