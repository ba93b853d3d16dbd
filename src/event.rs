//! Readiness event types.
//!
//! An [`Event`] tracks one direction (read or write) of interest on a single
//! connection. Both events of a connection share one underlying registration
//! with the [`Reactor`]; the `active` flag records whether that direction is
//! currently part of the registration, while `ready` records the last
//! readiness result delivered for it.
//!
//! [`Reactor`]: crate::reactor::Reactor

use std::fmt;

use crate::worker::Worker;

/// Key of a connection slot inside a unit's [`ConnPool`].
///
/// Tokens are reused when slots are reused; stale readiness results are told
/// apart by the connection's generation counter, not by the token alone.
///
/// [`ConnPool`]: crate::conn::ConnPool
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The direction of interest an [`Event`] covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Direction {
    /// Read readiness.
    Read,
    /// Write readiness.
    Write,
}

impl Direction {
    /// The paired direction on the same connection.
    pub fn paired(self) -> Direction {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }
}

/// Handler invoked when an event fires.
///
/// Handlers are plain functions dispatched by the owning [`Worker`]; the
/// token and direction identify the firing event inside the worker's pool.
pub type HandlerFn = fn(&mut Worker, Token, Direction);

/// A single firing of an event, as produced by the reactor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Firing {
    /// Connection the readiness applies to.
    pub token: Token,
    /// Direction that became ready.
    pub direction: Direction,
}

/// One direction of readiness interest on a connection.
pub struct Event {
    /// Whether this direction is part of the connection's registration.
    pub active: bool,
    /// Last readiness-poll result for this direction.
    pub ready: bool,
    /// Set by timer expiry before the handler runs; handlers clear it.
    pub timed_out: bool,
    /// Whether this event belongs to a listening descriptor. Accept-capable
    /// events are posted to the dedicated accept queue.
    pub accept: bool,
    /// Armed timer deadline in clock milliseconds. The event has a node in
    /// the timer tree if and only if this is `Some`, with the same key.
    pub deadline: Option<u64>,
    /// Handler to run when the event fires.
    pub handler: Option<HandlerFn>,
}

impl Event {
    /// Create an inactive event with the given handler.
    pub fn new(handler: Option<HandlerFn>) -> Event {
        Event {
            active: false,
            ready: false,
            timed_out: false,
            accept: false,
            deadline: None,
            handler,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("active", &self.active)
            .field("ready", &self.ready)
            .field("timed_out", &self.timed_out)
            .field("accept", &self.accept)
            .field("deadline", &self.deadline)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, Event};

    #[test]
    fn paired_direction() {
        assert_eq!(Direction::Read.paired(), Direction::Write);
        assert_eq!(Direction::Write.paired(), Direction::Read);
    }

    #[test]
    fn new_event_is_idle() {
        let event = Event::new(None);
        assert!(!event.active);
        assert!(!event.ready);
        assert!(!event.timed_out);
        assert!(event.deadline.is_none());
    }
}
