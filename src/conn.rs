//! Connections and the per-unit connection pool.
//!
//! A [`Connection`] is the pool-side wrapper around one file descriptor: one
//! read [`Event`], one write [`Event`] and a generation counter. The counter
//! is bumped every time a slot is reused so that a readiness result delivered
//! for an earlier occupant of the slot can be recognised as stale and
//! discarded.

use std::any::Any;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use log::error;
use slab::Slab;

use crate::event::{Direction, Event, HandlerFn, Token};

/// An admitted file descriptor and its pair of readiness events.
pub struct Connection {
    fd: RawFd,
    generation: u32,
    owned: bool,
    /// Read-direction event.
    pub read: Event,
    /// Write-direction event.
    pub write: Event,
    /// Index of the listening descriptor this connection belongs to, for
    /// listening sockets and connections spawned by one.
    pub listener: Option<usize>,
    /// Opaque per-connection application state.
    pub app: Option<Box<dyn Any + Send>>,
}

impl Connection {
    fn new(fd: RawFd, generation: u32, owned: bool) -> Connection {
        Connection {
            fd,
            generation,
            owned,
            read: Event::new(None),
            write: Event::new(None),
            listener: None,
            app: None,
        }
    }

    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Generation of this slot occupant, compared value-wise against the
    /// generation carried in readiness results.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the pool owns (and will close) the descriptor.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// The event for `direction`.
    pub fn event(&self, direction: Direction) -> &Event {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Mutable access to the event for `direction`.
    pub fn event_mut(&mut self, direction: Direction) -> &mut Event {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    /// Install `handler` on both events.
    pub fn set_handler(&mut self, handler: HandlerFn) {
        self.read.handler = Some(handler);
        self.write.handler = Some(handler);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("generation", &self.generation)
            .field("owned", &self.owned)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Fixed-capacity pool of connections owned by one execution unit.
///
/// Only the owning unit's thread ever touches the pool, so it needs no
/// internal synchronisation.
pub struct ConnPool {
    slots: Slab<Connection>,
    // Next generation per slot index; grows with the slab's backing storage.
    generations: Vec<u32>,
    capacity: usize,
}

impl ConnPool {
    /// Create a pool that can hold up to `capacity` connections.
    pub fn with_capacity(capacity: usize) -> ConnPool {
        ConnPool {
            slots: Slab::with_capacity(capacity),
            generations: vec![0; capacity],
            capacity,
        }
    }

    /// Admit a descriptor the pool takes ownership of; it is closed when the
    /// connection is released.
    ///
    /// Pool exhaustion is an error: the caller's unit cannot continue to
    /// serve new descriptors and must surface the failure.
    pub fn admit(&mut self, fd: RawFd) -> io::Result<Token> {
        self.admit_fd(fd, true)
    }

    /// Admit a descriptor owned elsewhere (listening sockets, the control
    /// channel, notifier descriptors). Releasing the connection leaves the
    /// descriptor open.
    pub fn admit_borrowed(&mut self, fd: RawFd) -> io::Result<Token> {
        self.admit_fd(fd, false)
    }

    fn admit_fd(&mut self, fd: RawFd, owned: bool) -> io::Result<Token> {
        if self.slots.len() == self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "connection pool exhausted",
            ));
        }
        let entry = self.slots.vacant_entry();
        let key = entry.key();
        let generation = self.generations[key].wrapping_add(1);
        self.generations[key] = generation;
        entry.insert(Connection::new(fd, generation, owned));
        Ok(Token(key))
    }

    /// Look up a live connection.
    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.slots.get(token.0)
    }

    /// Look up a live connection for mutation.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.slots.get_mut(token.0)
    }

    /// Look up one event of a live connection.
    pub fn event_mut(&mut self, token: Token, direction: Direction) -> Option<&mut Event> {
        self.get_mut(token).map(|conn| conn.event_mut(direction))
    }

    /// Release a connection slot, closing the descriptor if the pool owns
    /// it. The slot becomes reusable with a fresh generation.
    pub fn release(&mut self, token: Token) {
        if !self.slots.contains(token.0) {
            return;
        }
        let conn = self.slots.remove(token.0);
        if conn.owned && unsafe { libc::close(conn.fd) } == -1 {
            error!(
                "closing connection fd {} failed: {}",
                conn.fd,
                io::Error::last_os_error()
            );
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no connections.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of connections.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("len", &self.slots.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnPool;

    fn pipe_fds() -> (i32, i32) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let (r, w) = pipe_fds();
        let mut pool = ConnPool::with_capacity(4);

        let first = pool.admit_borrowed(r).unwrap();
        let first_generation = pool.get(first).unwrap().generation();
        pool.release(first);

        let second = pool.admit_borrowed(w).unwrap();
        // Slab reuses the freed slot; the generation must differ.
        assert_eq!(first, second);
        assert_ne!(first_generation, pool.get(second).unwrap().generation());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn exhaustion_is_an_error() {
        let (r, w) = pipe_fds();
        let mut pool = ConnPool::with_capacity(1);
        let token = pool.admit_borrowed(r).unwrap();
        assert!(pool.admit_borrowed(w).is_err());
        pool.release(token);
        assert!(pool.admit_borrowed(w).is_ok());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn released_token_is_gone() {
        let (r, w) = pipe_fds();
        let mut pool = ConnPool::with_capacity(2);
        let token = pool.admit_borrowed(r).unwrap();
        pool.release(token);
        assert!(pool.get(token).is_none());
        // Releasing twice is harmless.
        pool.release(token);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
