//! The readiness-event reactor, a thin wrapper around epoll.
//!
//! Each execution unit owns one `Reactor`. Both directions of a connection
//! share a single epoll registration: adding or removing one direction
//! chooses between `EPOLL_CTL_ADD`/`MOD`/`DEL` based on whether the paired
//! direction is currently active, so the reactor never issues an add for an
//! already-registered descriptor.
//!
//! Readiness results carry the connection's token and generation packed into
//! the epoll data word. A result whose generation no longer matches the slot
//! is a leftover from a descriptor closed earlier in the same cycle and is
//! dropped without touching any handler.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use log::{debug, error, trace};

use crate::conn::{ConnPool, Connection};
use crate::event::{Direction, Firing, Token};

/// How `process` routes firings to the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchMode {
    /// Push every firing into the caller's sink for immediate dispatch.
    Inline,
    /// Append firings to the post queues: accept-capable events to the
    /// accept queue, everything else to the general queue. The accept queue
    /// is drained before the general queue within a cycle to bound
    /// new-connection latency.
    Posted,
}

/// Level- or edge-triggered registration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterOption {
    /// Level-triggered delivery, the epoll default.
    Level,
    /// Edge-triggered delivery; the descriptor must be drained until
    /// `WouldBlock` before it reports ready again.
    Edge,
}

impl RegisterOption {
    fn bits(self) -> u32 {
        match self {
            RegisterOption::Level => 0,
            RegisterOption::Edge => libc::EPOLLET as u32,
        }
    }
}

fn pack(token: Token, generation: u32) -> u64 {
    (u64::from(generation) << 32) | (token.0 as u32 as u64)
}

fn unpack(data: u64) -> (Token, u32) {
    (Token(data as u32 as usize), (data >> 32) as u32)
}

fn interest_bits(direction: Direction) -> u32 {
    match direction {
        Direction::Read => libc::EPOLLIN as u32,
        Direction::Write => libc::EPOLLOUT as u32,
    }
}

/// Readiness multiplexer for one execution unit.
pub struct Reactor {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    posted_accept: VecDeque<Firing>,
    posted: VecDeque<Firing>,
}

impl Reactor {
    /// Create a reactor whose wait call returns at most `capacity` results
    /// per cycle.
    pub fn new(capacity: usize) -> io::Result<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        let events = (0..capacity.max(1))
            .map(|_| libc::epoll_event { events: 0, u64: 0 })
            .collect();
        Ok(Reactor {
            epfd,
            events,
            posted_accept: VecDeque::new(),
            posted: VecDeque::new(),
        })
    }

    /// Register or extend interest in `direction` for `conn`.
    ///
    /// If the paired direction is already active the existing registration
    /// is modified to cover both; otherwise a fresh registration is added.
    pub fn add(
        &mut self,
        conn: &mut Connection,
        token: Token,
        direction: Direction,
        opt: RegisterOption,
    ) -> io::Result<()> {
        let paired_active = conn.event(direction.paired()).active;
        let mut bits = interest_bits(direction) | opt.bits();
        let op = if paired_active {
            bits |= interest_bits(direction.paired());
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        let mut ep_event = libc::epoll_event {
            events: bits,
            u64: pack(token, conn.generation()),
        };
        self.ctl(op, conn.fd(), &mut ep_event)?;
        conn.event_mut(direction).active = true;
        Ok(())
    }

    /// Drop interest in `direction` for `conn`.
    ///
    /// With `closing` set no syscall is issued: the kernel drops the
    /// registration itself when the descriptor is closed.
    pub fn remove(
        &mut self,
        conn: &mut Connection,
        token: Token,
        direction: Direction,
        closing: bool,
    ) -> io::Result<()> {
        if closing {
            conn.event_mut(direction).active = false;
            return Ok(());
        }

        let paired_active = conn.event(direction.paired()).active;
        if paired_active {
            let mut ep_event = libc::epoll_event {
                events: interest_bits(direction.paired()),
                u64: pack(token, conn.generation()),
            };
            self.ctl(libc::EPOLL_CTL_MOD, conn.fd(), &mut ep_event)?;
        } else {
            let mut ep_event = libc::epoll_event { events: 0, u64: 0 };
            self.ctl(libc::EPOLL_CTL_DEL, conn.fd(), &mut ep_event)?;
        }
        conn.event_mut(direction).active = false;
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: &mut libc::epoll_event) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, event) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Wait up to `timeout` milliseconds (`None` blocks indefinitely, zero
    /// returns immediately) and collect readiness results.
    ///
    /// Stale results are discarded; error and hang-up conditions are folded
    /// into read-and-write readiness so at least one handler observes the
    /// failure. Firings are routed according to `mode`. `EINTR` is treated
    /// as an empty cycle; any other wait failure is fatal to the unit and
    /// returned. Waking with zero results from an indefinite wait is
    /// reported as an error.
    pub fn process(
        &mut self,
        pool: &mut ConnPool,
        sink: &mut Vec<Firing>,
        timeout: Option<u64>,
        mode: DispatchMode,
    ) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(ms) => ms.min(libc::c_int::MAX as u64) as libc::c_int,
            None => -1,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll wait interrupted, retrying next cycle");
                return Ok(0);
            }
            return Err(err);
        }
        if n == 0 {
            if timeout.is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "indefinite epoll wait returned no events",
                ));
            }
            return Ok(0);
        }

        let Reactor {
            ref events,
            ref mut posted_accept,
            ref mut posted,
            ..
        } = *self;

        for ep_event in &events[..n as usize] {
            let (token, generation) = unpack(ep_event.u64);
            let conn = match pool.get_mut(token) {
                Some(conn) if conn.generation() == generation => conn,
                _ => {
                    // Leftover readiness for a descriptor that was closed
                    // and its slot reused earlier in this iteration.
                    debug!("stale event dropped: token={}", token);
                    continue;
                }
            };

            let mut bits = ep_event.events;
            let failure = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
            let readiness = (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            if bits & failure != 0 {
                debug!(
                    "error condition on fd {}: events={:#x}",
                    conn.fd(),
                    bits
                );
                if bits & readiness == 0 {
                    bits |= readiness;
                }
            }

            for &direction in &[Direction::Read, Direction::Write] {
                if bits & interest_bits(direction) == 0 {
                    continue;
                }
                let event = conn.event_mut(direction);
                if !event.active {
                    continue;
                }
                event.ready = true;
                if event.handler.is_none() {
                    debug!("ready event without handler: token={}", token);
                    continue;
                }
                let firing = Firing { token, direction };
                match mode {
                    DispatchMode::Inline => sink.push(firing),
                    DispatchMode::Posted if event.accept => {
                        posted_accept.push_back(firing)
                    }
                    DispatchMode::Posted => posted.push_back(firing),
                }
            }
        }

        Ok(n as usize)
    }

    /// Pop the next deferred accept-readiness firing.
    pub fn pop_accept(&mut self) -> Option<Firing> {
        self.posted_accept.pop_front()
    }

    /// Pop the next deferred general firing.
    pub fn pop_posted(&mut self) -> Option<Firing> {
        self.posted.pop_front()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("epfd", &self.epfd)
            .field("capacity", &self.events.len())
            .field("posted_accept", &self.posted_accept.len())
            .field("posted", &self.posted.len())
            .finish()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            error!("closing epoll fd failed: {}", io::Error::last_os_error());
        }
    }
}
