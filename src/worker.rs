//! Execution units and the event-processing cycle.
//!
//! A [`Worker`] is one execution unit: a thread owning its own reactor,
//! timer tree and connection pool. Per-unit state is touched by no other
//! thread, so none of it is locked. The only shared state is the accept
//! lock, the sibling process table and the notifier atomics.
//!
//! Every cycle runs the same contract: compete for the accept lock; wait
//! for readiness bounded by the nearer of the earliest timer and the cycle
//! resolution cap; dispatch deferred accept events before deferred general
//! events; release the accept lock as soon as the accept queue is drained;
//! expire timers only if wall-clock time advanced during the cycle.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error, trace, warn};

use crate::accept::{AcceptLock, UnitId};
use crate::channel::{self, Command};
use crate::config::Config;
use crate::conn::ConnPool;
use crate::event::{Direction, Firing, Token};
use crate::listen::{self, Listener};
use crate::notify::{Notifier, NotifyHandle};
use crate::process::{actions, Peer, ProcessControl};
use crate::reactor::{DispatchMode, Reactor, RegisterOption};
use crate::time::Clock;
use crate::timer::TimerTree;

/// What a unit does with its cycles.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnitKind {
    /// Serves client connections; competes for the accept lock and owns a
    /// notifier.
    Io,
    /// Watches the control channel of a worker process; never accepts.
    Control,
}

/// Lifecycle of an execution unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnitState {
    /// Created but not yet running its loop.
    Unstarted,
    /// Inside its event loop.
    Running,
    /// The loop has finished.
    Exited,
}

/// Out-of-band hooks a worker process can register before spawning units.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hooks {
    /// Invoked on a `backup` control command.
    pub backup: Option<fn()>,
    /// Invoked on a `reopen` control command.
    pub reopen_logs: Option<fn()>,
    /// Invoked after the unit's notifier was consumed, to process queued
    /// I/O completions.
    pub completions: Option<fn(&mut Worker)>,
}

/// State shared by every execution unit of a worker process (and, through
/// the accept lock's shared mapping, across the whole process set).
pub struct WorkerShared {
    /// Server tunables.
    pub config: Config,
    /// The cross-process accept lock.
    pub accept_lock: AcceptLock,
    /// Listening descriptors, opened before any worker is forked.
    pub listeners: Vec<Listener>,
    /// Pending control actions for this process.
    pub control: ProcessControl,
    /// Sibling worker processes, maintained from `open`/`close` control
    /// messages.
    pub peers: Mutex<Vec<Peer>>,
    /// Maintenance hooks.
    pub hooks: Hooks,
    accept_enabled: AtomicBool,
}

impl WorkerShared {
    /// Create the shared state, including the accept-lock mapping. Must
    /// run before worker processes are forked.
    pub fn new(config: Config, listeners: Vec<Listener>) -> io::Result<WorkerShared> {
        Ok(WorkerShared {
            config,
            accept_lock: AcceptLock::new()?,
            listeners,
            control: ProcessControl::new(),
            peers: Mutex::new(Vec::new()),
            hooks: Hooks::default(),
            accept_enabled: AtomicBool::new(true),
        })
    }

    /// Whether units may still compete for the accept lock.
    pub fn accept_enabled(&self) -> bool {
        self.accept_enabled.load(Ordering::Acquire)
    }

    /// Permanently stop accept-lock competition; used during shutdown
    /// after the holder unregistered the listening events.
    pub fn disable_accept(&self) {
        self.accept_enabled.store(false, Ordering::Release);
    }
}

impl fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkerShared")
            .field("listeners", &self.listeners.len())
            .field("accept_enabled", &self.accept_enabled())
            .finish()
    }
}

/// One execution unit.
pub struct Worker {
    id: UnitId,
    kind: UnitKind,
    /// The unit's readiness multiplexer.
    pub reactor: Reactor,
    /// The unit's pending deadlines.
    pub timers: TimerTree,
    /// The unit's connections.
    pub pool: ConnPool,
    /// Process-wide shared state.
    pub shared: Arc<WorkerShared>,
    clock: Clock,
    now_ms: u64,
    running: Arc<AtomicBool>,
    state: UnitState,
    notifier: Option<Notifier>,
    listen_tokens: Vec<Option<Token>>,
    sink: Vec<Firing>,
    failure: Option<io::Error>,
}

impl Worker {
    /// Create an execution unit. I/O units get a notifier, registered with
    /// the unit's reactor like any other readable descriptor.
    pub fn new(index: u32, kind: UnitKind, shared: Arc<WorkerShared>) -> io::Result<Worker> {
        let connections = shared.config.connections;
        let id = unit_id(index);
        let listener_count = shared.listeners.len();
        let lazy_delay = shared.config.timer_lazy_delay_ms;

        let mut worker = Worker {
            id,
            kind,
            reactor: Reactor::new(connections)?,
            timers: TimerTree::with_lazy_delay(lazy_delay),
            pool: ConnPool::with_capacity(connections),
            shared,
            clock: Clock::new(),
            now_ms: 0,
            running: Arc::new(AtomicBool::new(true)),
            state: UnitState::Unstarted,
            notifier: None,
            listen_tokens: vec![None; listener_count],
            sink: Vec::new(),
            failure: None,
        };

        if kind == UnitKind::Io {
            let notifier = Notifier::new()?;
            let token = worker.pool.admit_borrowed(notifier.fd())?;
            if let Some(conn) = worker.pool.get_mut(token) {
                conn.read.handler = Some(notifier_handler);
            }
            let Worker { ref mut reactor, ref mut pool, .. } = worker;
            if let Some(conn) = pool.get_mut(token) {
                reactor.add(conn, token, Direction::Read, RegisterOption::Level)?;
            }
            worker.notifier = Some(notifier);
        }

        Ok(worker)
    }

    /// The unit's identity, unique across the process set.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The unit's kind.
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// The unit's lifecycle state.
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Cached time of the current cycle, in clock milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// The run flag; clearing it makes the unit leave its loop after the
    /// current cycle.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// A signalling handle for this unit's notifier, if it has one.
    pub fn notify_handle(&self) -> Option<NotifyHandle> {
        self.notifier.as_ref().map(|notifier| notifier.handle())
    }

    /// Record a fatal failure; the unit leaves its loop after the current
    /// cycle.
    pub fn fail(&mut self, err: io::Error) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    /// Register one direction of a connection with the reactor.
    pub fn register(
        &mut self,
        token: Token,
        direction: Direction,
        opt: RegisterOption,
    ) -> io::Result<()> {
        let Worker { ref mut reactor, ref mut pool, .. } = *self;
        if let Some(conn) = pool.get_mut(token) {
            reactor.add(conn, token, direction, opt)?;
        }
        Ok(())
    }

    /// Register both directions of a connection with the reactor.
    pub fn register_conn(&mut self, token: Token, opt: RegisterOption) -> io::Result<()> {
        let Worker { ref mut reactor, ref mut pool, .. } = *self;
        if let Some(conn) = pool.get_mut(token) {
            reactor.add(conn, token, Direction::Read, opt)?;
            reactor.add(conn, token, Direction::Write, opt)?;
        }
        Ok(())
    }

    /// Tear down a connection: disarm its timers, drop its registration
    /// and release the slot (closing pool-owned descriptors).
    pub fn close_conn(&mut self, token: Token) {
        {
            let Worker {
                ref mut reactor,
                ref mut timers,
                ref mut pool,
                ..
            } = *self;
            if let Some(conn) = pool.get_mut(token) {
                timers.remove(&mut conn.read, token, Direction::Read);
                timers.remove(&mut conn.write, token, Direction::Write);
                // A pool-owned descriptor is about to be closed; the kernel
                // drops its registration, so no syscall is needed.
                let closing = conn.is_owned();
                if let Err(err) = reactor.remove(conn, token, Direction::Read, closing) {
                    debug!("deregistering fd {} failed: {}", conn.fd(), err);
                }
                if let Err(err) = reactor.remove(conn, token, Direction::Write, closing) {
                    debug!("deregistering fd {} failed: {}", conn.fd(), err);
                }
            }
        }
        self.pool.release(token);
    }

    /// Arm (or re-arm, subject to coalescing) a timer on one event.
    pub fn arm_timer(&mut self, token: Token, direction: Direction, delta_ms: u64) {
        let now = self.now_ms;
        let Worker { ref mut timers, ref mut pool, .. } = *self;
        if let Some(event) = pool.event_mut(token, direction) {
            timers.add(event, token, direction, now, delta_ms);
        }
    }

    /// Disarm a timer on one event.
    pub fn disarm_timer(&mut self, token: Token, direction: Direction) {
        let Worker { ref mut timers, ref mut pool, .. } = *self;
        if let Some(event) = pool.event_mut(token, direction) {
            timers.remove(event, token, direction);
        }
    }

    /// Run one reactor cycle.
    pub fn cycle(&mut self) -> io::Result<()> {
        let shutting_down = self.shared.control.shutdown_pending();

        if self.kind == UnitKind::Io && !shutting_down && self.shared.accept_enabled() {
            let _ = self.shared.accept_lock.try_acquire(self.id);
        }

        if shutting_down
            && self.shared.accept_enabled()
            && self.shared.accept_lock.holds(self.id)
        {
            // Shutdown: drop the listening registrations for good and stop
            // competing.
            self.del_listen_events();
            self.shared.disable_accept();
            self.shared.accept_lock.release(self.id);
        }

        let mut mode = DispatchMode::Inline;
        if self.shared.accept_enabled() && self.shared.accept_lock.holds(self.id) {
            match self.add_listen_events() {
                Ok(()) => mode = DispatchMode::Posted,
                Err(err) => {
                    warn!("registering listening events failed: {}", err);
                    self.shared.accept_lock.release(self.id);
                }
            }
        }

        let resolution = self.shared.config.cycle_resolution_ms;
        let timeout = self
            .timers
            .next_timeout(self.now_ms)
            .map(|ms| ms.min(resolution))
            .unwrap_or(resolution);

        let cycle_start = self.now_ms;
        let mut sink = std::mem::replace(&mut self.sink, Vec::new());
        let result = {
            let Worker { ref mut reactor, ref mut pool, .. } = *self;
            reactor.process(pool, &mut sink, Some(timeout), mode)
        };
        self.now_ms = self.clock.now();
        if let Err(err) = result {
            self.sink = sink;
            return Err(err);
        }

        // Firings collected in inline mode run first, in arrival order.
        for firing in sink.drain(..) {
            self.dispatch(firing);
        }
        self.sink = sink;

        // Deferred accept readiness drains before general readiness, and
        // the lock is released the moment accepts are done so other units
        // can take the next cycle's accepts.
        while let Some(firing) = self.reactor.pop_accept() {
            self.dispatch(firing);
        }
        if self.shared.accept_lock.holds(self.id) {
            self.del_listen_events();
            self.shared.accept_lock.release(self.id);
        }
        while let Some(firing) = self.reactor.pop_posted() {
            self.dispatch(firing);
        }

        if self.now_ms > cycle_start {
            self.expire_timers();
        }

        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run cycles until the run flag clears or a cycle fails.
    pub fn run(&mut self, registry: &Registry) {
        self.state = UnitState::Running;
        trace!("unit {:#x} running", self.id);
        registry.register_ready();

        while self.running.load(Ordering::Relaxed) {
            if let Err(err) = self.cycle() {
                error!("unit {:#x}: event cycle failed: {}", self.id, err);
                break;
            }
        }

        if self.shared.accept_lock.holds(self.id) {
            self.del_listen_events();
            self.shared.accept_lock.release(self.id);
        }
        if let Some(notifier) = self.notifier.take() {
            if let Err(err) = notifier.release() {
                warn!("releasing notifier failed: {}", err);
            }
        }

        self.state = UnitState::Exited;
        trace!("unit {:#x} exited", self.id);
        registry.register_exit();
    }

    pub(crate) fn dispatch(&mut self, firing: Firing) {
        let handler = match self.pool.get(firing.token) {
            Some(conn) => conn.event(firing.direction).handler,
            None => None,
        };
        match handler {
            Some(handler) => handler(self, firing.token, firing.direction),
            None => debug!(
                "dropping firing without handler: token={}",
                firing.token
            ),
        }
    }

    fn add_listen_events(&mut self) -> io::Result<()> {
        for index in 0..self.shared.listeners.len() {
            let token = match self.listen_tokens[index] {
                Some(token) => token,
                None => {
                    let fd = self.shared.listeners[index].fd();
                    let token = self.pool.admit_borrowed(fd)?;
                    if let Some(conn) = self.pool.get_mut(token) {
                        conn.listener = Some(index);
                        conn.read.accept = true;
                        conn.read.handler = Some(listen::accept_handler);
                    }
                    self.listen_tokens[index] = Some(token);
                    token
                }
            };

            let Worker { ref mut reactor, ref mut pool, .. } = *self;
            if let Some(conn) = pool.get_mut(token) {
                if !conn.read.active {
                    reactor.add(conn, token, Direction::Read, RegisterOption::Level)?;
                }
            }
        }
        Ok(())
    }

    fn del_listen_events(&mut self) {
        for index in 0..self.listen_tokens.len() {
            let token = match self.listen_tokens[index] {
                Some(token) => token,
                None => continue,
            };
            let Worker { ref mut reactor, ref mut pool, .. } = *self;
            if let Some(conn) = pool.get_mut(token) {
                if conn.read.active {
                    if let Err(err) = reactor.remove(conn, token, Direction::Read, false) {
                        warn!("unregistering listening event failed: {}", err);
                    }
                }
            }
        }
    }

    fn expire_timers(&mut self) {
        let now = self.now_ms;
        while let Some((token, direction)) = self.timers.expire_next(now) {
            match self.pool.event_mut(token, direction) {
                Some(event) => {
                    event.deadline = None;
                    event.timed_out = true;
                }
                None => continue,
            }
            self.dispatch(Firing { token, direction });
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("connections", &self.pool.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

fn unit_id(index: u32) -> UnitId {
    let pid = unsafe { libc::getpid() } as u32;
    (u64::from(pid) << 32) | u64::from(index)
}

/// Read handler for a unit's notifier descriptor: drain the wakeup, then
/// process queued completions.
pub(crate) fn notifier_handler(worker: &mut Worker, _token: Token, _direction: Direction) {
    if let Some(ref notifier) = worker.notifier {
        match notifier.consume() {
            Ok(count) => trace!("notifier consumed {} wakeups", count),
            Err(err) => warn!("consuming notifier failed: {}", err),
        }
    }
    if let Some(hook) = worker.shared.hooks.completions {
        hook(worker);
    }
}

/// Read handler for the worker process's end of the control channel.
pub(crate) fn channel_handler(worker: &mut Worker, token: Token, direction: Direction) {
    if let Some(event) = worker.pool.event_mut(token, direction) {
        if event.timed_out {
            event.timed_out = false;
            return;
        }
    }

    let fd = match worker.pool.get(token) {
        Some(conn) => conn.fd(),
        None => return,
    };

    loop {
        let message = match channel::recv(fd) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(err) => {
                // The supervisor is gone; tear down our wrapper and the
                // descriptor.
                debug!("control channel read failed, closing: {}", err);
                worker.close_conn(token);
                channel::close_fd(fd);
                return;
            }
        };

        trace!("channel command: {}", message.command);
        match message.command {
            Command::Quit => worker.shared.control.request(actions::QUIT),
            Command::Terminate => worker.shared.control.request(actions::TERMINATE),
            Command::Open => {
                let mut peers = lock_peers(&worker.shared.peers);
                let slot = message.slot as usize;
                if peers.len() <= slot {
                    peers.resize_with(slot + 1, Peer::vacant);
                }
                peers[slot].pid = message.pid;
                peers[slot].master_fd = message.fd;
            }
            Command::Close => {
                let mut peers = lock_peers(&worker.shared.peers);
                let slot = message.slot as usize;
                if let Some(peer) = peers.get_mut(slot) {
                    channel::close_fd(peer.master_fd);
                    *peer = Peer::vacant();
                }
            }
            Command::Reopen => {
                if let Some(hook) = worker.shared.hooks.reopen_logs {
                    hook();
                }
            }
            Command::Backup => {
                if let Some(hook) = worker.shared.hooks.backup {
                    hook();
                }
            }
            Command::None => {}
        }
    }
}

fn lock_peers(peers: &Mutex<Vec<Peer>>) -> std::sync::MutexGuard<'_, Vec<Peer>> {
    match peers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Startup and shutdown barriers for a worker process's units.
///
/// Spawning code adds the expected unit count, every unit reports ready
/// when it enters its loop and exited when it leaves, and the process
/// blocks on the matching wait call.
#[derive(Debug)]
pub struct Registry {
    total: AtomicUsize,
    counts: Mutex<(usize, usize)>,
    cond: Condvar,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Registry {
        Registry {
            total: AtomicUsize::new(0),
            counts: Mutex::new((0, 0)),
            cond: Condvar::new(),
        }
    }

    /// Add `n` expected units.
    pub fn add_total(&self, n: usize) {
        let _ = self.total.fetch_add(n, Ordering::AcqRel);
    }

    /// Report this unit as running.
    pub fn register_ready(&self) {
        let mut counts = self.lock();
        counts.0 += 1;
        self.cond.notify_all();
    }

    /// Report this unit as exited.
    pub fn register_exit(&self) {
        let mut counts = self.lock();
        counts.1 += 1;
        self.cond.notify_all();
    }

    /// Block until every expected unit reported ready.
    pub fn wait_ready(&self) {
        let total = self.total.load(Ordering::Acquire);
        let mut counts = self.lock();
        while counts.0 < total {
            counts = match self.cond.wait(counts) {
                Ok(counts) => counts,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Block until every expected unit reported exited.
    pub fn wait_exit(&self) {
        let total = self.total.load(Ordering::Acquire);
        let mut counts = self.lock();
        while counts.1 < total {
            counts = match self.cond.wait(counts) {
                Ok(counts) => counts,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (usize, usize)> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

/// A set of spawned I/O units.
#[derive(Debug)]
pub struct UnitSet {
    run_flags: Vec<Arc<AtomicBool>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl UnitSet {
    /// Ask every unit to stop after its current cycle.
    pub fn stop(&self) {
        for flag in &self.run_flags {
            flag.store(false, Ordering::Relaxed);
        }
    }

    /// Join the unit threads.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("an execution unit panicked");
            }
        }
    }
}

/// Spawn `count` I/O execution units on their own threads.
///
/// The caller must have added `count` to `registry` beforehand and should
/// block on [`Registry::wait_ready`] afterwards so a unit that failed to
/// start is noticed before serving traffic.
pub fn spawn_io_units(
    shared: &Arc<WorkerShared>,
    count: usize,
    registry: &Arc<Registry>,
) -> io::Result<UnitSet> {
    let mut workers = Vec::with_capacity(count);
    for index in 0..count {
        workers.push(Worker::new(index as u32, UnitKind::Io, shared.clone())?);
    }

    let mut set = UnitSet {
        run_flags: workers.iter().map(Worker::run_flag).collect(),
        handles: Vec::with_capacity(count),
    };
    for (index, mut worker) in workers.into_iter().enumerate() {
        let registry = registry.clone();
        let handle = thread::Builder::new()
            .name(format!("io-unit-{}", index))
            .spawn(move || worker.run(&registry));
        match handle {
            Ok(handle) => set.handles.push(handle),
            Err(err) => {
                set.stop();
                return Err(err);
            }
        }
    }
    Ok(set)
}
