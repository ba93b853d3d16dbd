//! The master/worker process supervisor.
//!
//! The supervisor forks worker processes, tracks them in a slot table,
//! relays control signals over each slot's [`channel`], reaps exited
//! children and respawns them, unless a slot is crash-looping or was
//! retired as part of a rolling restart.
//!
//! All supervisor state lives in the [`Supervisor`] itself rather than in
//! process-wide globals, so tests can run supervisors side by side. The one
//! exception is the pending-signal set inside [`signal`], which a signal
//! handler has no other way to reach; [`ProcessControl::merge_signals`]
//! drains it into the owning context.
//!
//! [`channel`]: crate::channel

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::channel::{self, ChannelPair, Command, Message, NO_FD};
use crate::event::Direction;
use crate::reactor::RegisterOption;
use crate::signal::{self, Signal};
use crate::time::Clock;
use crate::worker::{self, spawn_io_units, Registry, UnitKind, Worker, WorkerShared};

/// Upper bound on supervised worker processes.
pub const MAX_PROCESSES: usize = 1024;

/// Sentinel pid for vacant slots.
pub const INVALID_PID: libc::pid_t = -1;

/// Pending control actions, as an atomic bitset.
pub mod actions {
    /// Graceful shutdown requested.
    pub const QUIT: u32 = 1;
    /// Immediate shutdown requested.
    pub const TERMINATE: u32 = 1 << 1;
    /// At least one child changed state.
    pub const REAP: u32 = 1 << 2;
    /// Configuration reload requested.
    pub const RECONFIGURE: u32 = 1 << 3;
    /// Log reopen requested.
    pub const REOPEN: u32 = 1 << 4;
    /// Out-of-band backup requested.
    pub const BACKUP: u32 = 1 << 5;
}

/// The pending actions of one process, set from signal handlers (via
/// [`merge_signals`]) or from control-channel commands, and drained by the
/// owning loop.
///
/// [`merge_signals`]: ProcessControl::merge_signals
#[derive(Debug)]
pub struct ProcessControl {
    doing: AtomicU32,
}

impl ProcessControl {
    /// Create an empty action set.
    pub fn new() -> ProcessControl {
        ProcessControl { doing: AtomicU32::new(0) }
    }

    /// Mark `action` pending.
    pub fn request(&self, action: u32) {
        let _ = self.doing.fetch_or(action, Ordering::AcqRel);
    }

    /// Whether any bit of `action` is pending.
    pub fn pending(&self, action: u32) -> bool {
        self.doing.load(Ordering::Acquire) & action != 0
    }

    /// Clear `action`, returning whether it was pending.
    pub fn take(&self, action: u32) -> bool {
        self.doing.fetch_and(!action, Ordering::AcqRel) & action != 0
    }

    /// Whether a graceful or immediate shutdown is pending.
    pub fn shutdown_pending(&self) -> bool {
        self.pending(actions::QUIT | actions::TERMINATE)
    }

    /// Drain the process-wide pending-signal set into this action set.
    pub fn merge_signals(&self) {
        for signal in signal::take_pending() {
            let action = match signal {
                Signal::Child => actions::REAP,
                Signal::Quit => actions::QUIT,
                Signal::Terminate | Signal::Interrupt => actions::TERMINATE,
                Signal::Reconfigure => actions::RECONFIGURE,
                Signal::ReopenLogs => actions::REOPEN,
                Signal::Backup => actions::BACKUP,
            };
            self.request(action);
        }
    }
}

impl Default for ProcessControl {
    fn default() -> ProcessControl {
        ProcessControl::new()
    }
}

/// A sibling worker process, as known inside a worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Peer {
    /// The sibling's pid, or [`INVALID_PID`].
    pub pid: libc::pid_t,
    /// Supervisor-side channel descriptor of the sibling, used to address
    /// it directly.
    pub master_fd: i32,
    /// Worker-side channel descriptor; only meaningful while closing
    /// inherited descriptors right after the fork.
    pub worker_fd: i32,
}

impl Peer {
    /// A vacant peer entry.
    pub fn vacant() -> Peer {
        Peer { pid: INVALID_PID, master_fd: NO_FD, worker_fd: NO_FD }
    }
}

/// Status of a supervised worker process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotStatus {
    /// Alive as far as the supervisor knows.
    Running,
    /// A shutdown command or signal was delivered.
    Exiting,
    /// Reaped.
    Exited,
}

/// Entry function run inside a freshly forked worker process. Must not
/// return control to the supervisor loop; [`worker_process_cycle`] is the
/// standard entry.
pub type WorkerEntry = fn(WorkerProcessContext);

/// Everything a worker process needs from the supervisor, captured at fork
/// time.
#[derive(Debug)]
pub struct WorkerProcessContext {
    /// This worker's slot index in the supervisor's table.
    pub slot: usize,
    /// Worker-side control channel descriptor.
    pub channel: i32,
    /// Snapshot of the process table; used to close inherited descriptors
    /// and seed the sibling table.
    pub peers: Vec<Peer>,
    /// Shared state created before the fork.
    pub shared: Arc<WorkerShared>,
    /// Opaque argument, preserved across respawns.
    pub arg: usize,
}

struct Slot {
    pid: libc::pid_t,
    channel: Option<ChannelPair>,
    entry: WorkerEntry,
    arg: usize,
    status: SlotStatus,
    old_generation: bool,
    last_restart: u64,
    exit_status: libc::c_int,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Slot")
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("old_generation", &self.old_generation)
            .field("last_restart", &self.last_restart)
            .finish()
    }
}

/// Forks, tracks and respawns worker processes.
pub struct Supervisor {
    slots: Vec<Slot>,
    shared: Arc<WorkerShared>,
    entry: WorkerEntry,
    clock: Clock,
}

impl Supervisor {
    /// Create a supervisor. `entry` is the function every worker process
    /// starts in.
    pub fn new(shared: Arc<WorkerShared>, entry: WorkerEntry) -> Supervisor {
        Supervisor {
            slots: Vec::new(),
            shared,
            entry,
            clock: Clock::new(),
        }
    }

    /// Install the signal surface, start the configured worker set and
    /// supervise it until a shutdown completes.
    pub fn run(&mut self) -> io::Result<()> {
        signal::install()?;
        signal::block()?;
        self.start_workers()?;

        let result = self.master_cycle();

        for slot in &mut self.slots {
            if let Some(pair) = slot.channel.take() {
                pair.close();
            }
        }
        result
    }

    fn master_cycle(&mut self) -> io::Result<()> {
        let mut live = true;
        let mut stopping = false;
        let mut sent_terminate = false;

        loop {
            signal::suspend()?;
            self.shared.control.merge_signals();

            if self.shared.control.take(actions::REAP) {
                debug!("reaping children");
                self.reap();
                live = if stopping {
                    self.live_workers()
                } else {
                    self.respawn_exited()
                };
            }

            if !live && self.shared.control.shutdown_pending() {
                return Ok(());
            }

            if self.shared.control.pending(actions::TERMINATE) && !sent_terminate {
                sent_terminate = true;
                if stopping {
                    // Escalation from an in-progress graceful quit; the
                    // channels are closed, only a signal can reach them.
                    self.kill_workers(Signal::Terminate);
                } else {
                    stopping = true;
                    self.signal_workers(Command::Terminate, Signal::Terminate);
                    self.mark_old_generation();
                }
                self.reap();
                live = self.live_workers();
                if !live {
                    return Ok(());
                }
                continue;
            }

            if self.shared.control.pending(actions::QUIT) && !stopping {
                stopping = true;
                self.signal_workers(Command::Quit, Signal::Quit);
                self.mark_old_generation();
                self.reap();
                live = self.live_workers();
                if !live {
                    return Ok(());
                }
                continue;
            }

            if self.shared.control.take(actions::RECONFIGURE) && !stopping {
                // Rolling restart: retire the current generation, bring up
                // a fresh one, never abruptly drop in-flight connections.
                debug!("reconfigure: rolling the worker set");
                self.signal_workers(Command::Quit, Signal::Quit);
                self.mark_old_generation();
                self.start_workers()?;
                live = true;
            }

            if self.shared.control.take(actions::BACKUP) && live && !stopping {
                self.broadcast_command(Command::Backup);
            }

            if self.shared.control.take(actions::REOPEN) && live && !stopping {
                self.broadcast_command(Command::Reopen);
            }
        }
    }

    /// Spawn the configured number of worker processes.
    pub fn start_workers(&mut self) -> io::Result<()> {
        for _ in 0..self.shared.config.worker_processes {
            let index = self.spawn(self.entry, 0, None)?;
            self.broadcast_open(index);
        }
        Ok(())
    }

    /// Fork one worker process into `slot_hint` (or the first free slot).
    ///
    /// The child runs `entry` and never returns here; the parent records
    /// the slot and returns its index.
    pub fn spawn(
        &mut self,
        entry: WorkerEntry,
        arg: usize,
        slot_hint: Option<usize>,
    ) -> io::Result<usize> {
        let index = match slot_hint {
            Some(index) => index,
            None => self
                .slots
                .iter()
                .position(|slot| slot.pid == INVALID_PID)
                .unwrap_or(self.slots.len()),
        };
        if index >= MAX_PROCESSES {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "process table exhausted",
            ));
        }

        let pair = ChannelPair::pair()?;

        // Snapshot the table for the child before forking; the child uses
        // it to close inherited ends and to address its siblings.
        let mut peers: Vec<Peer> = self
            .slots
            .iter()
            .map(|slot| Peer {
                pid: slot.pid,
                master_fd: slot.channel.map_or(NO_FD, |pair| pair.master),
                worker_fd: slot.channel.map_or(NO_FD, |pair| pair.worker),
            })
            .collect();
        if peers.len() <= index {
            peers.resize_with(index + 1, Peer::vacant);
        }
        peers[index] = Peer {
            pid: 0,
            master_fd: pair.master,
            worker_fd: pair.worker,
        };

        match unsafe { libc::fork() } {
            -1 => {
                let err = io::Error::last_os_error();
                pair.close();
                Err(err)
            }
            0 => {
                entry(WorkerProcessContext {
                    slot: index,
                    channel: pair.worker,
                    peers,
                    shared: self.shared.clone(),
                    arg,
                });
                // The entry must not fall back into the supervisor loop.
                std::process::exit(0);
            }
            pid => {
                trace!("spawned worker {} in slot {}", pid, index);
                let slot = Slot {
                    pid,
                    channel: Some(pair),
                    entry,
                    arg,
                    status: SlotStatus::Running,
                    old_generation: false,
                    last_restart: self.clock.now_secs(),
                    exit_status: 0,
                };
                if index == self.slots.len() {
                    self.slots.push(slot);
                } else {
                    self.slots[index] = slot;
                }
                Ok(index)
            }
        }
    }

    /// Announce the worker in `new_index` to every other live worker, so
    /// siblings can address it later. Only the supervisor knows every
    /// slot.
    fn broadcast_open(&self, new_index: usize) {
        let new_slot = match self.slots.get(new_index) {
            Some(slot) if slot.pid != INVALID_PID => slot,
            _ => return,
        };
        let message = Message {
            command: Command::Open,
            pid: new_slot.pid,
            slot: new_index as i32,
            fd: new_slot.channel.map_or(NO_FD, |pair| pair.master),
        };

        for (index, slot) in self.slots.iter().enumerate() {
            if index == new_index
                || slot.pid == INVALID_PID
                || slot.status != SlotStatus::Running
                || slot.old_generation
            {
                continue;
            }
            let master = match slot.channel {
                Some(pair) => pair.master,
                None => continue,
            };
            if let Err(err) = channel::send(master, &message) {
                warn!("announcing worker {} to slot {} failed: {}", new_slot.pid, index, err);
            }
        }
    }

    /// Send `command` to every live, non-retired worker over its channel,
    /// falling back to the OS signal when the write fails. Either way the
    /// slot is marked exiting and its channel is considered closed.
    pub fn signal_workers(&mut self, command: Command, fallback: Signal) {
        let message = Message::command(command);

        for index in 0..self.slots.len() {
            let (pid, pair, skip) = {
                let slot = &self.slots[index];
                let skip = slot.pid == INVALID_PID
                    || slot.old_generation
                    || slot.status == SlotStatus::Exited;
                (slot.pid, slot.channel, skip)
            };
            if skip {
                continue;
            }

            let delivered = match pair {
                Some(pair) => channel::send(pair.master, &message).is_ok(),
                None => false,
            };
            if !delivered {
                debug!("kill({}, {:?})", pid, fallback);
                if let Err(err) = signal::send(pid, fallback) {
                    error!("kill({}, {:?}) failed: {}", pid, fallback, err);
                }
            }

            let slot = &mut self.slots[index];
            slot.status = SlotStatus::Exiting;
            if let Some(pair) = slot.channel.take() {
                pair.close();
            }
        }
    }

    /// Deliver an OS signal to every not-yet-reaped worker, ignoring the
    /// retirement flag. Used to escalate a graceful quit.
    fn kill_workers(&mut self, fallback: Signal) {
        for slot in &mut self.slots {
            if slot.pid == INVALID_PID || slot.status == SlotStatus::Exited {
                continue;
            }
            if let Err(err) = signal::send(slot.pid, fallback) {
                error!("kill({}, {:?}) failed: {}", slot.pid, fallback, err);
            }
            slot.status = SlotStatus::Exiting;
        }
    }

    /// Send `command` to every live worker that still has a channel.
    pub fn broadcast_command(&self, command: Command) {
        let message = Message::command(command);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.pid == INVALID_PID || slot.status != SlotStatus::Running {
                continue;
            }
            if let Some(pair) = slot.channel {
                if let Err(err) = channel::send(pair.master, &message) {
                    warn!("sending {} to slot {} failed: {}", command, index, err);
                }
            }
        }
    }

    /// Collect exited children without blocking.
    pub fn reap(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid == 0 {
                return;
            }
            if pid == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // ECHILD: nothing left to wait for.
                return;
            }
            match self.slots.iter_mut().find(|slot| slot.pid == pid) {
                Some(slot) => {
                    slot.status = SlotStatus::Exited;
                    slot.exit_status = status;
                    debug!("worker {} exited with status {:#x}", pid, status);
                }
                None => debug!("reaped unknown child {}", pid),
            }
        }
    }

    /// Respawn exited workers, preserving their entry and argument.
    ///
    /// A retired (old-generation) slot is detached and never respawned. A
    /// slot that exited within the rapid-restart window is treated as a
    /// crash loop: it is left dead and an alert is logged. Returns whether
    /// any worker is still live.
    pub fn respawn_exited(&mut self) -> bool {
        let mut live = false;

        for index in 0..self.slots.len() {
            let (pid, status, old, last_restart, entry, arg, exit_status) = {
                let slot = &self.slots[index];
                (
                    slot.pid,
                    slot.status,
                    slot.old_generation,
                    slot.last_restart,
                    slot.entry,
                    slot.arg,
                    slot.exit_status,
                )
            };
            if pid == INVALID_PID {
                continue;
            }
            if status != SlotStatus::Exited {
                live = true;
                continue;
            }

            // Detach the dead process.
            {
                let slot = &mut self.slots[index];
                slot.pid = INVALID_PID;
                if let Some(pair) = slot.channel.take() {
                    pair.close();
                }
            }
            if old {
                self.slots[index].old_generation = false;
                continue;
            }

            if !outside_restart_window(
                self.clock.now_secs(),
                last_restart,
                self.shared.config.restart_window_secs,
            ) {
                error!(
                    "worker slot {} (status {:#x}) exited within {}s of its last start; treating as a crash loop, not respawning",
                    index, exit_status, self.shared.config.restart_window_secs
                );
                continue;
            }

            match self.spawn(entry, arg, Some(index)) {
                Ok(spawned) => {
                    debug!("respawned worker slot {}", spawned);
                    self.broadcast_open(spawned);
                    live = true;
                }
                Err(err) => error!("respawning worker slot {} failed: {}", index, err),
            }
        }

        live
    }

    /// Flag every running worker as belonging to the old generation, so a
    /// subsequent reap retires it instead of respawning it.
    pub fn mark_old_generation(&mut self) {
        for slot in &mut self.slots {
            if slot.pid != INVALID_PID && slot.status == SlotStatus::Running {
                slot.old_generation = true;
            }
        }
    }

    /// Whether any worker has not been reaped yet.
    pub fn live_workers(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.pid != INVALID_PID && slot.status != SlotStatus::Exited)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Supervisor").field("slots", &self.slots).finish()
    }
}

fn outside_restart_window(now_secs: u64, last_restart: u64, window_secs: u64) -> bool {
    now_secs.saturating_sub(last_restart) > window_secs
}

/// The standard worker-process entry: run the configured execution units
/// until the supervisor orders a shutdown, then exit the process.
pub fn worker_process_cycle(ctx: WorkerProcessContext) {
    let slot = ctx.slot;
    match worker_process(ctx) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!("worker process (slot {}) failed: {}", slot, err);
            std::process::exit(1);
        }
    }
}

fn worker_process(ctx: WorkerProcessContext) -> io::Result<()> {
    signal::unblock_all()?;

    // Close the channel ends this process must not hold: every sibling's
    // worker end and the supervisor end of our own channel.
    for (index, peer) in ctx.peers.iter().enumerate() {
        if index != ctx.slot {
            channel::close_fd(peer.worker_fd);
        }
    }
    if let Some(own) = ctx.peers.get(ctx.slot) {
        channel::close_fd(own.master_fd);
    }

    // Seed the sibling table with what the supervisor knew at fork time.
    {
        let mut peers = match ctx.shared.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *peers = ctx
            .peers
            .iter()
            .enumerate()
            .map(|(index, peer)| {
                if index == ctx.slot {
                    Peer::vacant()
                } else {
                    Peer {
                        pid: peer.pid,
                        master_fd: peer.master_fd,
                        worker_fd: NO_FD,
                    }
                }
            })
            .collect();
    }

    let io_units = ctx.shared.config.io_units;
    let registry = Arc::new(Registry::new());
    registry.add_total(io_units);
    let units = spawn_io_units(&ctx.shared, io_units, &registry)?;
    registry.wait_ready();

    // The control unit runs on the process's main thread and owns the
    // worker end of the control channel.
    let mut control = Worker::new(io_units as u32, UnitKind::Control, ctx.shared.clone())?;
    let token = control.pool.admit_borrowed(ctx.channel)?;
    if let Some(conn) = control.pool.get_mut(token) {
        conn.read.handler = Some(worker::channel_handler);
    }
    control.register(token, Direction::Read, RegisterOption::Level)?;

    loop {
        // Fallback signals land in the pending set; fold them in alongside
        // channel commands.
        ctx.shared.control.merge_signals();
        if ctx.shared.control.shutdown_pending() {
            break;
        }
        if let Err(err) = control.cycle() {
            error!("control unit failed: {}", err);
            break;
        }
    }

    units.stop();
    registry.wait_exit();
    units.join();

    // The channel handler may already have torn the descriptor down after
    // the supervisor closed its end.
    if control.pool.get(token).is_some() {
        channel::close_fd(ctx.channel);
    }
    Ok(())
}

/// Write the current pid to `path` as decimal text.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    let pid = unsafe { libc::getpid() };
    fs::write(path, format!("{}\n", pid))
}

/// Read a pid back from `path`.
pub fn read_pid_file(path: &Path) -> io::Result<libc::pid_t> {
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed pid file"))
}

/// Remove the pid file; failures are logged, not fatal.
pub fn remove_pid_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("removing pid file {} failed: {}", path.display(), err);
        }
    }
}

/// Whether a previous instance is already running: its pid file exists and
/// the recorded process answers a liveness probe.
pub fn check_running(path: &Path) -> bool {
    match read_pid_file(path) {
        Ok(pid) => signal::alive(pid),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{actions, outside_restart_window, ProcessControl};

    #[test]
    fn control_flags() {
        let control = ProcessControl::new();
        assert!(!control.shutdown_pending());

        control.request(actions::REAP);
        control.request(actions::QUIT);
        assert!(control.pending(actions::REAP));
        assert!(control.shutdown_pending());

        assert!(control.take(actions::REAP));
        assert!(!control.pending(actions::REAP));
        // Quit stays pending until taken.
        assert!(control.pending(actions::QUIT));
        assert!(!control.take(actions::REAP));
    }

    #[test]
    fn restart_window_decision() {
        // Survived longer than the window: eligible for respawn.
        assert!(outside_restart_window(120, 40, 60));
        // Crashed within the window: left dead.
        assert!(!outside_restart_window(80, 40, 60));
        assert!(!outside_restart_window(100, 40, 60));
        // Clock going backwards must not underflow.
        assert!(!outside_restart_window(10, 40, 60));
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "datanode-core-pid-test-{}",
            unsafe { libc::getpid() }
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("datanoded.pid");

        super::write_pid_file(&path).unwrap();
        assert_eq!(super::read_pid_file(&path).unwrap(), unsafe {
            libc::getpid()
        });
        // This process is alive, so it counts as running.
        assert!(super::check_running(&path));

        super::remove_pid_file(&path);
        assert!(!super::check_running(&path));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
