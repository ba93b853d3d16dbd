//! Process control signals.
//!
//! The supervisor maps a small set of OS signals onto control actions:
//! reload configuration, graceful quit, immediate terminate, log reopen, a
//! custom backup trigger and child reaping. Handlers do nothing but set a
//! bit in a pending set; the supervisor drains the set from its own loop
//! after `sigsuspend` returns, keeping the handlers async-signal-safe.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Control signals understood by the supervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    /// A child process changed state. `SIGCHLD`.
    Child,
    /// Graceful shutdown. `SIGQUIT`.
    Quit,
    /// Immediate shutdown. `SIGTERM`.
    Terminate,
    /// Immediate shutdown from a terminal. `SIGINT`.
    Interrupt,
    /// Reload configuration with a fresh worker set. `SIGHUP`.
    Reconfigure,
    /// Reopen log output. `SIGUSR1`.
    ReopenLogs,
    /// Trigger the out-of-band backup action. `SIGUSR2`.
    Backup,
}

/// Every signal the supervisor reacts to.
pub const CONTROL_SIGNALS: [Signal; 7] = [
    Signal::Child,
    Signal::Quit,
    Signal::Terminate,
    Signal::Interrupt,
    Signal::Reconfigure,
    Signal::ReopenLogs,
    Signal::Backup,
];

impl Signal {
    /// Convert the signal into a raw Unix signal number.
    pub fn into_raw(self) -> libc::c_int {
        match self {
            Signal::Child => libc::SIGCHLD,
            Signal::Quit => libc::SIGQUIT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Interrupt => libc::SIGINT,
            Signal::Reconfigure => libc::SIGHUP,
            Signal::ReopenLogs => libc::SIGUSR1,
            Signal::Backup => libc::SIGUSR2,
        }
    }

    /// Convert a raw Unix signal number into a control signal.
    pub fn from_raw(raw: libc::c_int) -> Option<Signal> {
        match raw {
            libc::SIGCHLD => Some(Signal::Child),
            libc::SIGQUIT => Some(Signal::Quit),
            libc::SIGTERM => Some(Signal::Terminate),
            libc::SIGINT => Some(Signal::Interrupt),
            libc::SIGHUP => Some(Signal::Reconfigure),
            libc::SIGUSR1 => Some(Signal::ReopenLogs),
            libc::SIGUSR2 => Some(Signal::Backup),
            _ => None,
        }
    }

    fn bit(self) -> u32 {
        1 << match self {
            Signal::Child => 0,
            Signal::Quit => 1,
            Signal::Terminate => 2,
            Signal::Interrupt => 3,
            Signal::Reconfigure => 4,
            Signal::ReopenLogs => 5,
            Signal::Backup => 6,
        }
    }
}

// Written by the signal handler, drained by `take_pending`. This is the one
// piece of state that cannot live in a context object: the handler has no
// other way to reach it.
static PENDING: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_signal(raw: libc::c_int) {
    if let Some(signal) = Signal::from_raw(raw) {
        let _ = PENDING.fetch_or(signal.bit(), Ordering::Relaxed);
    }
}

/// Install the control-signal handlers.
///
/// Also ignores `SIGPIPE`: a worker dying mid-write on its channel must
/// surface as an `EPIPE` write error, not kill the supervisor.
pub fn install() -> io::Result<()> {
    if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    for &signal in CONTROL_SIGNALS.iter() {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        let handler: extern "C" fn(libc::c_int) = on_signal;
        action.sa_sigaction = handler as usize;
        if unsafe { libc::sigemptyset(&mut action.sa_mask) } == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::sigaction(signal.into_raw(), &action, ptr::null_mut()) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn control_sigset() -> io::Result<libc::sigset_t> {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigemptyset(&mut set) } == -1 {
        return Err(io::Error::last_os_error());
    }
    for &signal in CONTROL_SIGNALS.iter() {
        if unsafe { libc::sigaddset(&mut set, signal.into_raw()) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(set)
}

/// Block the control signals so they are only delivered inside
/// [`suspend`].
pub fn block() -> io::Result<()> {
    let set = control_sigset()?;
    if unsafe { libc::sigprocmask(libc::SIG_BLOCK, &set, ptr::null_mut()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Clear the signal mask. Worker processes call this after forking so they
/// receive fallback signals from the supervisor.
pub fn unblock_all() -> io::Result<()> {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigemptyset(&mut set) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::sigprocmask(libc::SIG_SETMASK, &set, ptr::null_mut()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait for a control signal to be delivered.
pub fn suspend() -> io::Result<()> {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigemptyset(&mut set) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // sigsuspend always returns -1 with EINTR once a signal was handled.
    let _ = unsafe { libc::sigsuspend(&set) };
    Ok(())
}

/// Drain the pending signal set.
pub fn take_pending() -> Vec<Signal> {
    let bits = PENDING.swap(0, Ordering::Relaxed);
    CONTROL_SIGNALS
        .iter()
        .cloned()
        .filter(|signal| bits & signal.bit() != 0)
        .collect()
}

/// Send `signal` to the process `pid`.
pub fn send(pid: libc::pid_t, signal: Signal) -> io::Result<()> {
    if unsafe { libc::kill(pid, signal.into_raw()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether the process `pid` is alive, probed with a null signal.
pub fn alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
