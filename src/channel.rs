//! Control-message transport between the supervisor and worker processes.
//!
//! Each worker slot owns a full-duplex `socketpair`; the supervisor keeps
//! the master end, the worker keeps the worker end. Messages are a fixed
//! 16-byte record and are sent over non-blocking descriptors: senders and
//! receivers get `WouldBlock` instead of stalling the event loop.
//!
//! The descriptor field of a message is advisory; siblings look the slot up
//! locally rather than receiving the descriptor itself.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use log::error;

/// Commands carried by a control message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// No action.
    None,
    /// Announce a new sibling: its pid, slot and channel descriptor.
    Open,
    /// A sibling's channel endpoint should be closed.
    Close,
    /// Graceful shutdown.
    Quit,
    /// Immediate shutdown.
    Terminate,
    /// Reopen log output.
    Reopen,
    /// Trigger an out-of-band maintenance action.
    Backup,
}

impl Command {
    /// Convert the command into its wire value.
    pub fn into_raw(self) -> u32 {
        match self {
            Command::None => 0,
            Command::Open => 1,
            Command::Close => 2,
            Command::Quit => 3,
            Command::Terminate => 4,
            Command::Reopen => 5,
            Command::Backup => 6,
        }
    }

    /// Convert a wire value into a command.
    pub fn from_raw(raw: u32) -> Option<Command> {
        match raw {
            0 => Some(Command::None),
            1 => Some(Command::Open),
            2 => Some(Command::Close),
            3 => Some(Command::Quit),
            4 => Some(Command::Terminate),
            5 => Some(Command::Reopen),
            6 => Some(Command::Backup),
            _ => None,
        }
    }
}

/// Wire size of a control message.
pub const MESSAGE_SIZE: usize = 16;

/// Sentinel descriptor value for messages that carry none.
pub const NO_FD: i32 = -1;

/// A fixed-size control message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// The command to execute.
    pub command: Command,
    /// Sender's process id.
    pub pid: i32,
    /// Sender's slot index in the process table.
    pub slot: i32,
    /// Descriptor to hand off, or [`NO_FD`].
    pub fd: i32,
}

impl Message {
    /// A message carrying only a command.
    pub fn command(command: Command) -> Message {
        Message {
            command,
            pid: unsafe { libc::getpid() },
            slot: -1,
            fd: NO_FD,
        }
    }

    fn to_bytes(self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0; MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&self.command.into_raw().to_ne_bytes());
        buf[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.slot.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.fd.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; MESSAGE_SIZE]) -> io::Result<Message> {
        let mut field = [0; 4];
        field.copy_from_slice(&buf[0..4]);
        let command = Command::from_raw(u32::from_ne_bytes(field)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unknown channel command")
        })?;
        field.copy_from_slice(&buf[4..8]);
        let pid = i32::from_ne_bytes(field);
        field.copy_from_slice(&buf[8..12]);
        let slot = i32::from_ne_bytes(field);
        field.copy_from_slice(&buf[12..16]);
        let fd = i32::from_ne_bytes(field);
        Ok(Message { command, pid, slot, fd })
    }
}

/// Write one message to a non-blocking channel descriptor.
///
/// Interrupted writes are retried; a full socket buffer surfaces as
/// `WouldBlock` so the caller can fall back to an OS signal.
pub fn send(fd: RawFd, message: &Message) -> io::Result<()> {
    let buf = message.to_bytes();
    loop {
        let n = unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, MESSAGE_SIZE)
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n as usize != MESSAGE_SIZE {
            // SOCK_STREAM on a socketpair never splits a 16-byte write
            // unless the peer is gone mid-write.
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short channel write",
            ));
        }
        return Ok(());
    }
}

/// Read one message from a non-blocking channel descriptor.
///
/// Returns `Ok(None)` when no message is queued (`WouldBlock`). A read of
/// zero bytes means the peer closed its end and is reported as
/// `UnexpectedEof`; the caller must tear down its wrapper for the
/// descriptor.
pub fn recv(fd: RawFd) -> io::Result<Option<Message>> {
    let mut buf = [0; MESSAGE_SIZE];
    loop {
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, MESSAGE_SIZE)
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel peer is gone",
            ));
        }
        if n as usize != MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short channel read",
            ));
        }
        return Ok(Some(Message::from_bytes(&buf)?));
    }
}

/// Both ends of one worker slot's control channel.
///
/// The pair is created before forking; the supervisor keeps (and writes to)
/// the master end, the worker process keeps the worker end. Ends are closed
/// explicitly, since after a fork both processes hold copies of both
/// descriptors, so ownership cannot be tied to a single struct instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelPair {
    /// Supervisor-side descriptor.
    pub master: RawFd,
    /// Worker-side descriptor.
    pub worker: RawFd,
}

impl ChannelPair {
    /// Create a connected pair, both ends non-blocking and close-on-exec.
    pub fn pair() -> io::Result<ChannelPair> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        } == -1
        {
            return Err(io::Error::last_os_error());
        }

        let pair = ChannelPair { master: fds[0], worker: fds[1] };
        for &fd in &fds {
            if let Err(err) = set_nonblocking_cloexec(fd) {
                pair.close();
                return Err(err);
            }
        }
        Ok(pair)
    }

    /// Close both ends, logging failures.
    pub fn close(self) {
        close_fd(self.master);
        close_fd(self.worker);
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1
        || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
        || unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Close a single channel descriptor, logging failures.
pub fn close_fd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    if unsafe { libc::close(fd) } == -1 {
        error!(
            "closing channel fd {} failed: {}",
            fd,
            io::Error::last_os_error()
        );
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Command::None => "none",
            Command::Open => "open",
            Command::Close => "close",
            Command::Quit => "quit",
            Command::Terminate => "terminate",
            Command::Reopen => "reopen",
            Command::Backup => "backup",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{recv, send, ChannelPair, Command, Message, NO_FD};

    #[test]
    fn send_and_drain() {
        let pair = ChannelPair::pair().unwrap();

        let open = Message {
            command: Command::Open,
            pid: 1234,
            slot: 3,
            fd: 9,
        };
        send(pair.master, &open).unwrap();
        send(pair.master, &Message::command(Command::Quit)).unwrap();

        // Receiver drains queued messages until would-block.
        assert_eq!(recv(pair.worker).unwrap(), Some(open));
        let quit = recv(pair.worker).unwrap().unwrap();
        assert_eq!(quit.command, Command::Quit);
        assert_eq!(quit.fd, NO_FD);
        assert_eq!(recv(pair.worker).unwrap(), None);

        pair.close();
    }

    #[test]
    fn peer_gone_is_unexpected_eof() {
        let pair = ChannelPair::pair().unwrap();
        super::close_fd(pair.master);

        let err = recv(pair.worker).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        super::close_fd(pair.worker);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(Command::from_raw(42), None);
        assert_eq!(Command::from_raw(3), Some(Command::Quit));
    }
}
